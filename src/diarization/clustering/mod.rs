//! Two-stage speaker clustering
//!
//! AHC provides a centroid-linkage warm-start over the PLDA-projected
//! embeddings; VBx refines the assignment with a variational EM loop. The
//! facade here turns the per-embedding labels into per-chunk local-speaker
//! assignment vectors for timeline reconstruction.

pub mod ahc;
pub mod vbx;

pub use ahc::{cluster as ahc_cluster, compute_dendrogram, DendrogramError, DendrogramNode};
pub use vbx::{refine as vbx_refine, VbxOptions, VbxResult};

use super::types::{ChunkAssignment, TimedEmbedding, LOCAL_SPEAKERS};
use crate::config::{ClusteringConfig, VbxConfig};
use crate::error::DiarizationError;
use ndarray::Array2;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of clustering all (chunk, local speaker) embeddings.
#[derive(Debug, Clone, Default)]
pub struct ClusteringOutcome {
    /// Final cluster label per input embedding, contiguous in `[0, K)`
    pub labels: Vec<usize>,

    /// Number of distinct clusters K
    pub cluster_count: usize,

    /// Per-chunk assignment of local speaker slots to clusters
    pub assignments: HashMap<usize, ChunkAssignment>,

    /// Whether VBx fell back to a unit psi diagonal
    pub psi_fallback: bool,
}

/// AHC warm-start followed by VBx refinement.
pub struct Clusterer {
    config: ClusteringConfig,
    vbx: VbxConfig,
}

impl Clusterer {
    pub fn new(config: ClusteringConfig, vbx: VbxConfig) -> Self {
        Self { config, vbx }
    }

    /// Cluster the embeddings and project labels back onto chunks.
    /// Runs to completion on the calling task; cancellation is observed at
    /// VBx iteration boundaries.
    pub fn cluster(
        &self,
        embeddings: &[TimedEmbedding],
        psi: &[f64],
        cancel: &CancellationToken,
    ) -> Result<ClusteringOutcome, DiarizationError> {
        if embeddings.is_empty() {
            return Ok(ClusteringOutcome::default());
        }

        let dim = embeddings[0].rho.len();
        if dim == 0 || embeddings.iter().any(|e| e.rho.len() != dim) {
            return Err(DiarizationError::processing(
                "rho vectors have inconsistent dimensions",
            ));
        }

        let rho_rows: Vec<Vec<f64>> = embeddings.iter().map(|e| e.rho.clone()).collect();
        let warm_start = ahc::cluster(&rho_rows, self.config.threshold)?;
        debug!(
            "AHC warm-start: {} clusters over {} embeddings",
            warm_start.iter().max().map(|m| m + 1).unwrap_or(0),
            warm_start.len()
        );

        let n = embeddings.len();
        let mut rho = Array2::zeros((n, dim));
        for (i, row) in rho_rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                rho[[i, j]] = v;
            }
        }

        let options = VbxOptions {
            fa: self.config.warm_start_fa,
            fb: self.config.warm_start_fb,
            max_iterations: self.vbx.max_iterations,
            convergence_tolerance: self.vbx.convergence_tolerance,
        };
        let refined = vbx::refine(&rho, &warm_start, psi, &options, cancel)?;
        debug!(
            "VBx converged after {} iterations (final ELBO {:.4})",
            refined.elbo_trace.len(),
            refined.elbo_trace.last().copied().unwrap_or(f64::NAN)
        );

        // VBx can leave warm-start clusters empty; compact to [0, K) in
        // order of first appearance so timeline labels stay dense.
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut labels = Vec::with_capacity(n);
        for &label in &refined.labels {
            let next = remap.len();
            labels.push(*remap.entry(label).or_insert(next));
        }
        let cluster_count = remap.len();

        let mut assignments: HashMap<usize, ChunkAssignment> = HashMap::new();
        for (embedding, &label) in embeddings.iter().zip(&labels) {
            let slots = assignments
                .entry(embedding.chunk_index)
                .or_insert([-1; LOCAL_SPEAKERS]);
            slots[embedding.local_speaker] = label as i32;
        }

        info!(
            "clustering complete: {} speakers across {} chunks",
            cluster_count,
            assignments.len()
        );
        Ok(ClusteringOutcome {
            labels,
            cluster_count,
            assignments,
            psi_fallback: refined.psi_fallback,
        })
    }
}
