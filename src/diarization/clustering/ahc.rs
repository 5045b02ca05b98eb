//! Agglomerative hierarchical clustering, centroid linkage
//!
//! Builds a SciPy-format dendrogram over row-normalized rho vectors using
//! the Lance-Williams centroid update, then cuts it at a distance derived
//! from the user's cosine-similarity threshold. The cut walks the tree from
//! the root so every merged subtree below the cut becomes one cluster.

use crate::error::DiarizationError;
use ndarray::Array2;
use thiserror::Error;
use tracing::debug;

/// One dendrogram row: the two merged cluster ids, the centroid distance at
/// the merge, and the merged leaf count. Leaves are ids `0..n`; the merge at
/// step `k` creates id `n + k`.
#[derive(Debug, Clone, Default)]
pub struct DendrogramNode {
    pub left: usize,
    pub right: usize,
    pub distance: f64,
    pub size: usize,
}

/// Failure modes of the dendrogram routine.
#[derive(Debug, Error)]
pub enum DendrogramError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cluster index overflow")]
    IndexOverflow,

    #[error("output buffer too small: need {needed} rows, got {got}")]
    OutputBufferTooSmall { needed: usize, got: usize },

    #[error("allocation failure")]
    AllocationFailure,

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<DendrogramError> for DiarizationError {
    fn from(err: DendrogramError) -> Self {
        DiarizationError::processing(format!("dendrogram computation failed: {}", err))
    }
}

/// Cluster rho vectors by centroid-linkage AHC.
///
/// `threshold_tau` is a cosine similarity in `[-1, 1]`; it converts to the
/// distance cut `sqrt(max(0, 2 - 2*tau))`. Returns contiguous labels in
/// `[0, K)` ordered by first appearance.
pub fn cluster(rho: &[Vec<f64>], threshold_tau: f64) -> Result<Vec<usize>, DiarizationError> {
    if rho.is_empty() {
        return Ok(Vec::new());
    }
    if rho.len() == 1 {
        return Ok(vec![0]);
    }

    let dim = rho[0].len();
    if dim == 0 || rho.iter().any(|r| r.len() != dim) {
        return Err(DiarizationError::processing(
            "rho vectors have inconsistent dimensions",
        ));
    }
    if rho.iter().flatten().any(|v| !v.is_finite()) {
        return Err(DiarizationError::processing(
            "rho vectors contain non-finite values",
        ));
    }

    // Row-normalize so cosine similarity and euclidean distance agree.
    let n = rho.len();
    let mut points = Array2::zeros((n, dim));
    for (i, row) in rho.iter().enumerate() {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        let scale = if norm > 0.0 { 1.0 / norm } else { 0.0 };
        for (j, &v) in row.iter().enumerate() {
            points[[i, j]] = v * scale;
        }
    }

    let mut nodes = vec![DendrogramNode::default(); n - 1];
    compute_dendrogram(&points, &mut nodes)?;

    let cut = (2.0 - 2.0 * threshold_tau).max(0.0).sqrt();
    let labels = cut_dendrogram(&nodes, n, cut);
    let clusters = labels.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    debug!(
        "AHC over {} vectors at tau {:.3} (cut {:.3}): {} clusters",
        n, threshold_tau, cut, clusters
    );
    Ok(labels)
}

/// Fill `out` with the `n - 1` merges of a centroid-linkage dendrogram.
///
/// Squared centroid distances are maintained under the Lance-Williams
/// update; ties pick the pair with the numerically smaller child index.
pub fn compute_dendrogram(
    points: &Array2<f64>,
    out: &mut [DendrogramNode],
) -> Result<(), DendrogramError> {
    let n = points.nrows();
    if n < 2 {
        return Err(DendrogramError::InvalidArgument(format!(
            "need at least 2 points, got {}",
            n
        )));
    }
    if points.ncols() == 0 {
        return Err(DendrogramError::InvalidArgument("zero-dimensional points".into()));
    }
    if points.iter().any(|v| !v.is_finite()) {
        return Err(DendrogramError::InvalidArgument("non-finite coordinates".into()));
    }
    if out.len() < n - 1 {
        return Err(DendrogramError::OutputBufferTooSmall {
            needed: n - 1,
            got: out.len(),
        });
    }
    // Merged ids reach 2n - 2 and must stay representable in the 32-bit
    // dendrogram layout.
    if n > (i32::MAX as usize / 2) {
        return Err(DendrogramError::IndexOverflow);
    }
    let matrix_len = n.checked_mul(n).ok_or(DendrogramError::AllocationFailure)?;

    let dim = points.ncols();
    let mut centroids: Vec<Vec<f64>> = (0..n).map(|i| points.row(i).to_vec()).collect();
    let mut sizes = vec![1usize; n];
    let mut ids: Vec<usize> = (0..n).collect();
    let mut active = vec![true; n];

    let mut d2 = vec![0.0f64; matrix_len];
    for i in 0..n {
        for j in (i + 1)..n {
            let dist: f64 = (0..dim)
                .map(|k| {
                    let delta = centroids[i][k] - centroids[j][k];
                    delta * delta
                })
                .sum();
            d2[i * n + j] = dist;
            d2[j * n + i] = dist;
        }
    }

    for step in 0..n - 1 {
        // Closest active pair; ties resolved toward smaller child ids.
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                let dist = d2[i * n + j];
                let better = match best {
                    None => true,
                    Some((bi, bj, bd)) => {
                        let (lo, hi) = (ids[i].min(ids[j]), ids[i].max(ids[j]));
                        let (blo, bhi) = (ids[bi].min(ids[bj]), ids[bi].max(ids[bj]));
                        dist < bd || (dist == bd && (lo, hi) < (blo, bhi))
                    }
                };
                if better {
                    best = Some((i, j, dist));
                }
            }
        }
        let (i, j, dist) = best.ok_or_else(|| {
            DendrogramError::Runtime(format!("no mergeable pair at step {}", step))
        })?;

        let (si, sj) = (sizes[i] as f64, sizes[j] as f64);
        out[step] = DendrogramNode {
            left: ids[i].min(ids[j]),
            right: ids[i].max(ids[j]),
            distance: dist.max(0.0).sqrt(),
            size: sizes[i] + sizes[j],
        };

        // Lance-Williams centroid update on squared distances.
        let total = si + sj;
        for k in 0..n {
            if !active[k] || k == i || k == j {
                continue;
            }
            let dik = d2[i * n + k];
            let djk = d2[j * n + k];
            let updated = (si * dik + sj * djk) / total - si * sj * dist / (total * total);
            d2[i * n + k] = updated;
            d2[k * n + i] = updated;
        }

        for k in 0..dim {
            centroids[i][k] = (si * centroids[i][k] + sj * centroids[j][k]) / total;
        }
        sizes[i] += sizes[j];
        ids[i] = n + step;
        active[j] = false;
    }

    Ok(())
}

/// Cut the dendrogram at `max_distance`, walking from the root: a merge at
/// or below the cut labels its whole leaf subtree with one cluster; leaves
/// reached above the cut become singletons. Labels are relabeled contiguous
/// in order of first appearance over the leaf indices.
fn cut_dendrogram(nodes: &[DendrogramNode], n: usize, max_distance: f64) -> Vec<usize> {
    let mut labels = vec![usize::MAX; n];
    let mut next = 0usize;

    let root = n + nodes.len() - 1;
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if id < n {
            labels[id] = next;
            next += 1;
            continue;
        }
        let node = &nodes[id - n];
        if node.distance <= max_distance {
            let cluster = next;
            next += 1;
            let mut leaves = vec![node.left, node.right];
            while let Some(leaf_id) = leaves.pop() {
                if leaf_id < n {
                    labels[leaf_id] = cluster;
                } else {
                    let inner = &nodes[leaf_id - n];
                    leaves.push(inner.left);
                    leaves.push(inner.right);
                }
            }
        } else {
            stack.push(node.right);
            stack.push(node.left);
        }
    }

    // Contiguous relabel by first appearance in leaf order.
    let mut remap = vec![usize::MAX; next];
    let mut assigned = 0usize;
    for label in &mut labels {
        let slot = &mut remap[*label];
        if *slot == usize::MAX {
            *slot = assigned;
            assigned += 1;
        }
        *label = *slot;
    }
    labels
}
