//! Diarization pipeline
//!
//! Drives the ordered stages: sliding-window segmentation, mask
//! conditioning and embedding extraction, AHC + VBx clustering, and
//! timeline reconstruction. Segmentation and embedding run concurrently
//! over a bounded chunk channel so embedding work starts on early chunks
//! while later windows are still being scored.

use super::clustering::Clusterer;
use super::embedder::{EmbeddingExtractor, ExtractionOutcome};
use super::segmentation::SegmentationRunner;
use super::timeline::TimelineReconstructor;
use super::types::{DiarizationResult, StageTimings, TimedEmbedding, TimedSpeakerSegment};
use crate::audio::AudioSource;
use crate::config::DiarizationConfig;
use crate::error::DiarizationError;
use crate::inference::{BufferPool, ModelPredictor, PldaParameters, PldaTransform};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handles to the four neural models the pipeline consumes. All handles are
/// shared read-only; backends that are not internally thread-safe must
/// serialize access themselves.
#[derive(Clone)]
pub struct ModelSet {
    pub segmentation: Arc<dyn ModelPredictor>,
    pub fbank: Arc<dyn ModelPredictor>,
    pub embedding: Arc<dyn ModelPredictor>,
    pub plda: Arc<dyn ModelPredictor>,
}

/// Offline speaker diarization pipeline.
///
/// ```no_run
/// # async fn run(models: diarium::diarization::ModelSet, psi: diarium::inference::PldaParameters) {
/// use diarium::audio::MemoryAudioSource;
/// use diarium::config::DiarizationConfig;
/// use diarium::diarization::DiarizationPipeline;
///
/// let pipeline = DiarizationPipeline::new(DiarizationConfig::default(), models, psi).unwrap();
/// let source = MemoryAudioSource::new(vec![0.0; 16_000 * 60]);
/// let result = pipeline.diarize(&source).await.unwrap();
/// for segment in &result.segments {
///     println!("{}: {:.2}-{:.2}s", segment.speaker_id, segment.start_s, segment.end_s);
/// }
/// # }
/// ```
pub struct DiarizationPipeline {
    config: DiarizationConfig,
    models: ModelSet,
    plda_parameters: PldaParameters,
    pool: Arc<BufferPool>,
}

impl std::fmt::Debug for DiarizationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiarizationPipeline")
            .field("config", &self.config)
            .field("plda_parameters", &self.plda_parameters)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl DiarizationPipeline {
    /// Validate the configuration and build the pipeline. Configuration
    /// bounds are enforced here, before any model is touched.
    pub fn new(
        config: DiarizationConfig,
        models: ModelSet,
        plda_parameters: PldaParameters,
    ) -> Result<Self, DiarizationError> {
        config.validate()?;
        Ok(Self {
            config,
            models,
            plda_parameters,
            pool: BufferPool::new(),
        })
    }

    pub fn config(&self) -> &DiarizationConfig {
        &self.config
    }

    /// Diarize a recording without external cancellation.
    pub async fn diarize(
        &self,
        source: &dyn AudioSource,
    ) -> Result<DiarizationResult, DiarizationError> {
        self.diarize_cancellable(source, &CancellationToken::new())
            .await
    }

    /// Diarize a recording, observing `cancel` at batch and iteration
    /// boundaries.
    pub async fn diarize_cancellable(
        &self,
        source: &dyn AudioSource,
        cancel: &CancellationToken,
    ) -> Result<DiarizationResult, DiarizationError> {
        let mut timings = StageTimings::default();
        let mut warnings = Vec::new();

        // Stage A feeds stage B/C through a bounded lossless channel sized
        // to the embedding batch, providing backpressure toward the runner.
        let runner = SegmentationRunner::new(
            Arc::clone(&self.models.segmentation),
            self.config.segmentation.clone(),
            Arc::clone(&self.pool),
        );
        let extractor = EmbeddingExtractor::new(
            Arc::clone(&self.models.fbank),
            Arc::clone(&self.models.embedding),
            PldaTransform::new(Arc::clone(&self.models.plda), self.plda_parameters.clone()),
            &self.config.segmentation,
            &self.config.embedding,
        );

        let (tx, rx) = mpsc::channel(self.config.embedding.batch_size);
        let produce = async {
            let started = Instant::now();
            let result = runner.run(source, tx, cancel).await;
            (result, started.elapsed().as_secs_f64())
        };
        let consume = async {
            let started = Instant::now();
            let result = extractor.collect(rx, source, cancel).await;
            (result, started.elapsed().as_secs_f64())
        };
        let ((summary, segmentation_s), (outcome, embedding_s)) = tokio::join!(produce, consume);

        // The consumer error is the root cause when both sides fail: the
        // runner then only reports its send channel closing.
        let outcome: ExtractionOutcome = outcome?;
        let _summary = summary?;
        timings.segmentation_s = segmentation_s;
        timings.embedding_s = embedding_s;

        // A recording with audio but no usable speech yields an empty
        // result rather than an error; only empty input is an error.
        if outcome.embeddings.is_empty() {
            info!("no usable speaker activity found; returning empty result");
            return Ok(DiarizationResult {
                timings,
                warnings,
                ..Default::default()
            });
        }

        // Stage D: AHC warm-start + VBx refinement on the calling task.
        let clustering_started = Instant::now();
        let clusterer = Clusterer::new(self.config.clustering.clone(), self.config.vbx.clone());
        let clustering =
            clusterer.cluster(&outcome.embeddings, self.plda_parameters.psi(), cancel)?;
        timings.clustering_s = clustering_started.elapsed().as_secs_f64();
        if clustering.psi_fallback {
            warnings.push(format!(
                "PLDA psi dimension {} did not match the rho dimension; VBx used a unit diagonal",
                self.plda_parameters.dim()
            ));
        }

        // Stage E plus result assembly.
        let post_started = Instant::now();
        let reconstructor = TimelineReconstructor {
            min_gap_duration_s: self.config.post_processing.min_gap_duration_s,
            min_duration_off: self.config.segmentation.min_duration_off,
            min_duration_on: self.config.segmentation.min_duration_on,
            min_segment_duration_s: self.config.embedding.min_segment_duration_s,
            exclude_overlap: self.config.embedding.exclude_overlap,
        };
        let mut segments = reconstructor.reconstruct(
            &outcome.chunks,
            &clustering.assignments,
            clustering.cluster_count,
        );

        attach_centroids(
            &mut segments,
            &outcome.embeddings,
            &clustering.labels,
            clustering.cluster_count,
        );
        let speaker_database = build_speaker_database(&segments);

        if let Some(path) = &self.config.export.embeddings_path {
            if let Err(e) = export_embeddings(&speaker_database, path) {
                warn!("embedding export failed: {}", e);
                warnings.push(e.to_string());
            }
        }
        timings.post_processing_s = post_started.elapsed().as_secs_f64();

        info!(
            "diarization complete: {} segments, {} speakers",
            segments.len(),
            speaker_database.len()
        );
        Ok(DiarizationResult {
            segments,
            speaker_database,
            timings,
            warnings,
        })
    }
}

/// Attach a centroid to every segment: the mean embedding of the snippets
/// assigned to the segment's cluster that overlap it in time, falling back
/// to the cluster-wide centroid.
fn attach_centroids(
    segments: &mut [TimedSpeakerSegment],
    embeddings: &[TimedEmbedding],
    labels: &[usize],
    cluster_count: usize,
) {
    let mut cluster_centroids: Vec<Option<Vec<f32>>> = vec![None; cluster_count];
    for cluster in 0..cluster_count {
        let members: Vec<&TimedEmbedding> = embeddings
            .iter()
            .zip(labels)
            .filter(|(_, &l)| l == cluster)
            .map(|(e, _)| e)
            .collect();
        cluster_centroids[cluster] = mean_vector(members.iter().map(|e| &e.embedding));
    }

    for segment in segments.iter_mut() {
        let Some(cluster) = cluster_from_label(&segment.speaker_id) else {
            continue;
        };
        let overlapping = embeddings
            .iter()
            .zip(labels)
            .filter(|&(e, &l)| {
                l == cluster && e.start_s < segment.end_s && e.end_s > segment.start_s
            })
            .map(|(e, _)| &e.embedding);
        segment.centroid = mean_vector(overlapping)
            .or_else(|| cluster_centroids.get(cluster).cloned().flatten());
    }
}

/// Per-speaker centroid: arithmetic mean of all segment centroids.
fn build_speaker_database(segments: &[TimedSpeakerSegment]) -> HashMap<String, Vec<f32>> {
    let mut grouped: HashMap<String, Vec<&Vec<f32>>> = HashMap::new();
    for segment in segments {
        if let Some(centroid) = &segment.centroid {
            grouped.entry(segment.speaker_id.clone()).or_default().push(centroid);
        }
    }
    grouped
        .into_iter()
        .filter_map(|(speaker, centroids)| {
            mean_vector(centroids.into_iter()).map(|mean| (speaker, mean))
        })
        .collect()
}

/// Write per-speaker centroid embeddings as a JSON object.
pub fn export_embeddings(
    speaker_database: &HashMap<String, Vec<f32>>,
    path: impl AsRef<Path>,
) -> Result<(), DiarizationError> {
    let path = path.as_ref();
    let file = std::fs::File::create(path).map_err(|e| DiarizationError::ExportFailed {
        reason: format!("cannot create {}: {}", path.display(), e),
    })?;
    serde_json::to_writer(file, speaker_database).map_err(|e| DiarizationError::ExportFailed {
        reason: format!("cannot write {}: {}", path.display(), e),
    })?;
    info!(
        "exported {} speaker embeddings to {}",
        speaker_database.len(),
        path.display()
    );
    Ok(())
}

fn cluster_from_label(speaker_id: &str) -> Option<usize> {
    speaker_id
        .strip_prefix('S')
        .and_then(|n| n.parse::<usize>().ok())
        .map(|n| n - 1)
}

fn mean_vector<'a>(mut vectors: impl Iterator<Item = &'a Vec<f32>>) -> Option<Vec<f32>> {
    let first = vectors.next()?;
    let mut sum = first.clone();
    let mut count = 1usize;
    for vector in vectors {
        for (a, &v) in sum.iter_mut().zip(vector) {
            *a += v;
        }
        count += 1;
    }
    for v in &mut sum {
        *v /= count as f32;
    }
    Some(sum)
}
