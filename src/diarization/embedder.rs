//! Speaker embedding extraction
//!
//! Consumes segmentation chunks as they stream out of the runner, computes
//! filterbank features once per chunk (batched), runs the embedding model
//! over the accepted speaker masks (also batched), and projects the results
//! through PLDA into the rho vectors consumed by clustering.

use super::masks::MaskConditioner;
use super::types::{SegmentationChunk, SpeakerMask, TimedEmbedding};
use crate::audio::AudioSource;
use crate::config::{EmbeddingConfig, SegmentationConfig};
use crate::error::DiarizationError;
use crate::inference::{warm_up, ModelPredictor, PldaTransform, Tensor, TensorMap, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Weight-input length of the embedding model.
pub const EMBEDDING_WEIGHT_FRAMES: usize = 589;

/// Squared-norm floor below which an embedding is considered degenerate.
const NORM_FLOOR_SQ: f32 = 1e-2;

/// Counters describing one extraction run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Masks emitted by the conditioner
    pub masks_conditioned: usize,

    /// Masks that kept overlapping frames to stay usable
    pub fallback_masks: usize,

    /// Masks dropped for degenerate embedding output
    pub skipped_masks: usize,

    /// Embeddings successfully produced
    pub embeddings_produced: usize,
}

/// Everything the clustering and timeline stages need from the streaming
/// half of the pipeline.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// All segmentation chunks, retained for timeline reconstruction
    pub chunks: Vec<SegmentationChunk>,

    /// One embedding per accepted (chunk, speaker) mask
    pub embeddings: Vec<TimedEmbedding>,

    /// Counters for diagnostics
    pub stats: ExtractionStats,
}

/// A mask waiting for embedding inference, with its provenance resolved.
struct PendingMask {
    mask: SpeakerMask,
    start_s: f64,
    end_s: f64,
    /// Index of the owning chunk inside the current fbank batch
    batch_slot: usize,
}

/// Batched fbank + embedding inference over conditioned speaker masks.
pub struct EmbeddingExtractor {
    fbank: Arc<dyn ModelPredictor>,
    embedding: Arc<dyn ModelPredictor>,
    plda: PldaTransform,
    conditioner: MaskConditioner,
    window_samples: usize,
    sample_rate: u32,
    batch_size: usize,
    embedding_warmed: AtomicBool,
}

impl EmbeddingExtractor {
    pub fn new(
        fbank: Arc<dyn ModelPredictor>,
        embedding: Arc<dyn ModelPredictor>,
        plda: PldaTransform,
        segmentation: &SegmentationConfig,
        config: &EmbeddingConfig,
    ) -> Self {
        let conditioner = MaskConditioner {
            exclude_overlap: config.exclude_overlap,
            min_segment_duration_s: config.min_segment_duration_s,
            target_weight_len: EMBEDDING_WEIGHT_FRAMES,
        };
        // The fbank model may declare a smaller batch than configured.
        let batch_size = match fbank.declared_batch_limit() {
            Some(limit) => config.batch_size.min(limit.max(1)),
            None => config.batch_size,
        };
        Self {
            fbank,
            embedding,
            plda,
            conditioner,
            window_samples: segmentation.window_samples(),
            sample_rate: segmentation.sample_rate,
            batch_size,
            embedding_warmed: AtomicBool::new(false),
        }
    }

    /// Drain the chunk stream, producing embeddings as chunks arrive.
    /// Cancellation is observed at every fbank batch boundary.
    pub async fn collect(
        &self,
        mut rx: mpsc::Receiver<SegmentationChunk>,
        source: &dyn AudioSource,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutcome, DiarizationError> {
        let mut warm = TensorMap::new();
        warm.insert("audio", Tensor::zeros(vec![1, 1, self.window_samples]));
        warm_up(self.fbank.as_ref(), warm);

        let mut outcome = ExtractionOutcome::default();
        let mut pending: Vec<SegmentationChunk> = Vec::with_capacity(self.batch_size);

        while let Some(chunk) = rx.recv().await {
            pending.push(chunk);
            if pending.len() == self.batch_size {
                if cancel.is_cancelled() {
                    return Err(DiarizationError::Cancelled);
                }
                self.process_batch(&mut pending, source, &mut outcome)?;
            }
        }
        if !pending.is_empty() {
            if cancel.is_cancelled() {
                return Err(DiarizationError::Cancelled);
            }
            self.process_batch(&mut pending, source, &mut outcome)?;
        }

        info!(
            "embedding extraction complete: {} embeddings from {} chunks \
             ({} masks conditioned, {} fallbacks, {} skipped)",
            outcome.embeddings.len(),
            outcome.chunks.len(),
            outcome.stats.masks_conditioned,
            outcome.stats.fallback_masks,
            outcome.stats.skipped_masks
        );
        Ok(outcome)
    }

    /// Compute fbanks for a batch of chunks, then embeddings for every
    /// accepted mask of the batch, then rho projections.
    fn process_batch(
        &self,
        pending: &mut Vec<SegmentationChunk>,
        source: &dyn AudioSource,
        outcome: &mut ExtractionOutcome,
    ) -> Result<(), DiarizationError> {
        let inputs: Vec<TensorMap> = pending
            .iter()
            .map(|chunk| {
                let mut map = TensorMap::new();
                map.insert("audio", self.window_tensor(source, chunk)?);
                Ok(map)
            })
            .collect::<Result<_, DiarizationError>>()?;

        let fbanks = self.fbank.batch_predict(&inputs).map_err(|e| {
            DiarizationError::processing(format!("fbank inference failed: {}", e))
        })?;
        if fbanks.len() != pending.len() {
            return Err(DiarizationError::model_shape(
                self.fbank.name(),
                format!("returned {} outputs for {} inputs", fbanks.len(), pending.len()),
            ));
        }

        let mut features = Vec::with_capacity(fbanks.len());
        for fbank_out in &fbanks {
            let tensor = fbank_out
                .get_any(&["fbank_features"])
                .map(Ok)
                .unwrap_or_else(|| fbank_out.sole())
                .map_err(|e| DiarizationError::model_shape(self.fbank.name(), e.to_string()))?;
            features.push(tensor);
        }

        if let Some(first) = features.first() {
            self.warm_up_embedding(first);
        }

        // Condition every chunk of the batch before submitting embedding
        // inference, so the embedding model sees full batches too.
        let mut masks: Vec<PendingMask> = Vec::new();
        for (slot, chunk) in pending.iter().enumerate() {
            for mask in self.conditioner.condition(chunk) {
                outcome.stats.masks_conditioned += 1;
                if mask.used_fallback {
                    outcome.stats.fallback_masks += 1;
                }
                masks.push(PendingMask {
                    start_s: mask.start_s(chunk.offset_s, chunk.frame_duration_s),
                    end_s: mask.end_s(chunk.offset_s, chunk.frame_duration_s),
                    batch_slot: slot,
                    mask,
                });
            }
        }

        let vectors = self.embed_masks(&features, &masks)?;

        let mut accepted: Vec<(PendingMask, Vec<f32>)> = Vec::new();
        for (pending_mask, vector) in masks.into_iter().zip(vectors) {
            match vector {
                Some(vector) => accepted.push((pending_mask, vector)),
                None => {
                    outcome.stats.skipped_masks += 1;
                    debug!(
                        "chunk {} speaker {}: degenerate embedding skipped",
                        pending_mask.mask.chunk_index, pending_mask.mask.local_speaker
                    );
                }
            }
        }

        // Project the whole batch through PLDA in one call; the transform
        // splits to the model's own cap internally.
        let embeddings: Vec<Vec<f32>> = accepted.iter().map(|(_, v)| v.clone()).collect();
        let rhos = self.plda.transform(&embeddings)?;
        for ((pending_mask, vector), rho) in accepted.into_iter().zip(rhos) {
            trace!(
                "embedding for chunk {} speaker {} covering {:.2}-{:.2}s",
                pending_mask.mask.chunk_index,
                pending_mask.mask.local_speaker,
                pending_mask.start_s,
                pending_mask.end_s
            );
            outcome.stats.embeddings_produced += 1;
            outcome.embeddings.push(TimedEmbedding {
                chunk_index: pending_mask.mask.chunk_index,
                local_speaker: pending_mask.mask.local_speaker,
                start_s: pending_mask.start_s,
                end_s: pending_mask.end_s,
                frame_weights: pending_mask.mask.weights,
                embedding: vector,
                rho,
            });
        }

        outcome.chunks.append(pending);
        Ok(())
    }

    /// Run the embedding model over all masks of the batch via its batched
    /// entry point. Returns `None` per mask whose output norm is degenerate.
    fn embed_masks(
        &self,
        features: &[&Tensor],
        masks: &[PendingMask],
    ) -> Result<Vec<Option<Vec<f32>>>, DiarizationError> {
        if masks.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<TensorMap> = masks
            .iter()
            .map(|pending| {
                let mut map = TensorMap::new();
                map.insert("fbank_features", features[pending.batch_slot].clone());
                map.insert(
                    "weights",
                    Tensor::new(
                        vec![1, pending.mask.weights.len()],
                        pending.mask.weights.clone(),
                    )
                    .map_err(|e| DiarizationError::processing(e.to_string()))?,
                );
                Ok(map)
            })
            .collect::<Result<_, DiarizationError>>()?;

        let limit = self
            .embedding
            .declared_batch_limit()
            .unwrap_or(self.batch_size)
            .max(1);

        let mut vectors = Vec::with_capacity(masks.len());
        for (chunk_of_inputs, chunk_of_masks) in
            inputs.chunks(limit).zip(masks.chunks(limit))
        {
            let outputs = self.embedding.batch_predict(chunk_of_inputs).map_err(|e| {
                DiarizationError::processing(format!("embedding inference failed: {}", e))
            })?;
            if outputs.len() != chunk_of_inputs.len() {
                return Err(DiarizationError::model_shape(
                    self.embedding.name(),
                    format!(
                        "returned {} outputs for {} inputs",
                        outputs.len(),
                        chunk_of_inputs.len()
                    ),
                ));
            }
            for (output, pending) in outputs.iter().zip(chunk_of_masks) {
                vectors.push(self.validate_embedding(output, &pending.mask)?);
            }
        }
        Ok(vectors)
    }

    /// Extract, check, and L2-normalize one embedding output.
    fn validate_embedding(
        &self,
        outputs: &TensorMap,
        mask: &SpeakerMask,
    ) -> Result<Option<Vec<f32>>, DiarizationError> {
        let tensor = outputs
            .get_any(&["embedding"])
            .map(Ok)
            .unwrap_or_else(|| outputs.sole())
            .map_err(|e| DiarizationError::model_shape(self.embedding.name(), e.to_string()))?;

        let mut vector = tensor.data().to_vec();
        if vector.len() != EMBEDDING_DIM {
            return Err(DiarizationError::model_shape(
                self.embedding.name(),
                format!("expected a {}-d embedding, got {}", EMBEDDING_DIM, vector.len()),
            ));
        }

        let norm_sq: f32 = vector.iter().map(|v| v * v).sum();
        if !norm_sq.is_finite() || norm_sq <= NORM_FLOOR_SQ {
            warn!(
                "chunk {} speaker {}: embedding norm^2 {} below floor",
                mask.chunk_index, mask.local_speaker, norm_sq
            );
            return Ok(None);
        }

        let norm = norm_sq.sqrt();
        for v in &mut vector {
            *v /= norm;
        }
        Ok(Some(vector))
    }

    /// Copy (and zero-pad) the chunk's audio window from the source.
    fn window_tensor(
        &self,
        source: &dyn AudioSource,
        chunk: &SegmentationChunk,
    ) -> Result<Tensor, DiarizationError> {
        let offset = (chunk.offset_s * self.sample_rate as f64).round() as usize;
        let mut samples = vec![0.0f32; self.window_samples];
        let have = source.sample_count().saturating_sub(offset).min(self.window_samples);
        if have > 0 {
            source.copy_samples(&mut samples[..have], offset)?;
        }
        Tensor::new(vec![1, 1, self.window_samples], samples)
            .map_err(|e| DiarizationError::processing(e.to_string()))
    }

    /// Warm up the embedding model once the fbank feature shape is known.
    fn warm_up_embedding(&self, features: &Tensor) {
        if self.embedding_warmed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut inputs = TensorMap::new();
        inputs.insert("fbank_features", Tensor::zeros(features.shape().to_vec()));
        inputs.insert("weights", Tensor::zeros(vec![1, EMBEDDING_WEIGHT_FRAMES]));
        warm_up(self.embedding.as_ref(), inputs);
    }
}
