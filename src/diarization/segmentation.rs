//! Sliding-window segmentation runner
//!
//! Steps fixed-length windows over the input audio, batches them through the
//! segmentation model, and converts powerset class logits into per-frame
//! log-probabilities and marginal per-speaker activity weights.

use super::types::{
    SegmentationChunk, SegmentationOutput, SegmentationStats, LOCAL_SPEAKERS, POWERSET_CLASSES,
};
use crate::audio::AudioSource;
use crate::config::SegmentationConfig;
use crate::error::DiarizationError;
use crate::inference::{warm_up, BufferPool, ModelPredictor, Tensor, TensorMap};
use ndarray::Array2;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Windows per segmentation inference batch.
const SEGMENTATION_BATCH: usize = 32;

/// Metadata returned by the runner; the chunks themselves travel through the
/// output channel so downstream stages can start before the run finishes.
#[derive(Debug, Clone, Default)]
pub struct SegmentationSummary {
    pub chunk_count: usize,
    pub chunk_offsets_s: Vec<f64>,
    pub frames_per_chunk: usize,
    pub frame_duration_s: f64,
    pub stats: SegmentationStats,
}

/// Batches audio windows through the segmentation model.
pub struct SegmentationRunner {
    model: Arc<dyn ModelPredictor>,
    config: SegmentationConfig,
    pool: Arc<BufferPool>,
}

impl SegmentationRunner {
    pub fn new(
        model: Arc<dyn ModelPredictor>,
        config: SegmentationConfig,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self { model, config, pool }
    }

    /// Run segmentation over `source`, emitting chunks in ascending offset
    /// order into `tx`. Cancellation is observed at batch boundaries.
    pub async fn run(
        &self,
        source: &dyn AudioSource,
        tx: mpsc::Sender<SegmentationChunk>,
        cancel: &CancellationToken,
    ) -> Result<SegmentationSummary, DiarizationError> {
        let total = source.sample_count();
        if total == 0 {
            return Err(DiarizationError::NoSpeechDetected);
        }

        let window = self.config.window_samples();
        let step = self.config.step_samples();
        if window == 0 || step == 0 {
            return Err(DiarizationError::processing(format!(
                "degenerate window geometry: window={} step={}",
                window, step
            )));
        }

        let window_count = if total <= window {
            1
        } else {
            (total - window + step - 1) / step + 1
        };
        info!(
            "segmenting {:.2}s of audio: {} windows of {} samples, step {}",
            total as f64 / self.config.sample_rate as f64,
            window_count,
            window,
            step
        );

        // One throwaway inference lets the backend allocate its workspace;
        // failure here is non-fatal.
        let mut warm = TensorMap::new();
        warm.insert("audio", Tensor::zeros(vec![1, 1, window]));
        warm_up(self.model.as_ref(), warm);

        let mut summary = SegmentationSummary::default();
        let mut accum = StatsAccumulator::new(
            self.config.speech_onset_threshold,
            self.config.speech_offset_threshold,
        );

        // The sliding window keeps the trailing `window - step` samples of
        // the previous window in place and copies only `step` new samples.
        let mut window_buf = vec![0.0f32; window];
        let mut batch = self.pool.acquire("segmentation", SEGMENTATION_BATCH, &[1, window]);
        let mut batch_meta: Vec<(usize, f64)> = Vec::with_capacity(SEGMENTATION_BATCH);

        for index in 0..window_count {
            let offset = index * step;
            if index == 0 {
                let have = total.min(window);
                source.copy_samples(&mut window_buf[..have], 0)?;
                window_buf[have..].fill(0.0);
            } else {
                window_buf.copy_within(step.., 0);
                let tail_start = offset + window - step;
                let have = total.saturating_sub(tail_start).min(step);
                let tail = &mut window_buf[window - step..];
                if have > 0 {
                    source.copy_samples(&mut tail[..have], tail_start)?;
                }
                tail[have..].fill(0.0);
            }

            let row = batch_meta.len();
            batch.as_mut_slice()[row * window..(row + 1) * window].copy_from_slice(&window_buf);
            batch_meta.push((index, offset as f64 / self.config.sample_rate as f64));

            if batch_meta.len() == SEGMENTATION_BATCH || index + 1 == window_count {
                if cancel.is_cancelled() {
                    return Err(DiarizationError::Cancelled);
                }
                self.flush_batch(&batch, &mut batch_meta, &tx, &mut summary, &mut accum)
                    .await?;
            }
        }

        if summary.chunk_count == 0 {
            return Err(DiarizationError::processing(
                "segmentation produced no chunks",
            ));
        }

        summary.stats = accum.finish();
        debug!(
            "segmentation complete: {} chunks, {} frames each, {:.1}% speech frames",
            summary.chunk_count,
            summary.frames_per_chunk,
            100.0 * summary.stats.speech_frames as f64 / summary.stats.total_frames.max(1) as f64
        );
        Ok(summary)
    }

    /// Convenience wrapper that collects the stream into a
    /// [`SegmentationOutput`].
    pub async fn run_collect(
        &self,
        source: &dyn AudioSource,
        cancel: &CancellationToken,
    ) -> Result<SegmentationOutput, DiarizationError> {
        let (tx, mut rx) = mpsc::channel(SEGMENTATION_BATCH);
        let run = self.run(source, tx, cancel);
        let collect = async {
            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk);
            }
            chunks
        };
        let (summary, chunks) = tokio::join!(run, collect);
        let summary = summary?;
        Ok(SegmentationOutput {
            chunks,
            chunk_offsets_s: summary.chunk_offsets_s,
            frames_per_chunk: summary.frames_per_chunk,
            frame_duration_s: summary.frame_duration_s,
            stats: summary.stats,
        })
    }

    async fn flush_batch(
        &self,
        batch: &crate::inference::PooledBuffer,
        batch_meta: &mut Vec<(usize, f64)>,
        tx: &mpsc::Sender<SegmentationChunk>,
        summary: &mut SegmentationSummary,
        accum: &mut StatsAccumulator,
    ) -> Result<(), DiarizationError> {
        let rows = batch_meta.len();
        let window = self.config.window_samples();

        let mut inputs = TensorMap::new();
        inputs.insert(
            "audio",
            batch
                .to_tensor(vec![rows, 1, window])
                .map_err(|e| DiarizationError::processing(e.to_string()))?,
        );

        let outputs = self.model.predict(&inputs).map_err(|e| {
            DiarizationError::processing(format!("segmentation inference failed: {}", e))
        })?;
        let logits = outputs
            .get_any(&["segments", "log_probs"])
            .ok_or_else(|| {
                DiarizationError::model_shape(
                    self.model.name(),
                    "output has neither 'segments' nor 'log_probs'",
                )
            })?;

        let (frames, classes) = self.interpret_shape(logits.shape(), rows)?;
        if summary.frames_per_chunk == 0 {
            summary.frames_per_chunk = frames;
            summary.frame_duration_s = self.config.window_duration_s / frames as f64;
        } else if summary.frames_per_chunk != frames {
            return Err(DiarizationError::model_shape(
                self.model.name(),
                format!(
                    "frame count changed mid-run: {} then {}",
                    summary.frames_per_chunk, frames
                ),
            ));
        }

        let incidence = powerset_incidence(classes);
        let data = logits.data();

        for (row, &(chunk_index, offset_s)) in batch_meta.iter().enumerate() {
            let chunk = build_chunk(
                chunk_index,
                offset_s,
                summary.frame_duration_s,
                &data[row * frames * classes..(row + 1) * frames * classes],
                frames,
                classes,
                &incidence,
                accum,
            )?;
            trace!(
                "chunk {} at {:.2}s: {} frames",
                chunk_index,
                offset_s,
                frames
            );
            summary.chunk_offsets_s.push(offset_s);
            summary.chunk_count += 1;
            tx.send(chunk).await.map_err(|_| {
                DiarizationError::processing("segmentation chunk consumer closed early")
            })?;
        }

        batch_meta.clear();
        Ok(())
    }

    /// Validate the model output as `(B, F, C)` or, for single-window
    /// batches, `(F, C)`.
    fn interpret_shape(
        &self,
        shape: &[usize],
        rows: usize,
    ) -> Result<(usize, usize), DiarizationError> {
        let (frames, classes) = match *shape {
            [b, f, c] if b == rows => (f, c),
            [f, c] if rows == 1 => (f, c),
            _ => {
                return Err(DiarizationError::model_shape(
                    self.model.name(),
                    format!(
                        "cannot interpret output shape {:?} for a batch of {}",
                        shape, rows
                    ),
                ))
            }
        };
        if frames == 0 || !(classes == POWERSET_CLASSES || classes == POWERSET_CLASSES + 1) {
            return Err(DiarizationError::model_shape(
                self.model.name(),
                format!("expected (frames, 7|8) class layout, got {:?}", shape),
            ));
        }
        Ok((frames, classes))
    }
}

/// Incidence of speakers in powerset classes: entry `(s, c)` is 1 when
/// speaker `s` is active in class `c`. Class order: empty set, the three
/// singletons, then the three pairs; an optional eighth class marks all
/// speakers active.
fn powerset_incidence(classes: usize) -> Array2<f32> {
    const MEMBERS: [&[usize]; 8] = [
        &[],
        &[0],
        &[1],
        &[2],
        &[0, 1],
        &[0, 2],
        &[1, 2],
        &[0, 1, 2],
    ];
    let mut m = Array2::zeros((LOCAL_SPEAKERS, classes));
    for (class, members) in MEMBERS.iter().take(classes).enumerate() {
        for &speaker in *members {
            m[[speaker, class]] = 1.0;
        }
    }
    m
}

/// Normalize one logit row into log-probabilities in place via a max-shifted
/// log-sum-exp, returning the argmax class and its probability.
fn log_softmax_row(row: &mut [f32]) -> (usize, f32) {
    let mut argmax = 0;
    let mut max = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > max {
            max = v;
            argmax = i;
        }
    }
    let sum: f32 = row.iter().map(|&v| (v - max).exp()).sum();
    let lse = max + sum.ln();
    for v in row.iter_mut() {
        *v -= lse;
    }
    (argmax, row[argmax].exp())
}

#[allow(clippy::too_many_arguments)]
fn build_chunk(
    chunk_index: usize,
    offset_s: f64,
    frame_duration_s: f64,
    logits: &[f32],
    frames: usize,
    classes: usize,
    incidence: &Array2<f32>,
    accum: &mut StatsAccumulator,
) -> Result<SegmentationChunk, DiarizationError> {
    let mut log_probs = Array2::zeros((frames, classes));
    let mut speaker_weights = Array2::zeros((frames, LOCAL_SPEAKERS));
    let mut hard_labels = Vec::with_capacity(frames);
    let mut row_buf = vec![0.0f32; classes];

    for f in 0..frames {
        row_buf.copy_from_slice(&logits[f * classes..(f + 1) * classes]);
        if row_buf.iter().any(|v| !v.is_finite()) {
            return Err(DiarizationError::processing(format!(
                "non-finite segmentation logits in chunk {} frame {}",
                chunk_index, f
            )));
        }
        let (winner, confidence) = log_softmax_row(&mut row_buf);
        hard_labels.push(winner);

        let mut max_activation = 0.0f32;
        for s in 0..LOCAL_SPEAKERS {
            let mut w = 0.0f32;
            for c in 0..classes {
                w += incidence[[s, c]] * row_buf[c].exp();
            }
            let w = w.clamp(0.0, 1.0);
            speaker_weights[[f, s]] = w;
            max_activation = max_activation.max(w);
        }

        accum.record(confidence, row_buf[0].exp(), max_activation);
        for c in 0..classes {
            log_probs[[f, c]] = row_buf[c];
        }
    }

    Ok(SegmentationChunk {
        chunk_index,
        offset_s,
        frame_duration_s,
        log_probs,
        speaker_weights,
        hard_labels,
    })
}

/// Accumulates the diagnostic counters of [`SegmentationStats`].
struct StatsAccumulator {
    onset_threshold: f32,
    offset_threshold: f32,
    speech_frames: usize,
    silence_frames: usize,
    total_frames: usize,
    empty_sum: f64,
    confidences: Vec<f32>,
}

impl StatsAccumulator {
    fn new(onset_threshold: f32, offset_threshold: f32) -> Self {
        Self {
            onset_threshold,
            offset_threshold,
            speech_frames: 0,
            silence_frames: 0,
            total_frames: 0,
            empty_sum: 0.0,
            confidences: Vec::new(),
        }
    }

    fn record(&mut self, winning_confidence: f32, empty_prob: f32, max_activation: f32) {
        self.total_frames += 1;
        self.empty_sum += empty_prob as f64;
        self.confidences.push(winning_confidence);
        if max_activation > self.onset_threshold {
            self.speech_frames += 1;
        } else if max_activation < self.offset_threshold {
            self.silence_frames += 1;
        }
    }

    fn finish(mut self) -> SegmentationStats {
        let percentiles = if self.confidences.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            self.confidences
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let at = |p: f64| {
                let idx = ((self.confidences.len() - 1) as f64 * p).round() as usize;
                self.confidences[idx]
            };
            (at(0.10), at(0.50), at(0.90))
        };
        SegmentationStats {
            speech_frames: self.speech_frames,
            silence_frames: self.silence_frames,
            total_frames: self.total_frames,
            confidence_percentiles: percentiles,
            mean_empty_probability: if self.total_frames > 0 {
                (self.empty_sum / self.total_frames as f64) as f32
            } else {
                0.0
            },
        }
    }
}
