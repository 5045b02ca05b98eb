//! Speaker mask conditioning and resampling
//!
//! Turns each chunk's per-speaker activation columns into embedding-ready
//! masks: overlap frames are filtered out, short masks fall back to the
//! unfiltered column, and the result is resampled onto the embedding
//! model's weight grid with half-pixel-aligned linear interpolation.

use super::types::{SegmentationChunk, SpeakerMask, LOCAL_SPEAKERS};
use tracing::{debug, trace};

/// Activation floor below which a frame does not count as active.
const ACTIVITY_FLOOR: f32 = 1e-3;

/// Conditioning parameters derived from the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct MaskConditioner {
    /// Zero out frames where more than one speaker is active
    pub exclude_overlap: bool,

    /// Minimum snippet duration eligible for embedding (s)
    pub min_segment_duration_s: f64,

    /// Length of the embedding model's weight input
    pub target_weight_len: usize,
}

impl MaskConditioner {
    /// Produce at most one mask per local speaker of `chunk`. Speakers whose
    /// activation never rises above zero, or whose conditioned mask carries
    /// no support, are dropped.
    pub fn condition(&self, chunk: &SegmentationChunk) -> Vec<SpeakerMask> {
        let frames = chunk.frames();
        let min_frames =
            (self.min_segment_duration_s / chunk.frame_duration_s).ceil().max(1.0) as usize;

        // Frames where two or more speakers are simultaneously active.
        let mut overlapped = vec![false; frames];
        if self.exclude_overlap {
            for f in 0..frames {
                let active = (0..LOCAL_SPEAKERS)
                    .filter(|&s| chunk.speaker_weights[[f, s]] > ACTIVITY_FLOOR)
                    .count();
                overlapped[f] = active > 1;
            }
        }

        let mut masks = Vec::new();
        for speaker in 0..LOCAL_SPEAKERS {
            let base: Vec<f32> = (0..frames)
                .map(|f| chunk.speaker_weights[[f, speaker]])
                .collect();
            let base_sum: f32 = base.iter().sum();
            if base_sum <= 0.0 {
                continue;
            }

            let mut used_fallback = false;
            let chosen: Vec<f32> = if self.exclude_overlap {
                let clean: Vec<f32> = base
                    .iter()
                    .zip(&overlapped)
                    .map(|(&w, &o)| if o { 0.0 } else { w })
                    .collect();
                let clean_sum: f32 = clean.iter().sum();
                if clean_sum >= min_frames as f32 {
                    clean
                } else {
                    // Too little clean support; keep the overlapping frames
                    // rather than losing the speaker entirely.
                    used_fallback = true;
                    base
                }
            } else {
                // No overlap filtering: a mask below the duration floor is
                // still emitted, flagged the same way as a rollback.
                used_fallback = base_sum < min_frames as f32;
                base
            };

            if chosen.iter().sum::<f32>() <= 0.0 {
                continue;
            }

            // Active range in chunk-frame space, so snippet times stay on
            // the chunk's frame grid regardless of the weight resolution.
            let Some((first_active, last_active)) = active_range(&chosen) else {
                trace!(
                    "chunk {} speaker {}: mask has no frame above the activity floor",
                    chunk.chunk_index,
                    speaker
                );
                continue;
            };
            let weights = resample_linear(&chosen, self.target_weight_len);

            if used_fallback {
                debug!(
                    "chunk {} speaker {}: overlap filtering fell back to the base mask",
                    chunk.chunk_index, speaker
                );
            }

            masks.push(SpeakerMask {
                chunk_index: chunk.chunk_index,
                local_speaker: speaker,
                weights,
                first_active,
                last_active,
                used_fallback,
            });
        }
        masks
    }

}

/// First and last index above the activity floor.
fn active_range(weights: &[f32]) -> Option<(usize, usize)> {
    let first = weights.iter().position(|&w| w > ACTIVITY_FLOOR)?;
    let last = weights.iter().rposition(|&w| w > ACTIVITY_FLOOR)?;
    Some((first, last))
}

/// Resample `input` to `out_len` samples with linear interpolation on the
/// half-pixel-offset grid: output index `i` reads source coordinate
/// `(i + 0.5) * len / out_len - 0.5`, clamped to the source range. This is
/// the exporter's convention; any other mapping shifts masks off the audio.
pub fn resample_linear(input: &[f32], out_len: usize) -> Vec<f32> {
    if input.is_empty() || out_len == 0 {
        return vec![0.0; out_len];
    }
    if input.len() == out_len {
        return input.to_vec();
    }

    let scale = input.len() as f64 / out_len as f64;
    let max_src = (input.len() - 1) as f64;
    (0..out_len)
        .map(|i| {
            let src = ((i as f64 + 0.5) * scale - 0.5).clamp(0.0, max_src);
            let lo = src.floor() as usize;
            let hi = (lo + 1).min(input.len() - 1);
            let frac = (src - lo as f64) as f32;
            input[lo] * (1.0 - frac) + input[hi] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diarization::types::POWERSET_CLASSES;
    use ndarray::Array2;

    fn chunk_with_weights(weights: Array2<f32>) -> SegmentationChunk {
        let frames = weights.nrows();
        SegmentationChunk {
            chunk_index: 0,
            offset_s: 0.0,
            frame_duration_s: 0.1,
            log_probs: Array2::zeros((frames, POWERSET_CLASSES)),
            speaker_weights: weights,
            hard_labels: vec![0; frames],
        }
    }

    fn conditioner(frames: usize) -> MaskConditioner {
        MaskConditioner {
            exclude_overlap: true,
            min_segment_duration_s: 0.3,
            target_weight_len: frames,
        }
    }

    #[test]
    fn test_silent_speakers_are_dropped() {
        let mut w = Array2::zeros((10, LOCAL_SPEAKERS));
        for f in 0..10 {
            w[[f, 1]] = 0.9;
        }
        let masks = conditioner(10).condition(&chunk_with_weights(w));
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].local_speaker, 1);
        assert_eq!((masks[0].first_active, masks[0].last_active), (0, 9));
        assert!(!masks[0].used_fallback);
    }

    #[test]
    fn test_overlap_frames_are_zeroed() {
        let mut w = Array2::zeros((10, LOCAL_SPEAKERS));
        // Speaker 0 active throughout; speaker 1 overlaps frames 4..6.
        for f in 0..10 {
            w[[f, 0]] = 0.8;
        }
        for f in 4..6 {
            w[[f, 1]] = 0.7;
        }
        let masks = conditioner(10).condition(&chunk_with_weights(w));
        let mask0 = masks.iter().find(|m| m.local_speaker == 0).unwrap();
        assert_eq!(mask0.weights[4], 0.0);
        assert_eq!(mask0.weights[5], 0.0);
        assert!(mask0.weights[3] > 0.7);
        assert!(!mask0.used_fallback);
    }

    #[test]
    fn test_fallback_keeps_fully_overlapped_speaker() {
        let mut w = Array2::zeros((10, LOCAL_SPEAKERS));
        // Speakers 0 and 1 overlap on every active frame.
        for f in 0..5 {
            w[[f, 0]] = 0.9;
            w[[f, 1]] = 0.9;
        }
        let masks = conditioner(10).condition(&chunk_with_weights(w));
        assert_eq!(masks.len(), 2);
        for mask in &masks {
            assert!(mask.used_fallback);
            assert!(mask.weights[..5].iter().all(|&v| v > 0.8));
        }
    }

    #[test]
    fn test_resample_identity_at_same_length() {
        let input: Vec<f32> = (0..589).map(|i| (i as f32 * 0.37).sin().abs()).collect();
        let out = resample_linear(&input, input.len());
        for (a, b) in input.iter().zip(&out) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_resample_half_pixel_geometry() {
        // Downsampling [0, 1, 2, 3] to 2 samples: output i maps to source
        // (i + 0.5) * 2 - 0.5, i.e. coordinates 0.5 and 2.5.
        let out = resample_linear(&[0.0, 1.0, 2.0, 3.0], 2);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_clamps_edges_on_upsample() {
        let out = resample_linear(&[1.0, 3.0], 4);
        // Coordinates: -0.25 -> clamp 0.0, 0.25, 0.75, 1.25 -> clamp 1.0.
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 1.5).abs() < 1e-6);
        assert!((out[2] - 2.5).abs() < 1e-6);
        assert!((out[3] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_active_range_bounds() {
        assert_eq!(active_range(&[0.0, 0.0, 0.5, 0.2, 0.0]), Some((2, 3)));
        assert_eq!(active_range(&[0.0; 4]), None);
    }
}
