//! Speaker diarization type definitions
//!
//! Core data model shared by the segmentation, embedding, clustering, and
//! timeline stages.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of local speaker slots the segmentation model predicts per chunk.
pub const LOCAL_SPEAKERS: usize = 3;

/// Powerset class count for three speakers (the empty set, three singletons,
/// three pairs). Some exports pad an eighth all-active class with zeros;
/// both layouts are accepted.
pub const POWERSET_CLASSES: usize = 7;

/// One segmentation window's worth of model output.
///
/// `log_probs` rows are log-softmax normalized class vectors over the
/// powerset classes; `speaker_weights` rows are the marginal per-speaker
/// activations derived from them, clipped to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SegmentationChunk {
    /// Position of this chunk in the stream, starting at 0
    pub chunk_index: usize,

    /// Offset of the window start from the beginning of the recording (s)
    pub offset_s: f64,

    /// Duration covered by one output frame (s)
    pub frame_duration_s: f64,

    /// `frames x classes` log-probabilities
    pub log_probs: Array2<f32>,

    /// `frames x speakers` soft activity weights
    pub speaker_weights: Array2<f32>,

    /// Per-frame argmax class
    pub hard_labels: Vec<usize>,
}

impl SegmentationChunk {
    pub fn frames(&self) -> usize {
        self.log_probs.nrows()
    }

    /// End of the window on the recording timeline (s).
    pub fn end_s(&self) -> f64 {
        self.offset_s + self.frames() as f64 * self.frame_duration_s
    }
}

/// Ordered segmentation output for a whole recording.
#[derive(Debug, Clone, Default)]
pub struct SegmentationOutput {
    /// Chunks in strict ascending offset order
    pub chunks: Vec<SegmentationChunk>,

    /// Chunk offsets in seconds, parallel to `chunks`
    pub chunk_offsets_s: Vec<f64>,

    /// Frames per chunk (constant within a run)
    pub frames_per_chunk: usize,

    /// Frame duration in seconds
    pub frame_duration_s: f64,

    /// Diagnostic counters accumulated by the runner
    pub stats: SegmentationStats,
}

/// Diagnostic statistics from the segmentation pass. Logged, not consumed
/// downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentationStats {
    /// Frames whose strongest speaker activation exceeded the onset threshold
    pub speech_frames: usize,

    /// Frames whose strongest speaker activation fell below the offset
    /// threshold
    pub silence_frames: usize,

    /// Total frames scored
    pub total_frames: usize,

    /// 10th/50th/90th percentile of winning-class confidence
    pub confidence_percentiles: (f32, f32, f32),

    /// Mean probability of the empty (no-speaker) class
    pub mean_empty_probability: f32,
}

/// A per-(chunk, local speaker) activity mask ready for the embedding model.
#[derive(Debug, Clone)]
pub struct SpeakerMask {
    pub chunk_index: usize,
    pub local_speaker: usize,

    /// Activity weights in `[0, 1]`, resampled to the embedding model's
    /// expected weight length
    pub weights: Vec<f32>,

    /// First frame with weight above the activity floor
    pub first_active: usize,

    /// Last frame with weight above the activity floor
    pub last_active: usize,

    /// Whether overlap filtering was rolled back to keep the mask usable
    pub used_fallback: bool,
}

impl SpeakerMask {
    /// Snippet start on the recording timeline.
    pub fn start_s(&self, chunk_offset_s: f64, frame_duration_s: f64) -> f64 {
        chunk_offset_s + self.first_active as f64 * frame_duration_s
    }

    /// Snippet end on the recording timeline (exclusive frame bound).
    pub fn end_s(&self, chunk_offset_s: f64, frame_duration_s: f64) -> f64 {
        chunk_offset_s + (self.last_active + 1) as f64 * frame_duration_s
    }
}

/// A speaker snippet embedding with its provenance and clustering features.
#[derive(Debug, Clone)]
pub struct TimedEmbedding {
    pub chunk_index: usize,
    pub local_speaker: usize,
    pub start_s: f64,
    pub end_s: f64,

    /// Conditioned frame weights used for extraction
    pub frame_weights: Vec<f32>,

    /// 256-d L2-normalized speaker embedding
    pub embedding: Vec<f32>,

    /// PLDA-projected feature consumed by clustering
    pub rho: Vec<f64>,
}

/// Per-chunk cluster ids for the three local speaker slots; `-1` marks a
/// slot that produced no usable embedding.
pub type ChunkAssignment = [i32; LOCAL_SPEAKERS];

/// A final speaker-labeled time interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSpeakerSegment {
    /// Stable label of the form `"S1"`, `"S2"`, ...
    pub speaker_id: String,

    /// Start time in seconds
    pub start_s: f64,

    /// End time in seconds, strictly greater than `start_s`
    pub end_s: f64,

    /// Mean activation across the segment's frames, in `[0, 1]`
    pub quality: f32,

    /// Centroid embedding of the snippets backing this segment
    pub centroid: Option<Vec<f32>>,
}

impl TimedSpeakerSegment {
    pub fn duration_s(&self) -> f64 {
        self.end_s - self.start_s
    }
}

/// Wall-clock stage timings for one pipeline run, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub audio_loading_s: f64,
    pub segmentation_s: f64,
    pub embedding_s: f64,
    pub clustering_s: f64,
    pub post_processing_s: f64,
}

/// Complete diarization result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiarizationResult {
    /// Speaker segments sorted by start time, ties by speaker id
    pub segments: Vec<TimedSpeakerSegment>,

    /// Per-speaker centroid embeddings (mean of segment centroids)
    pub speaker_database: HashMap<String, Vec<f32>>,

    /// Per-stage wall-clock timings
    pub timings: StageTimings,

    /// Non-fatal notes accumulated during processing
    pub warnings: Vec<String>,
}

impl DiarizationResult {
    /// Number of distinct speakers in the output.
    pub fn speaker_count(&self) -> usize {
        self.speaker_database.len()
    }

    /// Total labeled speech time in seconds.
    pub fn total_speech_s(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_s()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_chunk_end_time() {
        let chunk = SegmentationChunk {
            chunk_index: 2,
            offset_s: 4.0,
            frame_duration_s: 0.5,
            log_probs: Array2::zeros((4, POWERSET_CLASSES)),
            speaker_weights: Array2::zeros((4, LOCAL_SPEAKERS)),
            hard_labels: vec![0; 4],
        };
        assert_eq!(chunk.frames(), 4);
        assert!((chunk.end_s() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_mask_time_range() {
        let mask = SpeakerMask {
            chunk_index: 0,
            local_speaker: 1,
            weights: vec![0.0, 1.0, 1.0, 0.0],
            first_active: 1,
            last_active: 2,
            used_fallback: false,
        };
        assert!((mask.start_s(10.0, 0.25) - 10.25).abs() < 1e-12);
        assert!((mask.end_s(10.0, 0.25) - 10.75).abs() < 1e-12);
    }

    #[test]
    fn test_result_totals() {
        let result = DiarizationResult {
            segments: vec![
                TimedSpeakerSegment {
                    speaker_id: "S1".into(),
                    start_s: 0.0,
                    end_s: 2.0,
                    quality: 0.9,
                    centroid: None,
                },
                TimedSpeakerSegment {
                    speaker_id: "S2".into(),
                    start_s: 2.0,
                    end_s: 2.5,
                    quality: 0.8,
                    centroid: None,
                },
            ],
            speaker_database: HashMap::from([
                ("S1".to_string(), vec![0.0; 4]),
                ("S2".to_string(), vec![0.0; 4]),
            ]),
            ..Default::default()
        };
        assert_eq!(result.speaker_count(), 2);
        assert!((result.total_speech_s() - 2.5).abs() < 1e-12);
    }
}
