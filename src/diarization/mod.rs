//! Speaker diarization module
//!
//! Offline "who spoke when" labeling: sliding-window segmentation, speaker
//! mask conditioning, embedding extraction, two-stage clustering (AHC
//! warm-start + VBx refinement), and timeline reconstruction, plus a
//! streaming speaker tracker for live labeling.

pub mod clustering;
pub mod embedder;
pub mod masks;
pub mod pipeline;
pub mod segmentation;
pub mod timeline;
pub mod tracker;
pub mod types;

pub use pipeline::{export_embeddings, DiarizationPipeline, ModelSet};
pub use tracker::{
    MergeCandidate, RawEmbedding, Speaker, StreamingSpeakerTracker, TrackerConfig,
    TrackerStatistics,
};
pub use types::{
    ChunkAssignment, DiarizationResult, SegmentationChunk, SegmentationOutput, SegmentationStats,
    SpeakerMask, StageTimings, TimedEmbedding, TimedSpeakerSegment, LOCAL_SPEAKERS,
    POWERSET_CLASSES,
};
