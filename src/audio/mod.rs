//! Audio access module
//!
//! Provides read-only sample sources consumed by the diarization pipeline.

pub mod source;

pub use source::{AudioSource, MemoryAudioSource, WavFileAudioSource};
