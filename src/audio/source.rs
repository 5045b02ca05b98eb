//! Audio sample sources
//!
//! The pipeline reads 16 kHz mono f32 samples through the [`AudioSource`]
//! abstraction. Two implementations are provided: an in-memory buffer for
//! already-decoded audio, and a WAV-file reader for on-disk recordings.
//! The core never mutates or resamples source audio.

use crate::error::DiarizationError;
use std::path::Path;

/// Read-only access to a finite mono f32 sample stream.
///
/// Implementations must be cheap to query: `copy_samples` is called once per
/// window step on the hot path of the segmentation runner.
pub trait AudioSource: Send + Sync {
    /// Total number of samples available.
    fn sample_count(&self) -> usize;

    /// Copy `dst.len()` samples starting at `offset` into `dst`.
    ///
    /// Fails when the requested range extends past the end of the source.
    fn copy_samples(&self, dst: &mut [f32], offset: usize) -> Result<(), DiarizationError>;
}

/// Samples held in memory.
#[derive(Debug, Clone)]
pub struct MemoryAudioSource {
    samples: Vec<f32>,
}

impl MemoryAudioSource {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

impl AudioSource for MemoryAudioSource {
    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn copy_samples(&self, dst: &mut [f32], offset: usize) -> Result<(), DiarizationError> {
        let end = offset
            .checked_add(dst.len())
            .ok_or_else(|| DiarizationError::processing("sample range overflows usize"))?;
        if end > self.samples.len() {
            return Err(DiarizationError::processing(format!(
                "sample range {}..{} out of bounds (source has {} samples)",
                offset,
                end,
                self.samples.len()
            )));
        }
        dst.copy_from_slice(&self.samples[offset..end]);
        Ok(())
    }
}

/// Samples decoded from a 16 kHz mono WAV file.
///
/// The file is decoded fully at construction; diarization touches windows in
/// overlapping strides, so streaming decode would re-read most of the file
/// several times over.
#[derive(Debug, Clone)]
pub struct WavFileAudioSource {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl WavFileAudioSource {
    /// Open and decode a WAV file, validating the 16 kHz mono contract.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DiarizationError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| {
            DiarizationError::processing(format!("failed to open {}: {}", path.display(), e))
        })?;
        let spec = reader.spec();

        if spec.channels != 1 {
            return Err(DiarizationError::processing(format!(
                "{}: expected mono audio, got {} channels",
                path.display(),
                spec.channels
            )));
        }
        if spec.sample_rate != 16_000 {
            return Err(DiarizationError::processing(format!(
                "{}: expected 16 kHz audio, got {} Hz",
                path.display(),
                spec.sample_rate
            )));
        }

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    DiarizationError::processing(format!("failed to decode samples: {}", e))
                })?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        DiarizationError::processing(format!("failed to decode samples: {}", e))
                    })?
            }
        };

        tracing::debug!(
            "loaded {} samples ({:.2}s) from {}",
            samples.len(),
            samples.len() as f32 / spec.sample_rate as f32,
            path.display()
        );

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioSource for WavFileAudioSource {
    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn copy_samples(&self, dst: &mut [f32], offset: usize) -> Result<(), DiarizationError> {
        let end = offset
            .checked_add(dst.len())
            .ok_or_else(|| DiarizationError::processing("sample range overflows usize"))?;
        if end > self.samples.len() {
            return Err(DiarizationError::processing(format!(
                "sample range {}..{} out of bounds (source has {} samples)",
                offset,
                end,
                self.samples.len()
            )));
        }
        dst.copy_from_slice(&self.samples[offset..end]);
        Ok(())
    }
}
