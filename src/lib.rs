//! diarium - offline speaker diarization for on-device audio pipelines
//!
//! Given a 16 kHz mono recording, the pipeline produces a sequence of
//! non-overlapping speaker-labeled time intervals ("who spoke when"):
//! a neural segmentation model scores sliding windows, per-speaker activity
//! masks gate a speaker embedding model, PLDA-projected embeddings are
//! clustered with an AHC warm-start refined by VBx, and cluster labels are
//! projected back onto a global timeline.
//!
//! Audio decoding beyond WAV, model download and compilation, and
//! transcription are out of scope; models are consumed through the
//! [`inference::ModelPredictor`] named-tensor interface.
//!
//! ```no_run
//! # async fn run(models: diarium::diarization::ModelSet) -> Result<(), diarium::DiarizationError> {
//! use diarium::audio::WavFileAudioSource;
//! use diarium::config::DiarizationConfig;
//! use diarium::diarization::DiarizationPipeline;
//! use diarium::inference::PldaParameters;
//!
//! let psi = PldaParameters::from_file("plda.json")?;
//! let pipeline = DiarizationPipeline::new(DiarizationConfig::default(), models, psi)?;
//! let source = WavFileAudioSource::open("meeting.wav")?;
//! let result = pipeline.diarize(&source).await?;
//! println!("{} speakers found", result.speaker_count());
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod diarization;
pub mod error;
pub mod inference;

pub use config::DiarizationConfig;
pub use diarization::{DiarizationPipeline, DiarizationResult, ModelSet, StreamingSpeakerTracker};
pub use error::DiarizationError;
