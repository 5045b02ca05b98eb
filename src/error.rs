//! Diarization error type
//!
//! Single error enum surfaced by every public API in the crate. Internal
//! model adapters report `anyhow::Error`; components map those into the
//! variants here at their boundary.

use thiserror::Error;

/// Errors produced by the diarization pipeline and its components.
#[derive(Debug, Error)]
pub enum DiarizationError {
    /// A configuration field is outside its documented bounds. Surfaced at init.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },

    /// A model handle was used before it was provided or loaded.
    #[error("model not loaded: {name}")]
    ModelNotLoaded { name: String },

    /// Model output could not be interpreted under the inference contract.
    #[error("model {name} produced unusable output: {reason}")]
    ModelShape { name: String, reason: String },

    /// Embedding batch size outside [1, 32]. Fatal at init.
    #[error("invalid batch size: {reason}")]
    InvalidBatchSize { reason: String },

    /// Generic internal failure (NaN input, dendrogram error, unexpected shape).
    #[error("processing failed: {reason}")]
    ProcessingFailed { reason: String },

    /// No input audio, or no usable speaker masks were produced. Distinct
    /// from corruption so callers can treat silence as a benign outcome.
    #[error("no speech detected in input audio")]
    NoSpeechDetected,

    /// The optional embedding export could not be written. Never fatal to
    /// the core outputs.
    #[error("embedding export failed: {reason}")]
    ExportFailed { reason: String },

    /// Cooperative cancellation was observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,
}

impl DiarizationError {
    /// Shorthand for a `ProcessingFailed` with a formatted reason.
    pub(crate) fn processing(reason: impl Into<String>) -> Self {
        Self::ProcessingFailed {
            reason: reason.into(),
        }
    }

    /// Wrap a model adapter error, preserving the model name.
    pub(crate) fn model_shape(name: &str, reason: impl Into<String>) -> Self {
        Self::ModelShape {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
