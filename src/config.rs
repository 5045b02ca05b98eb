//! Diarization configuration
//!
//! All tunables recognized by the pipeline, grouped per stage, each with
//! the documented default. `DiarizationConfig::validate` enforces every
//! numeric bound before any model is touched.

use crate::error::DiarizationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sliding-window segmentation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Duration of one segmentation window in seconds
    pub window_duration_s: f64,

    /// Input sample rate in Hz; the pipeline requires 16 kHz mono f32
    pub sample_rate: u32,

    /// Minimum duration a speaker must stay active for a segment to open (s)
    pub min_duration_on: f64,

    /// Minimum silence before a segment is considered closed (s)
    pub min_duration_off: f64,

    /// Window step as a fraction of the window length (0.0-1.0)
    pub step_ratio: f64,

    /// Frame activation level above which a frame counts as speech (0.0-1.0)
    pub speech_onset_threshold: f32,

    /// Frame activation level below which speech is considered ended (0.0-1.0)
    pub speech_offset_threshold: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            window_duration_s: 10.0,
            sample_rate: 16_000,
            min_duration_on: 0.0,
            min_duration_off: 0.0,
            step_ratio: 0.2,
            speech_onset_threshold: 0.5,
            speech_offset_threshold: 0.5,
        }
    }
}

impl SegmentationConfig {
    /// Samples per window.
    pub fn window_samples(&self) -> usize {
        (self.sample_rate as f64 * self.window_duration_s) as usize
    }

    /// Samples per window step.
    pub fn step_samples(&self) -> usize {
        ((self.window_samples() as f64) * self.step_ratio).floor() as usize
    }
}

/// Speaker embedding extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Windows per inference batch (1-32)
    pub batch_size: usize,

    /// Zero out frames where more than one speaker is active
    pub exclude_overlap: bool,

    /// Minimum snippet duration eligible for embedding extraction (s)
    pub min_segment_duration_s: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            exclude_overlap: true,
            min_segment_duration_s: 1.0,
        }
    }
}

/// Clustering parameters for the AHC warm-start and the VBx prior scales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Cosine similarity threshold for the AHC cut, in [-1, 1]. The cut
    /// distance is derived as `sqrt(max(0, 2 - 2 * threshold))`, so -1
    /// merges everything and 1 keeps every embedding apart.
    pub threshold: f64,

    /// VBx acoustic scaling factor Fa (> 0)
    pub warm_start_fa: f64,

    /// VBx speaker regularization factor Fb (> 0)
    pub warm_start_fb: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            warm_start_fa: 0.07,
            warm_start_fb: 0.8,
        }
    }
}

/// VBx EM loop controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbxConfig {
    /// Maximum EM iterations
    pub max_iterations: usize,

    /// ELBO convergence tolerance
    pub convergence_tolerance: f64,
}

impl Default for VbxConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            convergence_tolerance: 1e-4,
        }
    }
}

/// Segment post-processing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessingConfig {
    /// Gaps shorter than this are bridged when merging same-speaker segments (s)
    pub min_gap_duration_s: f64,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            min_gap_duration_s: 0.1,
        }
    }
}

/// Optional side outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// When set, per-speaker centroid embeddings are written here as JSON
    pub embeddings_path: Option<PathBuf>,
}

/// Complete configuration for the offline diarization pipeline.
///
/// ```rust
/// use diarium::config::DiarizationConfig;
///
/// let mut config = DiarizationConfig::default();
/// config.clustering.threshold = 0.7;
/// config.validate().expect("defaults are valid");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiarizationConfig {
    pub segmentation: SegmentationConfig,
    pub embedding: EmbeddingConfig,
    pub clustering: ClusteringConfig,
    pub vbx: VbxConfig,
    pub post_processing: PostProcessingConfig,
    pub export: ExportConfig,
}

impl DiarizationConfig {
    /// Check every documented bound. Called by the pipeline constructor;
    /// callers building stages by hand should call it themselves.
    pub fn validate(&self) -> Result<(), DiarizationError> {
        let seg = &self.segmentation;
        if seg.window_duration_s <= 0.0 || !seg.window_duration_s.is_finite() {
            return Err(invalid(
                "segmentation.window_duration_s",
                format!("must be positive and finite, got {}", seg.window_duration_s),
            ));
        }
        if seg.sample_rate == 0 {
            return Err(invalid("segmentation.sample_rate", "must be nonzero"));
        }
        if !(seg.step_ratio > 0.0 && seg.step_ratio <= 1.0) {
            return Err(invalid(
                "segmentation.step_ratio",
                format!("must be in (0, 1], got {}", seg.step_ratio),
            ));
        }
        if seg.min_duration_on < 0.0 {
            return Err(invalid("segmentation.min_duration_on", "must be >= 0"));
        }
        if seg.min_duration_off < 0.0 {
            return Err(invalid("segmentation.min_duration_off", "must be >= 0"));
        }
        if !(0.0..=1.0).contains(&seg.speech_onset_threshold)
            || !(0.0..=1.0).contains(&seg.speech_offset_threshold)
            || seg.speech_offset_threshold > seg.speech_onset_threshold
        {
            return Err(invalid(
                "segmentation.speech_offset_threshold",
                format!(
                    "thresholds must satisfy 0 <= offset <= onset <= 1, got onset={} offset={}",
                    seg.speech_onset_threshold, seg.speech_offset_threshold
                ),
            ));
        }

        let emb = &self.embedding;
        if emb.batch_size == 0 || emb.batch_size > 32 {
            return Err(DiarizationError::InvalidBatchSize {
                reason: format!("embedding batch size must be in [1, 32], got {}", emb.batch_size),
            });
        }
        if emb.min_segment_duration_s <= 0.0 || !emb.min_segment_duration_s.is_finite() {
            return Err(invalid(
                "embedding.min_segment_duration_s",
                format!("must be positive and finite, got {}", emb.min_segment_duration_s),
            ));
        }

        let clu = &self.clustering;
        if !(-1.0..=1.0).contains(&clu.threshold) {
            return Err(invalid(
                "clustering.threshold",
                format!("must be a cosine similarity in [-1, 1], got {}", clu.threshold),
            ));
        }
        if clu.warm_start_fa <= 0.0 || !clu.warm_start_fa.is_finite() {
            return Err(invalid(
                "clustering.warm_start_fa",
                format!("must be positive, got {}", clu.warm_start_fa),
            ));
        }
        if clu.warm_start_fb <= 0.0 || !clu.warm_start_fb.is_finite() {
            return Err(invalid(
                "clustering.warm_start_fb",
                format!("must be positive, got {}", clu.warm_start_fb),
            ));
        }

        if self.vbx.max_iterations == 0 {
            return Err(invalid("vbx.max_iterations", "must be at least 1"));
        }
        if self.vbx.convergence_tolerance <= 0.0 || !self.vbx.convergence_tolerance.is_finite() {
            return Err(invalid(
                "vbx.convergence_tolerance",
                format!("must be positive, got {}", self.vbx.convergence_tolerance),
            ));
        }

        if self.post_processing.min_gap_duration_s < 0.0 {
            return Err(invalid("post_processing.min_gap_duration_s", "must be >= 0"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> DiarizationError {
    DiarizationError::InvalidConfiguration {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DiarizationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_window_and_step_samples() {
        let seg = SegmentationConfig::default();
        assert_eq!(seg.window_samples(), 160_000);
        assert_eq!(seg.step_samples(), 32_000);
    }

    #[test]
    fn test_step_ratio_bounds() {
        let mut config = DiarizationConfig::default();
        config.segmentation.step_ratio = 0.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            DiarizationError::InvalidConfiguration { field, .. } if field == "segmentation.step_ratio"
        ));
    }

    #[test]
    fn test_offset_must_not_exceed_onset() {
        let mut config = DiarizationConfig::default();
        config.segmentation.speech_onset_threshold = 0.3;
        config.segmentation.speech_offset_threshold = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_size_uses_dedicated_variant() {
        let mut config = DiarizationConfig::default();
        config.embedding.batch_size = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            DiarizationError::InvalidBatchSize { .. }
        ));

        config.embedding.batch_size = 33;
        assert!(matches!(
            config.validate().unwrap_err(),
            DiarizationError::InvalidBatchSize { .. }
        ));
    }

    #[test]
    fn test_clustering_threshold_covers_cosine_domain() {
        let mut config = DiarizationConfig::default();

        // Both extremes of the cosine similarity domain are meaningful:
        // -1 merges all embeddings, 1 keeps them all apart.
        config.clustering.threshold = -1.0;
        assert!(config.validate().is_ok());
        config.clustering.threshold = 1.0;
        assert!(config.validate().is_ok());
        config.clustering.threshold = 0.0;
        assert!(config.validate().is_ok());

        config.clustering.threshold = -1.1;
        assert!(config.validate().is_err());
        config.clustering.threshold = 1.5;
        assert!(config.validate().is_err());
        config.clustering.threshold = f64::NAN;
        assert!(config.validate().is_err());
    }
}
