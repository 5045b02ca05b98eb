//! Timeline reconstruction
//!
//! Projects clustered per-chunk local-speaker labels onto a single global
//! frame timeline, regularizes per-frame speaker counts by the expected
//! concurrent-speaker estimate, and emits merged, sanitized segments.

use super::types::{ChunkAssignment, SegmentationChunk, TimedSpeakerSegment, LOCAL_SPEAKERS};
use std::collections::HashMap;
use tracing::{debug, info};

/// Post-processing policies applied while flattening the frame timeline.
#[derive(Debug, Clone, Copy)]
pub struct TimelineReconstructor {
    /// Gaps up to this length are bridged when merging same-speaker segments
    pub min_gap_duration_s: f64,

    /// Segmentation hangover: silences shorter than this do not end a turn
    pub min_duration_off: f64,

    /// Segmentation onset: activity shorter than this does not open a turn
    pub min_duration_on: f64,

    /// Shortest segment worth keeping (s)
    pub min_segment_duration_s: f64,

    /// Enforce pairwise non-overlapping output segments
    pub exclude_overlap: bool,
}

/// Per-cluster accumulator for an open segment during the frame sweep.
#[derive(Debug, Clone, Copy)]
struct OpenSegment {
    start_frame: usize,
    score_sum: f64,
    frames: usize,
}

/// Raw segment before merge and sanitize passes.
#[derive(Debug, Clone, Copy)]
struct RawSegment {
    cluster: usize,
    start_s: f64,
    end_s: f64,
    quality: f32,
}

impl TimelineReconstructor {
    /// Flatten chunks and assignments into the final ordered segment list.
    /// Runs to completion on the calling task.
    pub fn reconstruct(
        &self,
        chunks: &[SegmentationChunk],
        assignments: &HashMap<usize, ChunkAssignment>,
        cluster_count: usize,
    ) -> Vec<TimedSpeakerSegment> {
        if chunks.is_empty() || cluster_count == 0 {
            return Vec::new();
        }

        let frame_duration = chunks[0].frame_duration_s;
        let max_end = chunks.iter().map(|c| c.end_s()).fold(0.0f64, f64::max);
        let total_frames = (max_end / frame_duration).ceil() as usize;
        if total_frames == 0 {
            return Vec::new();
        }
        let k = cluster_count;

        // Frame-level accumulation across overlapping chunks.
        let mut activation_sum = vec![0.0f64; total_frames * k];
        let mut activation_count = vec![0u32; total_frames * k];
        let mut expected_sum = vec![0.0f64; total_frames];
        let mut contributing = vec![0u32; total_frames];

        for chunk in chunks {
            let Some(assignment) = assignments.get(&chunk.chunk_index) else {
                continue;
            };
            let base = (chunk.offset_s / frame_duration).round() as usize;
            for f in 0..chunk.frames() {
                let g = base + f;
                if g >= total_frames {
                    break;
                }
                contributing[g] += 1;
                let mut frame_total = 0.0f64;
                for s in 0..LOCAL_SPEAKERS {
                    frame_total += chunk.speaker_weights[[f, s]] as f64;
                }
                expected_sum[g] += frame_total;

                for cluster in 0..k {
                    let mut present = false;
                    let mut weight = 0.0f32;
                    for s in 0..LOCAL_SPEAKERS {
                        if assignment[s] == cluster as i32 {
                            present = true;
                            weight = weight.max(chunk.speaker_weights[[f, s]]);
                        }
                    }
                    if present {
                        activation_sum[g * k + cluster] += weight as f64;
                        activation_count[g * k + cluster] += 1;
                    }
                }
            }
        }

        // Sweep frames left to right, opening and flushing per-cluster
        // accumulators as the active set changes.
        let max_concurrent = k.min(LOCAL_SPEAKERS);
        let mut open: Vec<Option<OpenSegment>> = vec![None; k];
        let mut raw: Vec<RawSegment> = Vec::new();
        let mut ranked: Vec<usize> = Vec::with_capacity(k);

        for t in 0..total_frames {
            let expected = if contributing[t] > 0 {
                let mean = expected_sum[t] / contributing[t] as f64;
                (mean.round_ties_even() as usize).min(max_concurrent)
            } else {
                0
            };

            ranked.clear();
            ranked.extend((0..k).filter(|&c| activation_sum[t * k + c] > 0.0));
            ranked.sort_by(|&a, &b| {
                activation_sum[t * k + b]
                    .partial_cmp(&activation_sum[t * k + a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            let active = &ranked[..expected.min(ranked.len())];

            for cluster in 0..k {
                let is_active = active.contains(&cluster);
                match (open[cluster], is_active) {
                    (None, true) => {
                        open[cluster] = Some(OpenSegment {
                            start_frame: t,
                            score_sum: 0.0,
                            frames: 0,
                        });
                    }
                    (Some(segment), false) => {
                        raw.push(close_segment(cluster, &segment, t, frame_duration));
                        open[cluster] = None;
                    }
                    _ => {}
                }
                if is_active {
                    let segment = open[cluster].as_mut().unwrap();
                    let count = activation_count[t * k + cluster].max(1) as f64;
                    segment.score_sum += activation_sum[t * k + cluster] / count;
                    segment.frames += 1;
                }
            }
        }
        for cluster in 0..k {
            if let Some(segment) = open[cluster] {
                raw.push(close_segment(cluster, &segment, total_frames, frame_duration));
            }
        }
        debug!("timeline sweep produced {} raw segments", raw.len());

        let merged = self.merge_adjacent(raw);
        let segments = self.sanitize(merged);
        info!("timeline reconstruction: {} final segments", segments.len());
        segments
    }

    /// Collapse same-speaker neighbours separated by less than the gap
    /// threshold; blended quality is duration-weighted.
    fn merge_adjacent(&self, mut raw: Vec<RawSegment>) -> Vec<RawSegment> {
        let gap_threshold = self.min_gap_duration_s.max(self.min_duration_off);
        raw.sort_by(|a, b| {
            a.start_s
                .partial_cmp(&b.start_s)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cluster.cmp(&b.cluster))
        });

        let mut merged: Vec<RawSegment> = Vec::with_capacity(raw.len());
        for segment in raw {
            if let Some(last) = merged
                .iter_mut()
                .rev()
                .find(|candidate| candidate.cluster == segment.cluster)
            {
                let gap = segment.start_s - last.end_s;
                if gap <= gap_threshold {
                    let dur_a = last.end_s - last.start_s;
                    let dur_b = segment.end_s - segment.start_s;
                    let blended = (last.quality as f64 * dur_a + segment.quality as f64 * dur_b)
                        / (dur_a + dur_b).max(f64::MIN_POSITIVE);
                    last.end_s = last.end_s.max(segment.end_s);
                    last.quality = blended as f32;
                    continue;
                }
            }
            merged.push(segment);
        }
        merged
    }

    /// Drop short segments, enforce non-overlap when requested, and produce
    /// the final ordered, labeled segments.
    fn sanitize(&self, mut raw: Vec<RawSegment>) -> Vec<TimedSpeakerSegment> {
        let min_duration = self.min_segment_duration_s.max(self.min_duration_on);
        raw.retain(|s| s.end_s - s.start_s >= min_duration);
        raw.sort_by(|a, b| {
            a.start_s
                .partial_cmp(&b.start_s)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cluster.cmp(&b.cluster))
        });

        let mut segments: Vec<TimedSpeakerSegment> = Vec::with_capacity(raw.len());
        let mut previous_end = f64::NEG_INFINITY;
        for segment in raw {
            let mut start = segment.start_s;
            let mut quality = segment.quality;
            if self.exclude_overlap && start < previous_end {
                let original = segment.end_s - segment.start_s;
                start = previous_end;
                if segment.end_s - start <= 0.0 {
                    continue;
                }
                quality *= ((segment.end_s - start) / original) as f32;
            }
            previous_end = previous_end.max(segment.end_s);
            segments.push(TimedSpeakerSegment {
                speaker_id: format!("S{}", segment.cluster + 1),
                start_s: start,
                end_s: segment.end_s,
                quality: quality.clamp(0.0, 1.0),
                centroid: None,
            });
        }

        segments.sort_by(|a, b| {
            a.start_s
                .partial_cmp(&b.start_s)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.speaker_id.cmp(&b.speaker_id))
        });
        segments
    }
}

fn close_segment(
    cluster: usize,
    segment: &OpenSegment,
    end_frame: usize,
    frame_duration: f64,
) -> RawSegment {
    let quality = if segment.frames > 0 {
        (segment.score_sum / segment.frames as f64).clamp(0.0, 1.0) as f32
    } else {
        0.0
    };
    RawSegment {
        cluster,
        start_s: segment.start_frame as f64 * frame_duration,
        end_s: end_frame as f64 * frame_duration,
        quality,
    }
}
