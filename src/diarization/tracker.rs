//! Streaming speaker tracker
//!
//! Maintains an in-memory speaker database across successively arriving
//! embeddings in a live diarization stream. Assignment is cosine-distance
//! thresholded; confirmed matches update the speaker's main embedding by an
//! exponential moving average and append to a bounded raw-embedding history.
//!
//! The database supports many concurrent readers and exclusive writers;
//! queries hand out snapshots.

use crate::error::DiarizationError;
use crate::inference::EMBEDDING_DIM;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::{debug, info, trace};

/// Squared-norm floor below which an incoming embedding is rejected.
const NORM_FLOOR_SQ: f32 = 0.01;

/// Tracker thresholds and update policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Cosine distance below which an embedding is assigned to a speaker
    pub speaker_threshold: f32,

    /// Stricter distance required before the main embedding is updated
    pub embedding_threshold: f32,

    /// Minimum snippet duration for a main-embedding update (s)
    pub min_embedding_update_duration_s: f32,

    /// Minimum snippet duration for enrolling a new speaker (s)
    pub min_speech_duration_s: f32,

    /// EMA weight on the previous main embedding
    pub embedding_update_alpha: f32,

    /// Capacity of the per-speaker raw embedding FIFO
    pub raw_history_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            speaker_threshold: 0.65,
            embedding_threshold: 0.45,
            min_embedding_update_duration_s: 2.0,
            min_speech_duration_s: 1.0,
            embedding_update_alpha: 0.9,
            raw_history_capacity: 50,
        }
    }
}

/// One raw embedding retained in a speaker's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEmbedding {
    pub vector: Vec<f32>,
    pub duration_s: f32,
    pub added_at: DateTime<Utc>,
}

/// A tracked speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    /// Auto-incremented numeric id rendered as a string ("1", "2", ...)
    pub id: String,

    /// Display name, defaults to "Speaker <id>"
    pub name: String,

    /// L2-normalized 256-d main embedding
    pub current_embedding: Vec<f32>,

    /// Total assigned speech duration (s)
    pub accumulated_duration_s: f32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Number of embeddings assigned to this speaker
    pub update_count: u32,

    /// Bounded FIFO of raw embeddings backing merge recalculation
    pub raw_embeddings: VecDeque<RawEmbedding>,

    /// Permanent speakers survive cleanup operations
    pub is_permanent: bool,
}

impl Speaker {
    fn new(id: String, vector: Vec<f32>, duration_s: f32) -> Self {
        let now = Utc::now();
        let mut raw = VecDeque::new();
        raw.push_back(RawEmbedding {
            vector: vector.clone(),
            duration_s,
            added_at: now,
        });
        Self {
            name: format!("Speaker {}", id),
            id,
            current_embedding: vector,
            accumulated_duration_s: duration_s,
            created_at: now,
            updated_at: now,
            update_count: 1,
            raw_embeddings: raw,
            is_permanent: false,
        }
    }
}

/// A proposed merge between two similar speakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub source_id: String,
    pub destination_id: String,
    pub distance: f32,
}

/// Aggregate view of the database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerStatistics {
    pub total_speakers: usize,
    pub permanent_speakers: usize,

    /// Sum of accumulated speech duration across speakers (s)
    pub total_speech_s: f32,

    /// Mean update count per speaker
    pub average_updates: f32,
}

#[derive(Debug, Default)]
struct DatabaseInner {
    speakers: HashMap<String, Speaker>,
    next_id: u64,
}

/// Thread-safe speaker database for live diarization.
pub struct StreamingSpeakerTracker {
    config: TrackerConfig,
    inner: RwLock<DatabaseInner>,
}

impl Default for StreamingSpeakerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSpeakerTracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        info!(
            "initializing speaker tracker (speaker threshold {}, embedding threshold {})",
            config.speaker_threshold, config.embedding_threshold
        );
        Self {
            config,
            inner: RwLock::new(DatabaseInner {
                speakers: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Assign an embedding to an existing or new speaker.
    ///
    /// Returns a snapshot of the affected speaker, or `None` when the
    /// embedding is invalid or the snippet is too short to enroll.
    pub fn assign_speaker(&self, embedding: &[f32], duration_s: f32) -> Option<Speaker> {
        self.assign_speaker_with(embedding, duration_s, 1.0, None)
    }

    /// `assign_speaker` with an explicit confidence and threshold override.
    pub fn assign_speaker_with(
        &self,
        embedding: &[f32],
        duration_s: f32,
        confidence: f32,
        threshold: Option<f32>,
    ) -> Option<Speaker> {
        let normalized = normalize_embedding(embedding)?;
        let threshold = threshold.unwrap_or(self.config.speaker_threshold);

        let mut inner = self.write_lock();
        let closest = closest_speaker(&inner.speakers, &normalized);

        if let Some((id, distance)) = closest {
            if distance < threshold {
                let update_main = distance < self.config.embedding_threshold
                    && duration_s >= self.config.min_embedding_update_duration_s;
                let alpha = self.config.embedding_update_alpha;
                let capacity = self.config.raw_history_capacity;
                let speaker = inner.speakers.get_mut(&id)?;

                speaker.accumulated_duration_s += duration_s;
                speaker.update_count += 1;
                speaker.updated_at = Utc::now();

                if update_main {
                    for (current, &incoming) in
                        speaker.current_embedding.iter_mut().zip(&normalized)
                    {
                        *current = alpha * *current + (1.0 - alpha) * incoming;
                    }
                    renormalize(&mut speaker.current_embedding);
                    if speaker.raw_embeddings.len() == capacity {
                        speaker.raw_embeddings.pop_front();
                    }
                    speaker.raw_embeddings.push_back(RawEmbedding {
                        vector: normalized,
                        duration_s,
                        added_at: speaker.updated_at,
                    });
                }

                trace!(
                    "assigned embedding to speaker {} (distance {:.3}, confidence {:.2}, main update: {})",
                    id,
                    distance,
                    confidence,
                    update_main
                );
                return Some(speaker.clone());
            }
        }

        if duration_s >= self.config.min_speech_duration_s {
            let id = inner.next_id.to_string();
            inner.next_id += 1;
            let speaker = Speaker::new(id.clone(), normalized, duration_s);
            debug!("enrolled new speaker {} ({:.1}s of speech)", id, duration_s);
            inner.speakers.insert(id.clone(), speaker.clone());
            return Some(speaker);
        }

        trace!(
            "embedding unassigned: no match within {:.2} and snippet too short ({:.2}s)",
            threshold,
            duration_s
        );
        None
    }

    /// Read-only nearest-speaker query. The id is set only when the best
    /// distance beats `threshold`; the distance is always reported.
    pub fn find_speaker(&self, embedding: &[f32], threshold: Option<f32>) -> (Option<String>, f32) {
        let Some(normalized) = normalize_embedding(embedding) else {
            return (None, f32::MAX);
        };
        let threshold = threshold.unwrap_or(self.config.speaker_threshold);
        let inner = self.read_lock();
        match closest_speaker(&inner.speakers, &normalized) {
            Some((id, distance)) if distance < threshold => (Some(id), distance),
            Some((_, distance)) => (None, distance),
            None => (None, f32::MAX),
        }
    }

    /// All speakers within `threshold`, sorted ascending by distance.
    pub fn find_matching_speakers(
        &self,
        embedding: &[f32],
        threshold: Option<f32>,
    ) -> Vec<(String, f32)> {
        let Some(normalized) = normalize_embedding(embedding) else {
            return Vec::new();
        };
        let threshold = threshold.unwrap_or(self.config.speaker_threshold);
        let inner = self.read_lock();
        let mut matches: Vec<(String, f32)> = inner
            .speakers
            .values()
            .map(|s| (s.id.clone(), cosine_distance(&normalized, &s.current_embedding)))
            .filter(|(_, d)| *d < threshold)
            .collect();
        matches.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    pub fn make_permanent(&self, id: &str) -> bool {
        self.set_permanence(id, true)
    }

    pub fn revoke_permanence(&self, id: &str) -> bool {
        self.set_permanence(id, false)
    }

    fn set_permanence(&self, id: &str, permanent: bool) -> bool {
        let mut inner = self.write_lock();
        match inner.speakers.get_mut(id) {
            Some(speaker) => {
                speaker.is_permanent = permanent;
                speaker.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Merge `source_id` into `destination_id`.
    ///
    /// The destination absorbs the source's raw embeddings, recalculates its
    /// main embedding as the normalized mean of the combined raws, and sums
    /// durations; the source entry is removed. The destination keeps its own
    /// permanence flag.
    pub fn merge_speakers(
        &self,
        source_id: &str,
        destination_id: &str,
        name: Option<String>,
        stop_if_permanent: bool,
    ) -> Result<Speaker, DiarizationError> {
        if source_id == destination_id {
            return Err(DiarizationError::processing(
                "cannot merge a speaker into itself",
            ));
        }

        let mut inner = self.write_lock();
        if !inner.speakers.contains_key(destination_id) {
            return Err(DiarizationError::processing(format!(
                "unknown destination speaker '{}'",
                destination_id
            )));
        }
        let source = inner.speakers.get(source_id).ok_or_else(|| {
            DiarizationError::processing(format!("unknown source speaker '{}'", source_id))
        })?;
        if stop_if_permanent && source.is_permanent {
            return Err(DiarizationError::processing(format!(
                "source speaker '{}' is permanent",
                source_id
            )));
        }

        let source = inner.speakers.remove(source_id).unwrap();
        let capacity = self.config.raw_history_capacity;
        let destination = inner.speakers.get_mut(destination_id).unwrap();

        destination.raw_embeddings.extend(source.raw_embeddings);

        // The mean is taken over the full union before the FIFO is trimmed,
        // so the result does not depend on merge direction.
        if let Some(mean) = mean_embedding(destination.raw_embeddings.iter().map(|r| &r.vector)) {
            destination.current_embedding = mean;
        }
        while destination.raw_embeddings.len() > capacity {
            destination.raw_embeddings.pop_front();
        }

        destination.accumulated_duration_s += source.accumulated_duration_s;
        destination.update_count += source.update_count;
        if let Some(name) = name {
            destination.name = name;
        }
        destination.updated_at = Utc::now();

        info!(
            "merged speaker {} into {} ({} raw embeddings)",
            source_id,
            destination_id,
            destination.raw_embeddings.len()
        );
        Ok(destination.clone())
    }

    /// Enumerate unordered speaker pairs closer than `threshold`, each with
    /// a canonical merge direction: a non-permanent speaker is preferred as
    /// the source; otherwise the smaller id becomes the destination.
    pub fn find_mergeable_pairs(
        &self,
        threshold: f32,
        exclude_if_both_permanent: bool,
    ) -> Vec<MergeCandidate> {
        let inner = self.read_lock();
        let mut speakers: Vec<&Speaker> = inner.speakers.values().collect();
        speakers.sort_by(|a, b| id_order(&a.id, &b.id));

        let mut candidates = Vec::new();
        for i in 0..speakers.len() {
            for j in (i + 1)..speakers.len() {
                let (a, b) = (speakers[i], speakers[j]);
                if exclude_if_both_permanent && a.is_permanent && b.is_permanent {
                    continue;
                }
                let distance = cosine_distance(&a.current_embedding, &b.current_embedding);
                if distance >= threshold {
                    continue;
                }
                // a precedes b in id order, so a is the default destination.
                let (source, destination) = match (a.is_permanent, b.is_permanent) {
                    (true, false) => (b, a),
                    (false, true) => (a, b),
                    _ => (b, a),
                };
                candidates.push(MergeCandidate {
                    source_id: source.id.clone(),
                    destination_id: destination.id.clone(),
                    distance,
                });
            }
        }
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    /// Remove a speaker; permanent speakers survive when `keep_if_permanent`.
    pub fn remove_speaker(&self, id: &str, keep_if_permanent: bool) -> bool {
        let mut inner = self.write_lock();
        match inner.speakers.get(id) {
            Some(speaker) if keep_if_permanent && speaker.is_permanent => false,
            Some(_) => {
                inner.speakers.remove(id);
                true
            }
            None => false,
        }
    }

    /// Remove speakers not updated since `cutoff`.
    pub fn remove_inactive_since(&self, cutoff: DateTime<Utc>, keep_if_permanent: bool) -> usize {
        self.remove_where(|s| s.updated_at < cutoff, keep_if_permanent)
    }

    /// Remove speakers idle for at least `idle`.
    pub fn remove_inactive_for(&self, idle: Duration, keep_if_permanent: bool) -> usize {
        self.remove_inactive_since(Utc::now() - idle, keep_if_permanent)
    }

    /// Remove every speaker matching `predicate`, returning the count.
    pub fn remove_where<F>(&self, predicate: F, keep_if_permanent: bool) -> usize
    where
        F: Fn(&Speaker) -> bool,
    {
        let mut inner = self.write_lock();
        let before = inner.speakers.len();
        inner
            .speakers
            .retain(|_, s| (keep_if_permanent && s.is_permanent) || !predicate(s));
        let removed = before - inner.speakers.len();
        if removed > 0 {
            debug!("removed {} speakers", removed);
        }
        removed
    }

    pub fn rename_speaker(&self, id: &str, name: impl Into<String>) -> bool {
        let mut inner = self.write_lock();
        match inner.speakers.get_mut(id) {
            Some(speaker) => {
                speaker.name = name.into();
                speaker.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of one speaker.
    pub fn get_speaker(&self, id: &str) -> Option<Speaker> {
        self.read_lock().speakers.get(id).cloned()
    }

    /// Snapshot of all speakers, ordered by id.
    pub fn all_speakers(&self) -> Vec<Speaker> {
        let inner = self.read_lock();
        let mut speakers: Vec<Speaker> = inner.speakers.values().cloned().collect();
        speakers.sort_by(|a, b| id_order(&a.id, &b.id));
        speakers
    }

    pub fn speaker_count(&self) -> usize {
        self.read_lock().speakers.len()
    }

    /// Aggregate statistics over the current database.
    pub fn statistics(&self) -> TrackerStatistics {
        let inner = self.read_lock();
        let total = inner.speakers.len();
        TrackerStatistics {
            total_speakers: total,
            permanent_speakers: inner.speakers.values().filter(|s| s.is_permanent).count(),
            total_speech_s: inner
                .speakers
                .values()
                .map(|s| s.accumulated_duration_s)
                .sum(),
            average_updates: if total > 0 {
                inner.speakers.values().map(|s| s.update_count as f32).sum::<f32>()
                    / total as f32
            } else {
                0.0
            },
        }
    }

    /// Clear the database. When `keep_if_permanent`, permanent speakers
    /// survive and the id counter continues after the largest numeric id;
    /// otherwise the counter restarts at 1.
    pub fn reset(&self, keep_if_permanent: bool) {
        let mut inner = self.write_lock();
        if keep_if_permanent {
            inner.speakers.retain(|_, s| s.is_permanent);
            inner.next_id = inner
                .speakers
                .keys()
                .filter_map(|id| id.parse::<u64>().ok())
                .max()
                .map(|max| max + 1)
                .unwrap_or(1);
        } else {
            inner.speakers.clear();
            inner.next_id = 1;
        }
        info!(
            "speaker database reset ({} speakers kept, next id {})",
            inner.speakers.len(),
            inner.next_id
        );
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, DatabaseInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, DatabaseInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Validate and L2-normalize an incoming embedding.
fn normalize_embedding(embedding: &[f32]) -> Option<Vec<f32>> {
    if embedding.len() != EMBEDDING_DIM {
        return None;
    }
    let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
    if !norm_sq.is_finite() || norm_sq <= NORM_FLOOR_SQ {
        return None;
    }
    let norm = norm_sq.sqrt();
    Some(embedding.iter().map(|v| v / norm).collect())
}

fn renormalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine distance `1 - cos(a, b)`.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

fn closest_speaker(speakers: &HashMap<String, Speaker>, embedding: &[f32]) -> Option<(String, f32)> {
    speakers
        .values()
        .map(|s| (s.id.clone(), cosine_distance(embedding, &s.current_embedding)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

/// Normalized mean of a set of vectors; `None` when the set is empty.
fn mean_embedding<'a>(vectors: impl Iterator<Item = &'a Vec<f32>>) -> Option<Vec<f32>> {
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;
    for vector in vectors {
        match &mut sum {
            None => sum = Some(vector.clone()),
            Some(acc) => {
                for (a, &v) in acc.iter_mut().zip(vector) {
                    *a += v;
                }
            }
        }
        count += 1;
    }
    let mut mean = sum?;
    for v in &mut mean {
        *v /= count as f32;
    }
    renormalize(&mut mean);
    Some(mean)
}

/// Numeric-first id ordering ("2" before "10"), lexicographic fallback.
fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(index: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[index] = 1.0;
        v
    }

    #[test]
    fn test_enrollment_flow() {
        let tracker = StreamingSpeakerTracker::new();
        let e1 = unit(0);
        let e2 = unit(1);

        // First long snippet enrolls speaker "1".
        let speaker = tracker.assign_speaker(&e1, 3.0).unwrap();
        assert_eq!(speaker.id, "1");
        assert_eq!(speaker.update_count, 1);

        // The same voice again: same speaker, incremented counters.
        let speaker = tracker.assign_speaker(&e1, 3.0).unwrap();
        assert_eq!(speaker.id, "1");
        assert_eq!(speaker.update_count, 2);
        assert!((speaker.accumulated_duration_s - 6.0).abs() < 1e-6);

        // A new voice but too short to enroll.
        assert!(tracker.assign_speaker(&e2, 0.5).is_none());

        // Long enough: enrolls speaker "2".
        let speaker = tracker.assign_speaker(&e2, 3.0).unwrap();
        assert_eq!(speaker.id, "2");
        assert_eq!(tracker.speaker_count(), 2);
    }

    #[test]
    fn test_invalid_embeddings_rejected() {
        let tracker = StreamingSpeakerTracker::new();
        assert!(tracker.assign_speaker(&[1.0; 100], 3.0).is_none());
        assert!(tracker.assign_speaker(&vec![0.0f32; EMBEDDING_DIM], 3.0).is_none());
        let tiny = vec![0.0001f32; EMBEDDING_DIM];
        assert!(tracker.assign_speaker(&tiny, 3.0).is_none());
    }

    #[test]
    fn test_ema_update_requires_close_match_and_duration() {
        let tracker = StreamingSpeakerTracker::new();
        let e1 = unit(0);
        tracker.assign_speaker(&e1, 3.0).unwrap();

        // Short snippet: duration below the update floor, no raw appended.
        let speaker = tracker.assign_speaker(&e1, 1.5).unwrap();
        assert_eq!(speaker.raw_embeddings.len(), 1);
        assert_eq!(speaker.update_count, 2);

        // Long snippet: EMA applied, raw appended, embedding stays unit.
        let speaker = tracker.assign_speaker(&e1, 2.5).unwrap();
        assert_eq!(speaker.raw_embeddings.len(), 2);
        let norm: f32 = speaker
            .current_embedding
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_raw_history_is_bounded() {
        let config = TrackerConfig {
            raw_history_capacity: 3,
            ..Default::default()
        };
        let tracker = StreamingSpeakerTracker::with_config(config);
        let e1 = unit(0);
        for _ in 0..6 {
            tracker.assign_speaker(&e1, 3.0).unwrap();
        }
        let speaker = tracker.get_speaker("1").unwrap();
        assert_eq!(speaker.raw_embeddings.len(), 3);
        assert_eq!(speaker.update_count, 6);
    }

    #[test]
    fn test_find_speaker_is_read_only() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();

        let (found, distance) = tracker.find_speaker(&unit(0), None);
        assert_eq!(found.as_deref(), Some("1"));
        assert!(distance < 1e-6);

        let (found, distance) = tracker.find_speaker(&unit(1), None);
        assert!(found.is_none());
        assert!((distance - 1.0).abs() < 1e-6);
        assert_eq!(tracker.speaker_count(), 1);
    }

    #[test]
    fn test_find_matching_speakers_sorted() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(1), 3.0).unwrap();

        let mut probe = vec![0.0f32; EMBEDDING_DIM];
        probe[0] = 1.0;
        probe[1] = 0.4;
        let matches = tracker.find_matching_speakers(&probe, Some(2.0));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].0, "1");
        assert!(matches[0].1 < matches[1].1);
    }

    #[test]
    fn test_merge_sums_and_removes_source() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(1), 4.0).unwrap();

        let merged = tracker
            .merge_speakers("2", "1", Some("Alice".into()), false)
            .unwrap();
        assert_eq!(merged.id, "1");
        assert_eq!(merged.name, "Alice");
        assert!((merged.accumulated_duration_s - 7.0).abs() < 1e-6);
        assert_eq!(merged.raw_embeddings.len(), 2);
        assert_eq!(tracker.speaker_count(), 1);
        assert!(tracker.get_speaker("2").is_none());
    }

    #[test]
    fn test_merge_is_commutative_in_raw_embeddings() {
        let make = || {
            let tracker = StreamingSpeakerTracker::new();
            tracker.assign_speaker(&unit(0), 3.0).unwrap();
            tracker.assign_speaker(&unit(1), 3.0).unwrap();
            tracker
        };

        let forward = make();
        forward.merge_speakers("2", "1", None, false).unwrap();
        let a = forward.get_speaker("1").unwrap().current_embedding;

        let backward = make();
        backward.merge_speakers("1", "2", None, false).unwrap();
        let b = backward.get_speaker("2").unwrap().current_embedding;

        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_merge_guards() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(1), 3.0).unwrap();

        assert!(tracker.merge_speakers("1", "1", None, false).is_err());
        assert!(tracker.merge_speakers("9", "1", None, false).is_err());

        tracker.make_permanent("2");
        assert!(tracker.merge_speakers("2", "1", None, true).is_err());
        // Destination permanence is retained through a merge.
        tracker.make_permanent("1");
        let merged = tracker.merge_speakers("2", "1", None, false).unwrap();
        assert!(merged.is_permanent);
    }

    #[test]
    fn test_mergeable_pairs_direction() {
        let tracker = StreamingSpeakerTracker::new();
        let mut near = unit(0);
        near[1] = 0.05;
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        // Force the near-duplicate into its own entry via a tiny threshold.
        tracker.assign_speaker_with(&near, 3.0, 1.0, Some(1e-6)).unwrap();

        let pairs = tracker.find_mergeable_pairs(0.5, false);
        assert_eq!(pairs.len(), 1);
        // Both non-permanent: the smaller id is the destination.
        assert_eq!(pairs[0].destination_id, "1");
        assert_eq!(pairs[0].source_id, "2");

        // A permanent speaker becomes the destination.
        tracker.make_permanent("2");
        let pairs = tracker.find_mergeable_pairs(0.5, false);
        assert_eq!(pairs[0].destination_id, "2");
        assert_eq!(pairs[0].source_id, "1");

        tracker.make_permanent("1");
        assert!(tracker.find_mergeable_pairs(0.5, true).is_empty());
    }

    #[test]
    fn test_removal_honors_permanence() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(1), 3.0).unwrap();
        tracker.make_permanent("1");

        assert!(!tracker.remove_speaker("1", true));
        assert!(tracker.remove_speaker("2", true));

        let removed = tracker.remove_where(|_| true, true);
        assert_eq!(removed, 0);
        assert_eq!(tracker.speaker_count(), 1);

        let removed = tracker.remove_where(|_| true, false);
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_statistics_aggregate() {
        let tracker = StreamingSpeakerTracker::new();
        assert_eq!(tracker.statistics().total_speakers, 0);

        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(0), 2.0).unwrap();
        tracker.assign_speaker(&unit(1), 4.0).unwrap();
        tracker.make_permanent("2");

        let stats = tracker.statistics();
        assert_eq!(stats.total_speakers, 2);
        assert_eq!(stats.permanent_speakers, 1);
        assert!((stats.total_speech_s - 9.0).abs() < 1e-6);
        assert!((stats.average_updates - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_remove_inactive() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        let removed = tracker.remove_inactive_since(Utc::now() + Duration::seconds(5), false);
        assert_eq!(removed, 1);
        assert_eq!(tracker.speaker_count(), 0);
    }

    #[test]
    fn test_reset_id_counters() {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(1), 3.0).unwrap();
        tracker.assign_speaker(&unit(2), 3.0).unwrap();
        tracker.make_permanent("3");

        // Preserving permanents continues after the largest numeric id.
        tracker.reset(true);
        assert_eq!(tracker.speaker_count(), 1);
        let speaker = tracker.assign_speaker(&unit(4), 3.0).unwrap();
        assert_eq!(speaker.id, "4");

        // A full reset leaves an empty database and next id 1.
        tracker.reset(false);
        assert_eq!(tracker.speaker_count(), 0);
        let speaker = tracker.assign_speaker(&unit(5), 3.0).unwrap();
        assert_eq!(speaker.id, "1");
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        use std::sync::Arc;
        let tracker = Arc::new(StreamingSpeakerTracker::new());
        tracker.assign_speaker(&unit(0), 3.0).unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let t = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = t.find_speaker(&unit(i % 8), None);
                    let _ = t.all_speakers();
                }
            }));
        }
        let writer = {
            let t = Arc::clone(&tracker);
            std::thread::spawn(move || {
                for i in 0..50 {
                    t.assign_speaker(&unit(i % 8), 3.0);
                }
            })
        };
        for handle in handles {
            handle.join().unwrap();
        }
        writer.join().unwrap();
        assert!(tracker.speaker_count() >= 1);
    }
}
