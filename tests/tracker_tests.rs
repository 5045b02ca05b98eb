//! Streaming speaker tracker behavioral tests

use diarium::diarization::{StreamingSpeakerTracker, TrackerConfig};
use diarium::inference::EMBEDDING_DIM;

fn unit(index: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[index] = 1.0;
    v
}

/// The enrollment scenario: long snippets enroll, repeats update, short
/// unknown snippets are deferred until enough speech arrives.
#[test]
fn enrollment_scenario() {
    let tracker = StreamingSpeakerTracker::new();
    let e1 = unit(0);
    let e2 = unit(1);

    let first = tracker.assign_speaker(&e1, 3.0).expect("enrolls");
    assert_eq!(first.id, "1");

    let again = tracker.assign_speaker(&e1, 3.0).expect("matches");
    assert_eq!(again.id, "1");
    assert_eq!(again.update_count, 2);

    assert!(tracker.assign_speaker(&e2, 0.5).is_none(), "too short");

    let second = tracker.assign_speaker(&e2, 3.0).expect("enrolls");
    assert_eq!(second.id, "2");
}

#[test]
fn reset_round_trip_law() {
    let tracker = StreamingSpeakerTracker::new();
    tracker.assign_speaker(&unit(0), 3.0).unwrap();
    tracker.assign_speaker(&unit(1), 3.0).unwrap();
    tracker.make_permanent("2");

    tracker.reset(true);
    assert_eq!(tracker.speaker_count(), 1);

    tracker.reset(false);
    assert_eq!(tracker.speaker_count(), 0);
    // The id counter is back at 1.
    let speaker = tracker.assign_speaker(&unit(3), 3.0).unwrap();
    assert_eq!(speaker.id, "1");
}

#[test]
fn merge_removes_exactly_one_entry() {
    let tracker = StreamingSpeakerTracker::new();
    tracker.assign_speaker(&unit(0), 3.0).unwrap();
    tracker.assign_speaker(&unit(1), 3.0).unwrap();
    tracker.assign_speaker(&unit(2), 3.0).unwrap();

    let before = tracker.speaker_count();
    tracker.merge_speakers("3", "1", None, false).unwrap();
    assert_eq!(tracker.speaker_count(), before - 1);
    assert!(tracker.get_speaker("3").is_none());
    assert!(tracker.get_speaker("2").is_some());
}

#[test]
fn merged_embedding_is_order_independent() {
    let build = || {
        let tracker = StreamingSpeakerTracker::new();
        tracker.assign_speaker(&unit(0), 3.0).unwrap();
        tracker.assign_speaker(&unit(1), 3.0).unwrap();
        tracker
    };

    let ab = build();
    ab.merge_speakers("2", "1", None, false).unwrap();
    let forward = ab.get_speaker("1").unwrap();

    let ba = build();
    ba.merge_speakers("1", "2", None, false).unwrap();
    let backward = ba.get_speaker("2").unwrap();

    for (x, y) in forward
        .current_embedding
        .iter()
        .zip(&backward.current_embedding)
    {
        assert!((x - y).abs() < 1e-6);
    }
    assert_eq!(
        forward.raw_embeddings.len(),
        backward.raw_embeddings.len()
    );
}

#[test]
fn queries_return_snapshots() {
    let tracker = StreamingSpeakerTracker::new();
    tracker.assign_speaker(&unit(0), 3.0).unwrap();

    let mut snapshot = tracker.get_speaker("1").unwrap();
    snapshot.name = "mutated".to_string();
    snapshot.accumulated_duration_s = 1e9;

    let fresh = tracker.get_speaker("1").unwrap();
    assert_eq!(fresh.name, "Speaker 1");
    assert!((fresh.accumulated_duration_s - 3.0).abs() < 1e-6);
}

#[test]
fn custom_thresholds_change_assignment() {
    let config = TrackerConfig {
        speaker_threshold: 0.05,
        ..Default::default()
    };
    let tracker = StreamingSpeakerTracker::with_config(config);
    tracker.assign_speaker(&unit(0), 3.0).unwrap();

    // A vector 45 degrees away misses the strict threshold and enrolls.
    let mut between = vec![0.0f32; EMBEDDING_DIM];
    between[0] = 1.0;
    between[1] = 1.0;
    let speaker = tracker.assign_speaker(&between, 3.0).unwrap();
    assert_eq!(speaker.id, "2");

    // The default threshold would have matched speaker 1 instead.
    let (found, distance) = tracker.find_speaker(&between, Some(0.65));
    assert!(distance < 0.65);
    assert!(found.is_some());
}

#[test]
fn permanence_shields_cleanup() {
    let tracker = StreamingSpeakerTracker::new();
    tracker.assign_speaker(&unit(0), 3.0).unwrap();
    tracker.assign_speaker(&unit(1), 3.0).unwrap();
    tracker.make_permanent("1");

    let removed = tracker.remove_where(|_| true, true);
    assert_eq!(removed, 1);
    assert!(tracker.get_speaker("1").is_some());

    tracker.revoke_permanence("1");
    let removed = tracker.remove_where(|_| true, true);
    assert_eq!(removed, 1);
    assert_eq!(tracker.speaker_count(), 0);
}
