use std::path::Path;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use vgrab_core::{FormatCandidate, MediaMetadata, SessionStore, AUDIO_RESOLUTION};

fn temp_store(dir: &Path) -> SessionStore {
    let store = SessionStore::builder()
        .path(dir.join("sessions.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

fn sample_metadata() -> MediaMetadata {
    MediaMetadata {
        source_id: "abc123".into(),
        source_url: "https://media.example/watch?v=abc123".into(),
        title: "Sample Clip".into(),
        uploader: Some("uploader".into()),
        duration_s: Some(214),
        view_count: Some(10_450),
        like_count: Some(321),
        upload_date: Some("20240115".into()),
        thumbnail: Some("https://media.example/thumb/abc123.jpg".into()),
        formats: vec![
            FormatCandidate {
                format_id: "137".into(),
                ext: "mp4".into(),
                resolution: "1080p".into(),
                filesize: Some(200_000_000),
                quality: 1080,
                has_audio: false,
            },
            FormatCandidate {
                format_id: "140".into(),
                ext: "m4a".into(),
                resolution: AUDIO_RESOLUTION.into(),
                filesize: Some(3_400_000),
                quality: 0,
                has_audio: true,
            },
        ],
    }
}

#[test]
fn save_and_get_round_trips_the_full_catalog() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let metadata = sample_metadata();

    store.save("sess-1", &metadata).unwrap();
    let loaded = store.get("sess-1").unwrap().expect("session present");

    assert_eq!(loaded, metadata);
}

#[test]
fn get_unknown_key_is_none() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    assert!(store.get("missing").unwrap().is_none());
}

#[test]
fn expired_session_is_dropped_on_read() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    store.save("sess-old", &sample_metadata()).unwrap();
    store
        .force_expiry("sess-old", Utc::now() - Duration::hours(1))
        .unwrap();

    assert!(store.get("sess-old").unwrap().is_none());
    // The lazy expiry deleted the row, not just hid it.
    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn sweep_removes_only_expired_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    store.save("sess-live", &sample_metadata()).unwrap();
    store.save("sess-dead", &sample_metadata()).unwrap();
    store
        .force_expiry("sess-dead", Utc::now() - Duration::days(1))
        .unwrap();

    assert_eq!(store.sweep_expired().unwrap(), 1);
    assert_eq!(store.sweep_expired().unwrap(), 0);
    assert!(store.get("sess-live").unwrap().is_some());
}

#[test]
fn save_overwrites_an_existing_key() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let mut metadata = sample_metadata();
    store.save("sess-1", &metadata).unwrap();

    metadata.title = "Updated Title".into();
    store.save("sess-1", &metadata).unwrap();

    let loaded = store.get("sess-1").unwrap().expect("session present");
    assert_eq!(loaded.title, "Updated Title");
    assert_eq!(store.count().unwrap(), 1);
}
