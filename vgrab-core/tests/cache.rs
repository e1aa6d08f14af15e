use std::path::Path;
use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use vgrab_core::{CacheError, ContentCache, MediaKind, NewArtifact};

fn temp_cache(dir: &Path) -> ContentCache {
    let cache = ContentCache::builder()
        .path(dir.join("cache.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create cache");
    cache.initialize().expect("initialize cache");
    cache
}

fn sample_artifact(source_id: &str, format_id: &str, resolution: &str) -> NewArtifact {
    NewArtifact {
        source_id: source_id.into(),
        format_id: format_id.into(),
        resolution: resolution.into(),
        file_ref: Some(format!("ref-{source_id}-{format_id}")),
        archive_message_id: 4242,
        title: Some("Sample Clip".into()),
        uploader: Some("uploader".into()),
        duration_s: Some(214),
        file_size: Some(48_000_000),
        media_kind: MediaKind::Video,
    }
}

#[test]
fn lookup_miss_creates_nothing() {
    let dir = TempDir::new().unwrap();
    let cache = temp_cache(dir.path());

    assert!(cache.lookup("abc", "137", "1080p").unwrap().is_none());
    assert_eq!(cache.counters().misses.load(Ordering::Relaxed), 1);
    let stats = cache.stats().unwrap();
    assert_eq!(stats.artifacts, 0);
    assert_eq!(stats.memory_entries, 0);
}

#[test]
fn store_then_lookup_served_from_memory_without_touching_persistence() {
    let dir = TempDir::new().unwrap();
    let cache = temp_cache(dir.path());
    let stored = cache.store(sample_artifact("abc", "137", "1080p")).unwrap();

    let first = cache
        .lookup("abc", "137", "1080p")
        .unwrap()
        .expect("cached artifact");
    assert_eq!(first.id, stored.id);
    assert_eq!(first.file_ref.as_deref(), Some("ref-abc-137"));
    assert_eq!(cache.counters().memory_hits.load(Ordering::Relaxed), 1);
    assert_eq!(cache.counters().persistent_hits.load(Ordering::Relaxed), 0);

    // Memory hits must not bump the durable access counter.
    let second = cache
        .lookup("abc", "137", "1080p")
        .unwrap()
        .expect("cached artifact");
    assert_eq!(second.access_count, first.access_count);
    assert_eq!(cache.counters().memory_hits.load(Ordering::Relaxed), 2);
}

#[test]
fn persistent_tier_bumps_access_and_warms_memory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.sqlite");
    let writer = ContentCache::builder()
        .path(&path)
        .create_if_missing(true)
        .build()
        .unwrap();
    writer.initialize().unwrap();
    writer.store(sample_artifact("abc", "137", "1080p")).unwrap();

    // Fresh handle: empty memory tier, so the first lookup goes durable.
    let reader = ContentCache::builder().path(&path).build().unwrap();
    let hit = reader
        .lookup("abc", "137", "1080p")
        .unwrap()
        .expect("cached artifact");
    assert_eq!(hit.access_count, 1);
    assert_eq!(reader.counters().persistent_hits.load(Ordering::Relaxed), 1);

    // Second lookup lands in the warmed memory tier.
    reader.lookup("abc", "137", "1080p").unwrap();
    assert_eq!(reader.counters().memory_hits.load(Ordering::Relaxed), 1);
    assert_eq!(reader.stats().unwrap().memory_entries, 1);
}

#[test]
fn duplicate_store_reports_the_colliding_key() {
    let dir = TempDir::new().unwrap();
    let cache = temp_cache(dir.path());
    cache.store(sample_artifact("abc", "137", "1080p")).unwrap();

    let err = cache
        .store(sample_artifact("abc", "137", "1080p"))
        .unwrap_err();
    match err {
        CacheError::Duplicate { cache_key } => {
            assert_eq!(cache_key, vgrab_core::cache_key("abc", "137", "1080p"));
        }
        other => panic!("expected duplicate error, got {other}"),
    }
}

#[test]
fn only_unique_violations_read_as_duplicates() {
    let unique = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
        Some("UNIQUE constraint failed: cached_artifacts.cache_key".into()),
    );
    assert!(matches!(
        CacheError::from(unique),
        CacheError::Duplicate { .. }
    ));

    // A NOT NULL failure is corruption, not a benign race.
    let not_null = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL),
        Some("NOT NULL constraint failed: cached_artifacts.source_id".into()),
    );
    assert!(matches!(
        CacheError::from(not_null),
        CacheError::Database(_)
    ));
}

#[test]
fn distinct_resolutions_of_one_source_are_distinct_entries() {
    let dir = TempDir::new().unwrap();
    let cache = temp_cache(dir.path());
    cache.store(sample_artifact("abc", "137", "1080p")).unwrap();
    cache.store(sample_artifact("abc", "22", "720p")).unwrap();
    cache
        .store(sample_artifact("abc", "140", "audio"))
        .unwrap();

    assert_eq!(cache.stats().unwrap().artifacts, 3);
    assert!(cache.lookup("abc", "22", "720p").unwrap().is_some());
}

#[test]
fn sweep_stale_removes_only_untouched_entries() {
    let dir = TempDir::new().unwrap();
    let cache = temp_cache(dir.path());
    let old = cache.store(sample_artifact("old", "137", "1080p")).unwrap();
    cache.store(sample_artifact("new", "137", "1080p")).unwrap();
    cache
        .force_last_access(old.id, Utc::now() - Duration::days(45))
        .unwrap();

    assert_eq!(cache.sweep_stale(30).unwrap(), 1);
    assert_eq!(cache.sweep_stale(30).unwrap(), 0);
    assert!(cache.lookup("new", "137", "1080p").unwrap().is_some());
}

#[test]
fn record_hit_accumulates_per_artifact() {
    let dir = TempDir::new().unwrap();
    let cache = temp_cache(dir.path());
    let artifact = cache.store(sample_artifact("abc", "137", "1080p")).unwrap();

    cache.record_hit(artifact.id, Some(777)).unwrap();
    cache.record_hit(artifact.id, None).unwrap();
}
