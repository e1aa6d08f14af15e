use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use hex::encode as hex_encode;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::media::MediaKind;
use crate::sqlite::configure_connection;

const CACHE_SCHEMA: &str = include_str!("../../sql/cache.sql");

/// Deterministic fingerprint of (source, format, resolution). Pure and
/// unsalted so the persistent tier stays valid across restarts; the fields
/// are newline-delimited to keep distinct triples distinct.
pub fn cache_key(source_id: &str, format_id: &str, resolution: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(format_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(resolution.as_bytes());
    hex_encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open cache database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("cache storage unavailable: {0}")]
    Database(rusqlite::Error),
    #[error("artifact already cached under key {cache_key}")]
    Duplicate { cache_key: String },
    #[error("cache store path not configured")]
    MissingStore,
}

// Only a UNIQUE violation means the artifact raced us into the cache;
// any other constraint failure is a real storage error.
impl From<rusqlite::Error> for CacheError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &error {
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                return CacheError::Duplicate {
                    cache_key: String::new(),
                };
            }
        }
        CacheError::Database(error)
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A previously delivered artifact, addressable on the direct transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub id: i64,
    pub cache_key: String,
    pub source_id: String,
    pub format_id: String,
    pub resolution: String,
    pub file_ref: Option<String>,
    pub archive_message_id: i64,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
    pub file_size: Option<i64>,
    pub media_kind: MediaKind,
    pub created_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
}

impl CachedArtifact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let last_accessed_at: Option<NaiveDateTime> = row.get("last_accessed_at")?;
        Ok(Self {
            id: row.get("id")?,
            cache_key: row.get("cache_key")?,
            source_id: row.get("source_id")?,
            format_id: row.get("format_id")?,
            resolution: row.get("resolution")?,
            file_ref: row.get("file_ref")?,
            archive_message_id: row.get("archive_message_id")?,
            title: row.get("title")?,
            uploader: row.get("uploader")?,
            duration_s: row.get("duration_s")?,
            file_size: row.get("file_size")?,
            media_kind: row
                .get::<_, String>("media_kind")?
                .parse()
                .unwrap_or(MediaKind::Video),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            last_accessed_at: last_accessed_at.map(|dt| Utc.from_utc_datetime(&dt)),
            access_count: row.get("access_count")?,
        })
    }
}

/// Payload for a first-time cache population.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub source_id: String,
    pub format_id: String,
    pub resolution: String,
    pub file_ref: Option<String>,
    pub archive_message_id: i64,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
    pub file_size: Option<i64>,
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub artifacts: usize,
    pub total_bytes: i64,
    pub memory_entries: usize,
}

/// Tier hit/miss accounting, kept since process start.
#[derive(Debug, Default)]
pub struct TierCounters {
    pub memory_hits: AtomicU64,
    pub persistent_hits: AtomicU64,
    pub misses: AtomicU64,
}

struct MemoryEntry {
    artifact: CachedArtifact,
    touched: u64,
}

struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    clock: u64,
    capacity: usize,
}

impl MemoryTier {
    fn get(&mut self, key: &str) -> Option<CachedArtifact> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|entry| {
            entry.touched = clock;
            entry.artifact.clone()
        })
    }

    fn insert(&mut self, artifact: CachedArtifact) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&artifact.cache_key) {
            // Evict the least recently touched entry; the persistent tier
            // stays authoritative, so this only costs one DB read later.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            artifact.cache_key.clone(),
            MemoryEntry {
                artifact,
                touched: self.clock,
            },
        );
    }
}

#[derive(Debug, Clone)]
pub struct ContentCacheBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
    memory_capacity: usize,
}

impl Default for ContentCacheBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            memory_capacity: 1024,
        }
    }
}

impl ContentCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> CacheResult<ContentCache> {
        let path = self.path.ok_or(CacheError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(ContentCache {
            path,
            flags,
            memory: Arc::new(Mutex::new(MemoryTier {
                entries: HashMap::new(),
                clock: 0,
                capacity: self.memory_capacity,
            })),
            counters: Arc::new(TierCounters::default()),
        })
    }
}

/// Two-tier artifact cache: process-local map in front of SQLite.
#[derive(Clone)]
pub struct ContentCache {
    path: PathBuf,
    flags: OpenFlags,
    memory: Arc<Mutex<MemoryTier>>,
    counters: Arc<TierCounters>,
}

impl ContentCache {
    pub fn builder() -> ContentCacheBuilder {
        ContentCacheBuilder::new()
    }

    fn open(&self) -> CacheResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CacheError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| CacheError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(())
    }

    pub fn counters(&self) -> &TierCounters {
        &self.counters
    }

    /// Memory tier first (zero persistence I/O on hit), then the durable
    /// tier, which bumps last-access bookkeeping and warms the memory tier.
    /// A miss never creates anything.
    pub fn lookup(
        &self,
        source_id: &str,
        format_id: &str,
        resolution: &str,
    ) -> CacheResult<Option<CachedArtifact>> {
        let key = cache_key(source_id, format_id, resolution);

        if let Ok(mut memory) = self.memory.lock() {
            if let Some(artifact) = memory.get(&key) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                debug!(%resolution, "memory cache hit");
                return Ok(Some(artifact));
            }
        }

        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT * FROM cached_artifacts WHERE cache_key = ?1",
                [&key],
                CachedArtifact::from_row,
            )
            .optional()
            .map_err(CacheError::Database)?;

        let Some(mut artifact) = found else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(%resolution, "cache miss");
            return Ok(None);
        };

        conn.execute(
            "UPDATE cached_artifacts
             SET last_accessed_at = CURRENT_TIMESTAMP, access_count = access_count + 1
             WHERE id = ?1",
            [artifact.id],
        )
        .map_err(CacheError::Database)?;
        artifact.access_count += 1;
        artifact.last_accessed_at = Some(Utc::now());

        self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
        debug!(%resolution, "persistent cache hit");
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(artifact.clone());
        }
        Ok(Some(artifact))
    }

    /// Persists a first delivery. `Duplicate` means a concurrent requester
    /// already populated the key; callers treat that as benign.
    pub fn store(&self, artifact: NewArtifact) -> CacheResult<CachedArtifact> {
        let key = cache_key(&artifact.source_id, &artifact.format_id, &artifact.resolution);
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT INTO cached_artifacts (
                cache_key, source_id, format_id, resolution, file_ref,
                archive_message_id, title, uploader, duration_s, file_size, media_kind
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &key,
                &artifact.source_id,
                &artifact.format_id,
                &artifact.resolution,
                &artifact.file_ref,
                artifact.archive_message_id,
                &artifact.title,
                &artifact.uploader,
                &artifact.duration_s,
                &artifact.file_size,
                artifact.media_kind.as_str(),
            ],
        );
        if let Err(error) = inserted {
            return Err(match CacheError::from(error) {
                CacheError::Duplicate { .. } => CacheError::Duplicate { cache_key: key },
                other => other,
            });
        }

        let stored = conn
            .query_row(
                "SELECT * FROM cached_artifacts WHERE cache_key = ?1",
                [&key],
                CachedArtifact::from_row,
            )
            .map_err(CacheError::Database)?;
        info!(resolution = %stored.resolution, key = %stored.cache_key, "artifact cached");
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(stored.clone());
        }
        Ok(stored)
    }

    /// Records an actual delivery to a requester, as opposed to the
    /// bookkeeping `lookup` does when it merely finds the artifact.
    pub fn record_hit(&self, artifact_id: i64, requester_id: Option<i64>) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO cache_hits (artifact_id, requester_id, from_cache) VALUES (?1, ?2, 1)",
            params![artifact_id, requester_id],
        )
        .map_err(CacheError::Database)?;
        Ok(())
    }

    /// Deletes artifacts idle past the cutoff, measured from last access.
    /// The memory tier is left alone; stale entries there still serve
    /// correctly until restart.
    pub fn sweep_stale(&self, max_age_days: i64) -> CacheResult<usize> {
        let conn = self.open()?;
        let cutoff = (Utc::now() - Duration::days(max_age_days)).naive_utc();
        let removed = conn
            .execute(
                "DELETE FROM cached_artifacts WHERE last_accessed_at < ?1",
                [cutoff],
            )
            .map_err(CacheError::Database)?;
        if removed > 0 {
            info!(removed, max_age_days, "swept stale cache artifacts");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.open()?;
        let artifacts: i64 = conn
            .query_row("SELECT COUNT(*) FROM cached_artifacts", [], |row| {
                row.get(0)
            })
            .map_err(CacheError::Database)?;
        let total_bytes: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(file_size), 0) FROM cached_artifacts",
                [],
                |row| row.get(0),
            )
            .map_err(CacheError::Database)?;
        let memory_entries = self
            .memory
            .lock()
            .map(|memory| memory.entries.len())
            .unwrap_or(0);
        Ok(CacheStats {
            artifacts: artifacts as usize,
            total_bytes,
            memory_entries,
        })
    }

    #[doc(hidden)]
    pub fn force_last_access(
        &self,
        artifact_id: i64,
        last_accessed_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE cached_artifacts SET last_accessed_at = ?2 WHERE id = ?1",
            params![artifact_id, last_accessed_at.naive_utc()],
        )
        .map_err(CacheError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_and_collision_free_for_distinct_triples() {
        let a = cache_key("dQw4w9WgXcQ", "137", "1080p");
        let b = cache_key("dQw4w9WgXcQ", "137", "1080p");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let triples = [
            ("dQw4w9WgXcQ", "137", "1080p"),
            ("dQw4w9WgXcQ", "137", "720p"),
            ("dQw4w9WgXcQ", "136", "1080p"),
            ("aaaaaaaaaaa", "137", "1080p"),
            // Delimiter matters: shuffled boundaries must not collide.
            ("dQw4w9WgXcQ\n137", "", "1080p"),
        ];
        let keys: Vec<String> = triples
            .iter()
            .map(|(s, f, r)| cache_key(s, f, r))
            .collect();
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "triples {i} and {j} collided");
            }
        }
    }
}
