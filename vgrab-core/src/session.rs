use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::media::{FormatCandidate, MediaMetadata};
use crate::sqlite::configure_connection;

const SESSION_SCHEMA: &str = include_str!("../../sql/sessions.sql");

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("session storage unavailable: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt session record {session_key}: {source}")]
    Corrupt {
        session_key: String,
        source: serde_json::Error,
    },
    #[error("session store path not configured")]
    MissingStore,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A stored session together with the expiry it was written with.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub metadata: MediaMetadata,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStoreBuilder {
    path: Option<PathBuf>,
    ttl: Duration,
    create_if_missing: bool,
}

impl Default for SessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            ttl: Duration::days(7),
            create_if_missing: true,
        }
    }
}

impl SessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn ttl_days(mut self, days: i64) -> Self {
        self.ttl = Duration::days(days);
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SessionResult<SessionStore> {
        let path = self.path.ok_or(SessionError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SessionStore {
            path,
            flags,
            ttl: self.ttl,
        })
    }
}

/// Durable, TTL-bounded mapping from a session key to resolved metadata, so
/// a quality choice made minutes (or a restart) later can still be honored.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    flags: OpenFlags,
    ttl: Duration,
}

impl SessionStore {
    pub fn builder() -> SessionStoreBuilder {
        SessionStoreBuilder::new()
    }

    fn open(&self) -> SessionResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SessionError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| SessionError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    /// Writes the session and returns the expiry it was stamped with.
    pub fn save(
        &self,
        session_key: &str,
        metadata: &MediaMetadata,
    ) -> SessionResult<DateTime<Utc>> {
        let formats = serde_json::to_string(&metadata.formats).map_err(|source| {
            SessionError::Corrupt {
                session_key: session_key.to_string(),
                source,
            }
        })?;
        let expires_at = Utc::now() + self.ttl;
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO video_sessions (
                session_key, source_id, source_url, title, uploader, duration_s,
                view_count, like_count, upload_date, thumbnail, formats, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session_key,
                &metadata.source_id,
                &metadata.source_url,
                &metadata.title,
                &metadata.uploader,
                &metadata.duration_s,
                &metadata.view_count,
                &metadata.like_count,
                &metadata.upload_date,
                &metadata.thumbnail,
                formats,
                expires_at.naive_utc(),
            ],
        )?;
        debug!(%session_key, source = %metadata.source_id, "session saved");
        Ok(expires_at)
    }

    pub fn get(&self, session_key: &str) -> SessionResult<Option<MediaMetadata>> {
        Ok(self.get_record(session_key)?.map(|record| record.metadata))
    }

    /// Returns the stored record, or `None` when absent or past its
    /// expiry. An expired record is deleted as a side effect; the periodic
    /// sweep covers records never looked up again.
    pub fn get_record(&self, session_key: &str) -> SessionResult<Option<SessionRecord>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT source_id, source_url, title, uploader, duration_s, view_count,
                        like_count, upload_date, thumbnail, formats, expires_at
                 FROM video_sessions WHERE session_key = ?1",
                [session_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, NaiveDateTime>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            source_id,
            source_url,
            title,
            uploader,
            duration_s,
            view_count,
            like_count,
            upload_date,
            thumbnail,
            formats_raw,
            expires_at,
        )) = row
        else {
            return Ok(None);
        };

        let expires_at = Utc.from_utc_datetime(&expires_at);
        if expires_at < Utc::now() {
            debug!(%session_key, "session expired, deleting lazily");
            self.delete(session_key)?;
            return Ok(None);
        }

        let formats: Vec<FormatCandidate> =
            serde_json::from_str(&formats_raw).map_err(|source| SessionError::Corrupt {
                session_key: session_key.to_string(),
                source,
            })?;
        Ok(Some(SessionRecord {
            metadata: MediaMetadata {
                source_id,
                source_url,
                title,
                uploader,
                duration_s,
                view_count,
                like_count,
                upload_date,
                thumbnail,
                formats,
            },
            expires_at,
        }))
    }

    pub fn delete(&self, session_key: &str) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM video_sessions WHERE session_key = ?1",
            [session_key],
        )?;
        Ok(())
    }

    /// Bulk-delete every record past its expiry; returns the count removed.
    pub fn sweep_expired(&self) -> SessionResult<usize> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        let removed = conn.execute("DELETE FROM video_sessions WHERE expires_at < ?1", [now])?;
        if removed > 0 {
            info!(removed, "swept expired sessions");
        }
        Ok(removed)
    }

    pub fn count(&self) -> SessionResult<usize> {
        let conn = self.open()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM video_sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    #[doc(hidden)]
    pub fn force_expiry(&self, session_key: &str, expires_at: DateTime<Utc>) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE video_sessions SET expires_at = ?2 WHERE session_key = ?1",
            params![session_key, expires_at.naive_utc()],
        )?;
        Ok(())
    }
}
