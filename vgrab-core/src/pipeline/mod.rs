//! Orchestrator tying the extractor, stores, queue, and transports into
//! the resolve-then-select flow.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::{CacheError, CacheStats, CachedArtifact, ContentCache, NewArtifact};
use crate::extractor::MediaExtractor;
use crate::media::{MediaKind, MediaMetadata, AUDIO_RESOLUTION};
use crate::progress::{ProgressSink, ProgressStage, ProgressThrottle};
use crate::queue::{JobHandle, JobQueue, QueueStatus};
use crate::session::SessionStore;
use crate::transport::{DeliveredArtifact, DeliveryMetadata, TransportDispatcher};

mod error;

pub use error::{PipelineError, PipelineResult};

/// Where the finished artifact should go, and on whose behalf.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub destination: String,
    pub requester_id: Option<i64>,
}

/// Result of resolving a URL: a short-lived selection session plus the
/// metadata to present.
#[derive(Debug, Clone)]
pub struct Presentation {
    pub session_key: String,
    pub metadata: MediaMetadata,
}

/// What a finished acquisition job produced.
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub archive_message_id: i64,
    pub file_ref: Option<String>,
    pub file_size: u64,
    pub resolution: String,
}

/// Outcome of a format selection.
#[derive(Debug)]
pub enum SelectionOutcome {
    /// Served from the cache without any acquisition work.
    FromCache(CachedArtifact),
    /// A new acquisition job was enqueued. `position` counts the jobs
    /// ahead of it (active plus queued) at submission time.
    Enqueued {
        position: usize,
        handle: JobHandle<PipelineResult<CompletedDownload>>,
    },
    /// The same source/format/resolution is already being acquired.
    AlreadyInProgress,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStatus {
    pub queue: QueueStatus,
    pub cache: CacheStats,
}

struct ShadowEntry {
    metadata: MediaMetadata,
    expires_at: DateTime<Utc>,
}

/// Clears the in-flight marker on every exit path, panics included.
struct InFlightGuard {
    markers: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut markers) = self.markers.lock() {
            markers.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    extractor: Arc<dyn MediaExtractor>,
    sessions: SessionStore,
    cache: ContentCache,
    queue: JobQueue,
    dispatcher: Arc<TransportDispatcher>,
    downloads_dir: PathBuf,
    // Hot copy of recent sessions so a selection right after a resolve
    // skips the store. Entries carry the expiry stamped on the durable
    // record, so a shadow hit expires at the same instant.
    session_shadow: Arc<Mutex<HashMap<String, ShadowEntry>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Pipeline {
    pub fn new(
        extractor: Arc<dyn MediaExtractor>,
        sessions: SessionStore,
        cache: ContentCache,
        queue: JobQueue,
        dispatcher: Arc<TransportDispatcher>,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            extractor,
            sessions,
            cache,
            queue,
            dispatcher,
            downloads_dir: downloads_dir.into(),
            session_shadow: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Probe a URL, persist a selection session, and return the catalog
    /// to present. A source with no acceptable formats is unavailable.
    pub async fn resolve(&self, url: &str) -> PipelineResult<Presentation> {
        let parsed = Url::parse(url).map_err(|_| PipelineError::SourceUnavailable {
            reason: "not a valid URL".to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(PipelineError::SourceUnavailable {
                reason: format!("unsupported scheme: {}", parsed.scheme()),
            });
        }

        let metadata = self.extractor.probe(url).await.map_err(|source| {
            error!(url, %source, "probe failed");
            PipelineError::SourceUnavailable {
                reason: source.to_string(),
            }
        })?;
        if metadata.formats.is_empty() {
            return Err(PipelineError::SourceUnavailable {
                reason: "no acceptable formats".to_string(),
            });
        }

        let session_key = Uuid::new_v4().simple().to_string();
        let expires_at = self.sessions.save(&session_key, &metadata)?;
        self.shadow_insert(&session_key, &metadata, expires_at);
        info!(
            %session_key,
            source_id = %metadata.source_id,
            formats = metadata.formats.len(),
            "resolved source"
        );
        Ok(Presentation {
            session_key,
            metadata,
        })
    }

    /// Act on a format selection: serve from cache when possible, refuse
    /// duplicates of an acquisition already underway, otherwise enqueue a
    /// new job and return its handle.
    pub async fn select(
        &self,
        session_key: &str,
        format_id: &str,
        resolution: &str,
        request: RequestContext,
        sink: Arc<dyn ProgressSink>,
    ) -> PipelineResult<SelectionOutcome> {
        let metadata = self.session_metadata(session_key)?;

        if let Some(artifact) = self
            .cache
            .lookup(&metadata.source_id, format_id, resolution)?
        {
            match self.deliver_cached(&artifact, &request).await {
                Ok(()) => {
                    if let Err(source) = self.cache.record_hit(artifact.id, request.requester_id) {
                        warn!(%source, artifact_id = artifact.id, "failed to record cache hit");
                    }
                    info!(
                        source_id = %metadata.source_id,
                        format_id,
                        resolution,
                        "served from cache"
                    );
                    return Ok(SelectionOutcome::FromCache(artifact));
                }
                Err(source) => {
                    // Stored references can go stale; re-acquire instead.
                    warn!(%source, artifact_id = artifact.id, "cached delivery failed, re-acquiring");
                }
            }
        }

        let marker = format!("{}|{}|{}", metadata.source_id, format_id, resolution);
        {
            let Ok(mut in_flight) = self.in_flight.lock() else {
                return Err(PipelineError::StorageFailure(
                    "in-flight registry poisoned".to_string(),
                ));
            };
            if !in_flight.insert(marker.clone()) {
                debug!(%marker, "acquisition already in progress");
                return Ok(SelectionOutcome::AlreadyInProgress);
            }
        }
        let guard = InFlightGuard {
            markers: Arc::clone(&self.in_flight),
            key: marker,
        };

        let status = self.queue.status();
        let position = status.active + status.queued;

        let pipeline = self.clone();
        let format_id = format_id.to_string();
        let resolution = resolution.to_string();
        let handle = self.queue.submit(async move {
            let _guard = guard;
            pipeline
                .execute(metadata, format_id, resolution, request, sink)
                .await
        });

        Ok(SelectionOutcome::Enqueued { position, handle })
    }

    pub fn status(&self) -> PipelineResult<PipelineStatus> {
        Ok(PipelineStatus {
            queue: self.queue.status(),
            cache: self.cache.stats()?,
        })
    }

    fn shadow_insert(&self, session_key: &str, metadata: &MediaMetadata, expires_at: DateTime<Utc>) {
        if let Ok(mut shadow) = self.session_shadow.lock() {
            shadow.insert(
                session_key.to_string(),
                ShadowEntry {
                    metadata: metadata.clone(),
                    expires_at,
                },
            );
        }
    }

    fn session_metadata(&self, session_key: &str) -> PipelineResult<MediaMetadata> {
        if let Ok(mut shadow) = self.session_shadow.lock() {
            match shadow.get(session_key) {
                Some(entry) if entry.expires_at > Utc::now() => {
                    return Ok(entry.metadata.clone());
                }
                Some(_) => {
                    shadow.remove(session_key);
                }
                None => {}
            }
        }
        match self.sessions.get_record(session_key)? {
            Some(record) => {
                self.shadow_insert(session_key, &record.metadata, record.expires_at);
                Ok(record.metadata)
            }
            None => Err(PipelineError::SessionExpired),
        }
    }

    async fn deliver_cached(
        &self,
        artifact: &CachedArtifact,
        request: &RequestContext,
    ) -> PipelineResult<()> {
        let caption = cached_caption(artifact);
        match artifact.file_ref.as_deref() {
            Some(file_ref) => {
                self.dispatcher
                    .direct()
                    .send_by_ref(&request.destination, file_ref, artifact.media_kind, &caption)
                    .await?;
            }
            None => {
                self.dispatcher
                    .direct()
                    .forward(
                        &request.destination,
                        self.dispatcher.archive_destination(),
                        artifact.archive_message_id,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// The acquisition job: download, upload to the archive, cache, then
    /// deliver to the requester and discard the temp file.
    async fn execute(
        &self,
        metadata: MediaMetadata,
        format_id: String,
        resolution: String,
        request: RequestContext,
        sink: Arc<dyn ProgressSink>,
    ) -> PipelineResult<CompletedDownload> {
        let audio_only = resolution == AUDIO_RESOLUTION;
        let kind = MediaKind::for_resolution(&resolution);

        tokio::fs::create_dir_all(&self.downloads_dir)
            .await
            .map_err(|source| {
                PipelineError::StorageFailure(format!(
                    "cannot create downloads dir {}: {source}",
                    self.downloads_dir.display()
                ))
            })?;
        let prefix = self
            .downloads_dir
            .join(format!("{}_{}", sanitize_filename(&metadata.title), format_id));

        let throttle = ProgressThrottle::new(10);
        let download_sink = Arc::clone(&sink);
        let on_progress = move |percent: u8| {
            if throttle.accept(percent) {
                download_sink.update(ProgressStage::Download, percent);
            }
        };
        let path = self
            .extractor
            .download(
                &metadata.source_url,
                &format_id,
                &prefix,
                audio_only,
                &on_progress,
            )
            .await
            .map_err(|source| {
                error!(source_id = %metadata.source_id, %format_id, %source, "download failed");
                PipelineError::DownloadFailed(source.to_string())
            })?;

        // Discard the temp file whether or not anything downstream of the
        // download succeeded.
        let result = self
            .archive_and_deliver(&path, &metadata, &format_id, &resolution, kind, &request, &sink)
            .await;
        if let Err(source) = tokio::fs::remove_file(&path).await {
            warn!(%source, path = %path.display(), "failed to remove temp file");
        }
        let delivered = result?;

        info!(
            source_id = %metadata.source_id,
            %format_id,
            %resolution,
            size = delivered.file_size,
            "acquisition complete"
        );
        Ok(CompletedDownload {
            archive_message_id: delivered.archive_message_id,
            file_ref: delivered.file_ref,
            file_size: delivered.file_size,
            resolution,
        })
    }

    /// Everything between a finished download and a cleaned-up temp file:
    /// archive upload, cache insert, requester delivery.
    #[allow(clippy::too_many_arguments)]
    async fn archive_and_deliver(
        &self,
        path: &Path,
        metadata: &MediaMetadata,
        format_id: &str,
        resolution: &str,
        kind: MediaKind,
        request: &RequestContext,
        sink: &Arc<dyn ProgressSink>,
    ) -> PipelineResult<DeliveredArtifact> {
        let delivery_meta = DeliveryMetadata {
            title: metadata.title.clone(),
            uploader: metadata.uploader.clone(),
            duration_s: metadata.duration_s,
            resolution: resolution.to_string(),
            format_id: format_id.to_string(),
        };
        let delivered = self
            .dispatcher
            .deliver(path, kind, &delivery_meta, sink.as_ref())
            .await?;

        let stored = NewArtifact {
            source_id: metadata.source_id.clone(),
            format_id: format_id.to_string(),
            resolution: resolution.to_string(),
            file_ref: delivered.file_ref.clone(),
            archive_message_id: delivered.archive_message_id,
            title: Some(metadata.title.clone()),
            uploader: metadata.uploader.clone(),
            duration_s: metadata.duration_s,
            file_size: i64::try_from(delivered.file_size).ok(),
            media_kind: kind,
        };
        match self.cache.store(stored) {
            Ok(_) => {}
            Err(CacheError::Duplicate { cache_key }) => {
                // A concurrent request for another resolution of the same
                // source can win the race; ours is already archived.
                debug!(%cache_key, "artifact already cached");
            }
            Err(source) => {
                warn!(%source, "failed to cache artifact");
            }
        }

        let caption = format!("{}\n{resolution}", metadata.title);
        match delivered.file_ref.as_deref() {
            Some(file_ref) => {
                self.dispatcher
                    .direct()
                    .send_by_ref(&request.destination, file_ref, kind, &caption)
                    .await?;
            }
            None => {
                self.dispatcher
                    .direct()
                    .forward(
                        &request.destination,
                        self.dispatcher.archive_destination(),
                        delivered.archive_message_id,
                    )
                    .await?;
            }
        }

        Ok(delivered)
    }
}

fn cached_caption(artifact: &CachedArtifact) -> String {
    match artifact.title.as_deref() {
        Some(title) => format!("{title}\n{}", artifact.resolution),
        None => artifact.resolution.clone(),
    }
}

/// Strip characters the filesystem or the extractor's templating would
/// choke on, and cap the length.
pub fn sanitize_filename(name: &str) -> String {
    const MAX_LEN: usize = 200;
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '%' => '_',
            c if c.is_whitespace() => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '_' || c == '.').to_string();
    let base = if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed
    };
    base.chars().take(MAX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_and_whitespace() {
        assert_eq!(
            sanitize_filename("My Video: The \"Best\" / Worst?"),
            "My_Video__The__Best____Worst"
        );
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_filename("***"), "media");
        assert_eq!(sanitize_filename(""), "media");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), 200);
    }
}
