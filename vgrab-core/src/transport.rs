use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::media::MediaKind;
use crate::progress::{ProgressSink, ProgressStage, ProgressThrottle};

/// Hard per-file ceiling of the direct transport.
pub const DIRECT_SIZE_LIMIT_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Caption-level metadata attached to a delivered file.
#[derive(Debug, Clone)]
pub struct DeliveryMetadata {
    pub title: String,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
    pub resolution: String,
    pub format_id: String,
}

impl DeliveryMetadata {
    pub fn caption(&self) -> String {
        format!("{}\n{} | {}", self.title, self.resolution, self.format_id)
    }
}

/// A message reference returned by either transport. `file_ref` is the
/// direct transport's re-sendable handle; the bulk transport does not
/// produce one natively.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: i64,
    pub file_ref: Option<String>,
}

/// Low-latency delivery path with a hard size ceiling (enforced by the
/// dispatcher, not the implementation).
#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        kind: MediaKind,
        meta: &DeliveryMetadata,
    ) -> TransportResult<SentMessage>;

    /// Re-send a previously uploaded file by its transport handle.
    async fn send_by_ref(
        &self,
        destination: &str,
        file_ref: &str,
        kind: MediaKind,
        caption: &str,
    ) -> TransportResult<SentMessage>;

    async fn forward(
        &self,
        destination: &str,
        from_destination: &str,
        message_id: i64,
    ) -> TransportResult<SentMessage>;

    async fn delete(&self, destination: &str, message_id: i64) -> TransportResult<()>;
}

/// Higher-latency delivery path without a size ceiling. Progress is
/// reported as a fraction in 0..=1.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    async fn send_file(
        &self,
        destination: &str,
        path: &Path,
        kind: MediaKind,
        meta: &DeliveryMetadata,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TransportResult<SentMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRoute {
    Direct,
    Bulk,
}

/// Normalized result of an archive upload, whichever transport carried it.
#[derive(Debug, Clone)]
pub struct DeliveredArtifact {
    pub archive_message_id: i64,
    pub file_ref: Option<String>,
    pub file_size: u64,
    pub route: TransportRoute,
}

/// Chooses a transport per artifact by file size and normalizes both into
/// a single delivered-artifact result.
pub struct TransportDispatcher {
    direct: Arc<dyn DirectTransport>,
    bulk: Arc<dyn BulkTransport>,
    archive_destination: String,
    direct_limit: u64,
}

impl TransportDispatcher {
    pub fn new(
        direct: Arc<dyn DirectTransport>,
        bulk: Arc<dyn BulkTransport>,
        archive_destination: impl Into<String>,
    ) -> Self {
        Self {
            direct,
            bulk,
            archive_destination: archive_destination.into(),
            direct_limit: DIRECT_SIZE_LIMIT_BYTES,
        }
    }

    pub fn with_direct_limit(mut self, limit: u64) -> Self {
        self.direct_limit = limit;
        self
    }

    pub fn archive_destination(&self) -> &str {
        &self.archive_destination
    }

    pub fn direct(&self) -> &Arc<dyn DirectTransport> {
        &self.direct
    }

    /// Uploads the file to the archive destination. At or below the direct
    /// cap the direct transport is used in a single call; above it the bulk
    /// transport carries the file with throttled progress, and a
    /// direct-addressable file ref is resolved best-effort afterwards.
    /// No automatic fallback between transports.
    pub async fn deliver(
        &self,
        path: &Path,
        kind: MediaKind,
        meta: &DeliveryMetadata,
        sink: &dyn ProgressSink,
    ) -> TransportResult<DeliveredArtifact> {
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|source| TransportError::Io {
                source,
                path: path.to_path_buf(),
            })?
            .len();

        if file_size <= self.direct_limit {
            debug!(file_size, "delivering via direct transport");
            let sent = self
                .direct
                .send_file(&self.archive_destination, path, kind, meta)
                .await?;
            sink.update(ProgressStage::Upload, 100);
            return Ok(DeliveredArtifact {
                archive_message_id: sent.message_id,
                file_ref: sent.file_ref,
                file_size,
                route: TransportRoute::Direct,
            });
        }

        debug!(file_size, "delivering via bulk transport");
        let throttle = ProgressThrottle::new(10);
        let sent = self
            .bulk
            .send_file(&self.archive_destination, path, kind, meta, &|fraction| {
                let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
                if throttle.accept(percent) {
                    sink.update(ProgressStage::Upload, percent);
                }
            })
            .await?;
        if throttle.finish() {
            sink.update(ProgressStage::Upload, 100);
        }

        let file_ref = match sent.file_ref {
            Some(existing) => Some(existing),
            None => self.resolve_file_ref(sent.message_id).await,
        };
        info!(
            message_id = sent.message_id,
            resolved_ref = file_ref.is_some(),
            "bulk delivery complete"
        );
        Ok(DeliveredArtifact {
            archive_message_id: sent.message_id,
            file_ref,
            file_size,
            route: TransportRoute::Bulk,
        })
    }

    /// Re-exposes a bulk-delivered item through the direct transport by
    /// forwarding it within the archive and discarding the forwarded copy.
    /// Best-effort: the delivery stands even when this fails.
    async fn resolve_file_ref(&self, message_id: i64) -> Option<String> {
        match self
            .direct
            .forward(
                &self.archive_destination,
                &self.archive_destination,
                message_id,
            )
            .await
        {
            Ok(copy) => {
                if let Err(error) = self
                    .direct
                    .delete(&self.archive_destination, copy.message_id)
                    .await
                {
                    warn!(%error, "failed to discard forwarded copy");
                }
                copy.file_ref
            }
            Err(error) => {
                warn!(%error, message_id, "could not resolve file ref for bulk delivery");
                None
            }
        }
    }
}
