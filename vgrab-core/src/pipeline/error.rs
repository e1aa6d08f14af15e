use thiserror::Error;

use crate::cache::CacheError;
use crate::session::SessionError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {reason}")]
    SourceUnavailable { reason: String },
    #[error("selection expired")]
    SessionExpired,
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl PipelineError {
    /// Short, stable, user-facing text; internals stay in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => {
                "Could not analyze the link. The source may be unavailable."
            }
            PipelineError::SessionExpired => "This selection has expired. Send the link again.",
            PipelineError::DownloadFailed(_) => "Download failed. Please try again later.",
            PipelineError::DeliveryFailed(_) => {
                "Could not deliver the file. Please try again later."
            }
            PipelineError::StorageFailure(_) => "Temporary storage problem. Please try again later.",
        }
    }
}

impl From<SessionError> for PipelineError {
    fn from(error: SessionError) -> Self {
        PipelineError::StorageFailure(error.to_string())
    }
}

impl From<CacheError> for PipelineError {
    fn from(error: CacheError) -> Self {
        PipelineError::StorageFailure(error.to_string())
    }
}

impl From<TransportError> for PipelineError {
    fn from(error: TransportError) -> Self {
        PipelineError::DeliveryFailed(error.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
