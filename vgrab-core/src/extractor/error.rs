use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("source unavailable: {reason}")]
    SourceUnavailable { reason: String },
    #[error("extractor exited with status {status:?}: {stderr}")]
    DownloadFailed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to spawn extractor {binary}: {source}")]
    Spawn {
        source: std::io::Error,
        binary: PathBuf,
    },
    #[error("failed to capture {0} of extractor process")]
    Pipe(&'static str),
    #[error("extractor timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("failed to parse extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExtractorResult<T> = Result<T, ExtractorError>;
