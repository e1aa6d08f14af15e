pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod media;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod session;
pub mod sqlite;
pub mod transport;

pub use cache::{
    cache_key, CacheError, CacheResult, CacheStats, CachedArtifact, ContentCache,
    ContentCacheBuilder, NewArtifact, TierCounters,
};
pub use config::{
    load_vgrab_config, CacheSection, DeliverySection, ExtractorSection, PathsSection,
    QueueSection, SessionsSection, VgrabConfig,
};
pub use error::{ConfigError, Result};
pub use extractor::{ExtractorError, ExtractorResult, MediaExtractor, ProgressFn, YtDlpExtractor};
pub use media::{
    select_formats, FormatCandidate, MediaKind, MediaMetadata, RawFormat, AUDIO_RESOLUTION,
};
pub use pipeline::{
    CompletedDownload, Pipeline, PipelineError, PipelineResult, PipelineStatus, Presentation,
    RequestContext, SelectionOutcome,
};
pub use progress::{NullProgress, ProgressSink, ProgressStage, ProgressThrottle};
pub use queue::{JobHandle, JobQueue, QueueError, QueueStatus};
pub use session::{SessionError, SessionRecord, SessionResult, SessionStore, SessionStoreBuilder};
pub use transport::{
    BulkTransport, DeliveredArtifact, DeliveryMetadata, DirectTransport, SentMessage,
    TransportDispatcher, TransportError, TransportResult, TransportRoute,
    DIRECT_SIZE_LIMIT_BYTES,
};
