use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use vgrab_core::{
    load_vgrab_config, ContentCache, MediaExtractor, SessionStore, VgrabConfig, YtDlpExtractor,
};

pub mod render;

use render::{format_duration, format_file_size, format_number, format_upload_date};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vgrab_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("session store error: {0}")]
    Session(#[from] vgrab_core::SessionError),
    #[error("cache error: {0}")]
    Cache(#[from] vgrab_core::CacheError),
    #[error("extractor error: {0}")]
    Extractor(#[from] vgrab_core::ExtractorError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vgrab command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main vgrab.toml
    #[arg(long, default_value = "configs/vgrab.toml")]
    pub config: PathBuf,
    /// Override for the data directory (replaces paths.data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternate path to sessions.sqlite
    #[arg(long)]
    pub sessions_db: Option<PathBuf>,
    /// Alternate path to cache.sqlite
    #[arg(long)]
    pub cache_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show a summary of sessions and cached artifacts
    Status,
    /// Probe a URL and list the selectable formats
    Resolve(ResolveArgs),
    /// Content cache operations
    #[command(subcommand)]
    Cache(CacheCommands),
    /// Selection session operations
    #[command(subcommand)]
    Session(SessionCommands),
    /// Run integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Source URL to probe
    pub url: String,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cache totals and the most requested artifacts
    Stats(CacheStatsArgs),
    /// Drop artifacts not accessed recently
    Sweep(CacheSweepArgs),
}

#[derive(Args, Debug)]
pub struct CacheStatsArgs {
    /// Number of artifacts to list
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CacheSweepArgs {
    /// Age threshold in days (defaults to cache.stale_after_days)
    #[arg(long)]
    pub older_than_days: Option<i64>,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Drop expired selection sessions
    Sweep,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Run basic checks
    Check,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render_output(&status, cli.format)?;
        }
        Commands::Resolve(args) => {
            let report = context.resolve(args)?;
            render_output(&report, cli.format)?;
        }
        Commands::Cache(CacheCommands::Stats(args)) => {
            let report = context.cache_stats(args)?;
            render_output(&report, cli.format)?;
        }
        Commands::Cache(CacheCommands::Sweep(args)) => {
            let result = context.cache_sweep(args)?;
            render_output(&result, cli.format)?;
        }
        Commands::Session(SessionCommands::Sweep) => {
            let result = context.session_sweep()?;
            render_output(&result, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check();
            render_output(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render_output<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: VgrabConfig,
    config_path: PathBuf,
    sessions_db: PathBuf,
    cache_db: PathBuf,
    downloads_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_vgrab_config(&config_path)?;
        if let Some(data_dir) = &cli.data_dir {
            config.paths.data_dir = data_dir.display().to_string();
        }

        let sessions_db = cli.sessions_db.clone().unwrap_or_else(|| config.sessions_db());
        let cache_db = cli.cache_db.clone().unwrap_or_else(|| config.cache_db());
        let downloads_dir = config.resolve_path(&config.paths.downloads_dir);

        Ok(Self {
            config,
            config_path,
            sessions_db,
            cache_db,
            downloads_dir,
        })
    }

    fn open_readonly(&self, path: &Path) -> Result<Connection> {
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "database missing: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let sessions = self
            .open_readonly(&self.sessions_db)
            .and_then(|conn| {
                conn.query_row("SELECT COUNT(*) FROM video_sessions", [], |row| row.get(0))
                    .map_err(AppError::Database)
            })
            .ok();
        let cache = self
            .open_readonly(&self.cache_db)
            .and_then(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM cached_artifacts",
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .map_err(AppError::Database)
            })
            .ok();

        Ok(StatusReport {
            active_sessions: sessions,
            cached_artifacts: cache.map(|(count, _)| count),
            cached_bytes: cache.map(|(_, bytes)| bytes),
        })
    }

    fn resolve(&self, args: &ResolveArgs) -> Result<ResolveReport> {
        let extractor = YtDlpExtractor::new(&self.config.extractor);
        let runtime = tokio::runtime::Runtime::new()?;
        let metadata = runtime.block_on(extractor.probe(&args.url))?;

        let formats = metadata
            .formats
            .iter()
            .map(|candidate| FormatLine {
                format_id: candidate.format_id.clone(),
                resolution: candidate.resolution.clone(),
                ext: candidate.ext.clone(),
                filesize: candidate.filesize,
            })
            .collect();
        Ok(ResolveReport {
            source_id: metadata.source_id,
            title: metadata.title,
            uploader: metadata.uploader,
            duration_s: metadata.duration_s,
            view_count: metadata.view_count,
            upload_date: metadata.upload_date,
            formats,
        })
    }

    fn cache_stats(&self, args: &CacheStatsArgs) -> Result<CacheReport> {
        let conn = self.open_readonly(&self.cache_db)?;
        let (artifacts, total_bytes) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM cached_artifacts",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT source_id, resolution, media_kind, title, file_size, access_count, \
                    last_accessed_at \
             FROM cached_artifacts \
             ORDER BY access_count DESC, last_accessed_at DESC \
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([args.limit as i64], |row| {
                Ok(CacheEntry {
                    source_id: row.get(0)?,
                    resolution: row.get(1)?,
                    media_kind: row.get(2)?,
                    title: row.get::<_, Option<String>>(3)?,
                    file_size: row.get::<_, Option<i64>>(4)?,
                    access_count: row.get(5)?,
                    last_accessed_at: row.get::<_, Option<String>>(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(CacheReport {
            artifacts,
            total_bytes,
            rows,
        })
    }

    fn cache_sweep(&self, args: &CacheSweepArgs) -> Result<SweepResult> {
        let cache = ContentCache::builder().path(&self.cache_db).build()?;
        let days = args
            .older_than_days
            .unwrap_or(self.config.cache.stale_after_days);
        let removed = cache.sweep_stale(days)?;
        Ok(SweepResult {
            removed,
            detail: format!("artifacts unused for {days}+ days"),
        })
    }

    fn session_sweep(&self) -> Result<SweepResult> {
        let store = SessionStore::builder()
            .path(&self.sessions_db)
            .ttl_days(self.config.sessions.ttl_days)
            .build()?;
        let removed = store.sweep_expired()?;
        Ok(SweepResult {
            removed,
            detail: "expired selection sessions".to_string(),
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("vgrab.toml", &self.config_path));
        results.push(self.check_database("sessions.sqlite", &self.sessions_db));
        results.push(self.check_database("cache.sqlite", &self.cache_db));
        results.push(self.check_directory("downloads", &self.downloads_dir));
        results.push(self.check_binary("extractor", &self.config.extractor.binary));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{} missing", path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
        }
    }

    fn check_binary(&self, name: &str, binary: &str) -> HealthEntry {
        let as_path = Path::new(binary);
        if as_path.components().count() > 1 {
            return self.check_path(name, as_path);
        }
        let found = std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
            })
            .unwrap_or(false);
        if found {
            HealthEntry::ok(name, format!("{binary} on PATH"))
        } else {
            HealthEntry::error(name, format!("{binary} not found on PATH"))
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{} not found", path.display()));
        }
        match self.open_readonly(path) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_sessions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_artifacts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_bytes: Option<i64>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        match self.active_sessions {
            Some(count) => lines.push(format!("Sessions: {}", format_number(count))),
            None => lines.push("Sessions: unavailable".to_string()),
        }
        match (self.cached_artifacts, self.cached_bytes) {
            (Some(count), Some(bytes)) => lines.push(format!(
                "Cache: {} artifacts, {}",
                format_number(count),
                format_file_size(bytes)
            )),
            _ => lines.push("Cache: unavailable".to_string()),
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveReport {
    pub source_id: String,
    pub title: String,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
    pub view_count: Option<i64>,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatLine>,
}

#[derive(Debug, Serialize)]
pub struct FormatLine {
    pub format_id: String,
    pub resolution: String,
    pub ext: String,
    pub filesize: Option<u64>,
}

impl DisplayFallback for ResolveReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} [{}]", self.title, self.source_id)];
        if let Some(uploader) = &self.uploader {
            lines.push(format!("Uploader: {uploader}"));
        }
        if let Some(duration) = self.duration_s {
            lines.push(format!("Duration: {}", format_duration(duration)));
        }
        if let Some(views) = self.view_count {
            lines.push(format!("Views: {}", format_number(views)));
        }
        if let Some(date) = &self.upload_date {
            lines.push(format!("Uploaded: {}", format_upload_date(date)));
        }
        lines.push("Formats:".to_string());
        for format in &self.formats {
            let size = format
                .filesize
                .map(|bytes| format_file_size(bytes as i64))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  {} | {} | {} | {}",
                format.format_id, format.resolution, format.ext, size
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CacheReport {
    pub artifacts: i64,
    pub total_bytes: i64,
    pub rows: Vec<CacheEntry>,
}

#[derive(Debug, Serialize)]
pub struct CacheEntry {
    pub source_id: String,
    pub resolution: String,
    pub media_kind: String,
    pub title: Option<String>,
    pub file_size: Option<i64>,
    pub access_count: i64,
    pub last_accessed_at: Option<String>,
}

impl DisplayFallback for CacheReport {
    fn display(&self) -> String {
        if self.artifacts == 0 {
            return "Cache is empty".to_string();
        }
        let mut lines = vec![format!(
            "{} artifacts, {}",
            format_number(self.artifacts),
            format_file_size(self.total_bytes)
        )];
        for entry in &self.rows {
            let size = entry
                .file_size
                .map(format_file_size)
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{} | {} | {} | {} | hits={}",
                entry.source_id,
                entry.title.as_deref().unwrap_or("<untitled>"),
                entry.resolution,
                size,
                entry.access_count
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SweepResult {
    pub removed: usize,
    pub detail: String,
}

impl DisplayFallback for SweepResult {
    fn display(&self) -> String {
        format!("Removed {} ({})", self.removed, self.detail)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use vgrab_core::{ContentCache, MediaKind, NewArtifact, SessionStore};

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::create_dir_all(root.join("downloads")).unwrap();

        fs::write(
            configs_dir.join("vgrab.toml"),
            format!(
                r#"
[paths]
base_dir = "{root}"
data_dir = "{data}"
downloads_dir = "downloads"
logs_dir = "logs"

[delivery]
archive_destination = "archive"
"#,
                root = root.display(),
                data = data_dir.display(),
            ),
        )
        .unwrap();

        let sessions = SessionStore::builder()
            .path(data_dir.join("sessions.sqlite"))
            .create_if_missing(true)
            .build()?;
        sessions.initialize()?;

        let cache = ContentCache::builder()
            .path(data_dir.join("cache.sqlite"))
            .create_if_missing(true)
            .build()?;
        cache.initialize()?;
        cache.store(NewArtifact {
            source_id: "abc123".into(),
            format_id: "22".into(),
            resolution: "720p".into(),
            file_ref: Some("ref-1".into()),
            archive_message_id: 1,
            title: Some("Sample Clip".into()),
            uploader: None,
            duration_s: Some(214),
            file_size: Some(48_000_000),
            media_kind: MediaKind::Video,
        })?;

        let cli = Cli {
            config: configs_dir.join("vgrab.toml"),
            data_dir: None,
            sessions_db: None,
            cache_db: None,
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn status_report_counts_sessions_and_artifacts() {
        let (_temp, context) = prepare_test_context().unwrap();
        let status = context.gather_status().unwrap();
        assert_eq!(status.active_sessions, Some(0));
        assert_eq!(status.cached_artifacts, Some(1));
        assert_eq!(status.cached_bytes, Some(48_000_000));
    }

    #[test]
    fn cache_stats_lists_artifacts() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.cache_stats(&CacheStatsArgs { limit: 5 }).unwrap();
        assert_eq!(report.artifacts, 1);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].source_id, "abc123");
    }

    #[test]
    fn sweeps_run_against_fresh_stores() {
        let (_temp, context) = prepare_test_context().unwrap();
        assert_eq!(context.session_sweep().unwrap().removed, 0);
        assert_eq!(
            context
                .cache_sweep(&CacheSweepArgs {
                    older_than_days: None,
                })
                .unwrap()
                .removed,
            0
        );
    }

    #[test]
    fn health_check_reports_databases() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.health_check();
        let sessions = report
            .iter()
            .find(|entry| entry.name == "sessions.sqlite")
            .unwrap();
        assert!(matches!(sessions.status, CheckStatus::Ok));
    }
}
