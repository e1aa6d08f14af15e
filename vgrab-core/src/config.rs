use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 45;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VgrabConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub extractor: ExtractorSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub cache: CacheSection,
    pub delivery: DeliverySection,
}

impl VgrabConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn sessions_db(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir).join("sessions.sqlite")
    }

    pub fn cache_db(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir).join("cache.sqlite")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub downloads_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorSection {
    #[serde(default = "default_binary")]
    pub binary: String,
    pub cookies_file: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_min_height")]
    pub min_video_height: u32,
    #[serde(default = "default_max_variants")]
    pub max_video_variants: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_session_ttl")]
    pub ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_stale_days")]
    pub stale_after_days: i64,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    pub archive_destination: String,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            cookies_file: None,
            probe_timeout_seconds: default_probe_timeout(),
            min_video_height: default_min_height(),
            max_video_variants: default_max_variants(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            ttl_days: default_session_ttl(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_days(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

fn default_binary() -> String {
    "yt-dlp".to_string()
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECONDS
}

fn default_min_height() -> u32 {
    360
}

fn default_max_variants() -> usize {
    7
}

fn default_max_parallel() -> usize {
    3
}

fn default_session_ttl() -> i64 {
    7
}

fn default_stale_days() -> i64 {
    30
}

fn default_memory_capacity() -> usize {
    1024
}

pub fn load_vgrab_config<P: AsRef<Path>>(path: P) -> Result<VgrabConfig> {
    load_toml(path)
}

fn load_toml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            [paths]
            base_dir = "/srv/vgrab"
            data_dir = "data"
            downloads_dir = "downloads"
            logs_dir = "logs"

            [delivery]
            archive_destination = "-1001234567890"
        "#;
        let config: VgrabConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.extractor.binary, "yt-dlp");
        assert_eq!(config.queue.max_parallel, 3);
        assert_eq!(config.sessions.ttl_days, 7);
        assert_eq!(config.cache.stale_after_days, 30);
        assert_eq!(config.extractor.min_video_height, 360);
        assert_eq!(config.extractor.max_video_variants, 7);
        assert_eq!(
            config.sessions_db(),
            PathBuf::from("/srv/vgrab/data/sessions.sqlite")
        );
    }
}
