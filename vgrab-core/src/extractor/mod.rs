mod error;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ExtractorSection;
use crate::media::{select_formats, MediaMetadata, RawFormat};

pub use error::{ExtractorError, ExtractorResult};

const STDERR_TAIL_LINES: usize = 16;

/// Callback receiving download progress as an integer percent, 0..=100.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Contract with the external extraction/download tool.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Resolve a URL into metadata plus a ranked catalog of formats.
    async fn probe(&self, url: &str) -> ExtractorResult<MediaMetadata>;

    /// Stream-download one format; returns the final file path.
    async fn download(
        &self,
        url: &str,
        format_id: &str,
        output_prefix: &Path,
        audio_only: bool,
        on_progress: ProgressFn<'_>,
    ) -> ExtractorResult<PathBuf>;
}

/// `MediaExtractor` backed by the yt-dlp command-line tool.
pub struct YtDlpExtractor {
    binary: PathBuf,
    cookies_file: Option<PathBuf>,
    probe_timeout: Duration,
    min_video_height: u32,
    max_video_variants: usize,
    progress_re: Regex,
    destination_res: Vec<Regex>,
}

#[derive(Debug, Deserialize)]
struct ProbePayload {
    id: String,
    #[serde(default)]
    webpage_url: Option<String>,
    title: String,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    view_count: Option<i64>,
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

impl YtDlpExtractor {
    pub fn new(section: &ExtractorSection) -> Self {
        Self {
            binary: PathBuf::from(&section.binary),
            cookies_file: section.cookies_file.as_ref().map(PathBuf::from),
            probe_timeout: Duration::from_secs(section.probe_timeout_seconds),
            min_video_height: section.min_video_height,
            max_video_variants: section.max_video_variants,
            progress_re: Regex::new(r"(\d+(?:\.\d+)?)%").expect("static regex"),
            destination_res: [
                r"\[ExtractAudio\] Destination: (.+)",
                r#"\[Merger\] Merging formats into "(.+)""#,
                r"\[ffmpeg\] Destination: (.+)",
                r"\[download\] Destination: (.+)",
            ]
            .iter()
            .map(|pattern| Regex::new(pattern).expect("static regex"))
            .collect(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn detect_destination(&self, line: &str) -> Option<PathBuf> {
        self.destination_res.iter().find_map(|re| {
            re.captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| PathBuf::from(m.as_str().trim()))
        })
    }

    fn parse_percent(&self, line: &str) -> Option<u8> {
        self.progress_re
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 100.0) as u8)
    }

    fn download_args(
        &self,
        url: &str,
        format_id: &str,
        output_prefix: &Path,
        audio_only: bool,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--no-update".into(),
            "--newline".into(),
            "--restrict-filenames".into(),
            "--no-playlist".into(),
        ];
        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }
        let format = if format_id.contains('+') {
            format_id.to_string()
        } else {
            format!("{format_id}+bestaudio/best")
        };
        args.push("-f".into());
        args.push(format);
        if audio_only {
            args.push("--extract-audio".into());
            args.push("--audio-format".into());
            args.push("m4a".into());
        } else {
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
        args.push("-o".into());
        args.push(format!("{}.%(ext)s", output_prefix.to_string_lossy()));
        args.push(url.into());
        args
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn probe(&self, url: &str) -> ExtractorResult<MediaMetadata> {
        info!(%url, "probing source");
        let output = timeout(
            self.probe_timeout,
            Command::new(&self.binary)
                .args(["--dump-json", "--no-playlist", url])
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ExtractorError::Timeout {
            seconds: self.probe_timeout.as_secs(),
        })?
        .map_err(|source| ExtractorError::Spawn {
            source,
            binary: self.binary.clone(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(%url, status = ?output.status.code(), "probe failed");
            return Err(ExtractorError::SourceUnavailable {
                reason: tail(&stderr),
            });
        }

        let payload: ProbePayload = serde_json::from_slice(&output.stdout)?;
        let formats = select_formats(
            &payload.formats,
            self.min_video_height,
            self.max_video_variants,
        );
        Ok(MediaMetadata {
            source_id: payload.id,
            source_url: payload.webpage_url.unwrap_or_else(|| url.to_string()),
            title: payload.title,
            uploader: payload.uploader.or(payload.channel),
            duration_s: payload.duration.map(|value| value.round() as i64),
            view_count: payload.view_count,
            like_count: payload.like_count,
            upload_date: payload.upload_date,
            thumbnail: payload.thumbnail,
            formats,
        })
    }

    async fn download(
        &self,
        url: &str,
        format_id: &str,
        output_prefix: &Path,
        audio_only: bool,
        on_progress: ProgressFn<'_>,
    ) -> ExtractorResult<PathBuf> {
        info!(%url, %format_id, "starting download");
        let args = self.download_args(url, format_id, output_prefix, audio_only);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExtractorError::Spawn {
                source,
                binary: self.binary.clone(),
            })?;

        let stdout = child.stdout.take().ok_or(ExtractorError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ExtractorError::Pipe("stderr"))?;

        let destination_res = self.destination_res.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut destination = None;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(path) = destination_res.iter().find_map(|re| {
                    re.captures(&line)
                        .and_then(|caps| caps.get(1))
                        .map(|m| PathBuf::from(m.as_str().trim()))
                }) {
                    destination = Some(path);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            (destination, tail.into_iter().collect::<Vec<_>>().join("\n"))
        });

        let mut destination: Option<PathBuf> = None;
        let mut last_reported: Option<u8> = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(path) = self.detect_destination(&line) {
                destination = Some(path);
            }
            if let Some(percent) = self.parse_percent(&line) {
                let changed = match last_reported {
                    Some(previous) => percent >= previous.saturating_add(5) || percent == 100,
                    None => true,
                };
                if changed {
                    on_progress(percent);
                    last_reported = Some(percent);
                }
            }
        }

        let status = child.wait().await?;
        let (stderr_destination, stderr_tail) =
            stderr_task.await.unwrap_or((None, String::new()));
        if destination.is_none() {
            destination = stderr_destination;
        }

        if !status.success() {
            warn!(%url, status = ?status.code(), "download failed");
            return Err(ExtractorError::DownloadFailed {
                status: status.code(),
                stderr: stderr_tail,
            });
        }

        let final_path = destination.unwrap_or_else(|| {
            let ext = if audio_only { "m4a" } else { "mp4" };
            output_prefix.with_extension(ext)
        });
        debug!(path = %final_path.display(), "download finished");
        Ok(final_path)
    }
}

fn tail(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .take(STDERR_TAIL_LINES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n")
}
