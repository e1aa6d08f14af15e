use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Resolution label used for audio-only candidates.
pub const AUDIO_RESOLUTION: &str = "audio";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    pub fn for_resolution(resolution: &str) -> Self {
        if resolution == AUDIO_RESOLUTION {
            MediaKind::Audio
        } else {
            MediaKind::Video
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// One selectable quality/container option for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatCandidate {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub filesize: Option<u64>,
    pub quality: u32,
    pub has_audio: bool,
}

impl FormatCandidate {
    pub fn is_audio_only(&self) -> bool {
        self.resolution == AUDIO_RESOLUTION
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::for_resolution(&self.resolution)
    }
}

/// Immutable snapshot of a resolved source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub upload_date: Option<String>,
    pub thumbnail: Option<String>,
    pub formats: Vec<FormatCandidate>,
}

/// Provider-reported format descriptor, straight out of the extractor's JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: String,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
}

impl RawFormat {
    fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    fn reported_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if !value.is_empty() && value != "none")
}

/// Reduce the provider's raw format list to a bounded, deduplicated, ranked
/// catalog: the best-by-size entry per height (descending, at most
/// `max_variants`), followed by the single best audio-only entry.
///
/// An empty result means the source offers nothing usable; callers must
/// treat that as an error.
pub fn select_formats(
    raw: &[RawFormat],
    min_height: u32,
    max_variants: usize,
) -> Vec<FormatCandidate> {
    let mut per_height: HashMap<u32, FormatCandidate> = HashMap::new();
    let mut audio: Vec<FormatCandidate> = Vec::new();

    for format in raw {
        let has_video = format.has_video();
        let has_audio = format.has_audio();
        if !has_video && !has_audio {
            continue;
        }

        if !has_video {
            audio.push(FormatCandidate {
                format_id: format.format_id.clone(),
                ext: "m4a".into(),
                resolution: AUDIO_RESOLUTION.into(),
                filesize: format.reported_size(),
                quality: 0,
                has_audio: true,
            });
            continue;
        }

        let Some(height) = format.height else {
            continue;
        };
        if height < min_height {
            continue;
        }

        let size = format.reported_size();
        // A known size beats an unknown one claiming the same height.
        let replaces = match per_height.get(&height) {
            Some(existing) => size.unwrap_or(0) > existing.filesize.unwrap_or(0),
            None => true,
        };
        if replaces {
            per_height.insert(
                height,
                FormatCandidate {
                    format_id: format.format_id.clone(),
                    ext: "mp4".into(),
                    resolution: format!("{height}p"),
                    filesize: size,
                    quality: height,
                    has_audio,
                },
            );
        }
    }

    let mut video: Vec<FormatCandidate> = per_height.into_values().collect();
    video.sort_by(|a, b| b.quality.cmp(&a.quality));
    video.truncate(max_variants);

    let best_audio = audio
        .into_iter()
        .max_by_key(|candidate| candidate.filesize.unwrap_or(0));

    let mut result = video;
    if let Some(candidate) = best_audio {
        result.push(candidate);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(format_id: &str, height: u32, filesize: Option<u64>) -> RawFormat {
        RawFormat {
            format_id: format_id.into(),
            vcodec: Some("avc1".into()),
            acodec: Some("none".into()),
            height: Some(height),
            filesize,
            filesize_approx: None,
        }
    }

    fn audio(format_id: &str, filesize: Option<u64>) -> RawFormat {
        RawFormat {
            format_id: format_id.into(),
            vcodec: Some("none".into()),
            acodec: Some("mp4a".into()),
            height: None,
            filesize,
            filesize_approx: None,
        }
    }

    #[test]
    fn keeps_largest_per_height_sorted_descending_with_audio_last() {
        let raw = vec![
            video("v-small", 1080, Some(100)),
            video("v-large", 1080, Some(200)),
            video("v-720", 720, Some(50)),
            audio("a-1", Some(10)),
        ];
        let selected = select_formats(&raw, 360, 7);
        let summary: Vec<(&str, Option<u64>)> = selected
            .iter()
            .map(|c| (c.resolution.as_str(), c.filesize))
            .collect();
        assert_eq!(
            summary,
            vec![("1080p", Some(200)), ("720p", Some(50)), ("audio", Some(10))]
        );
        assert_eq!(selected[0].format_id, "v-large");
    }

    #[test]
    fn known_size_beats_unknown_at_same_height() {
        let raw = vec![video("unknown", 720, None), video("known", 720, Some(1))];
        let selected = select_formats(&raw, 360, 7);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].format_id, "known");

        // And order of arrival must not change that.
        let raw = vec![video("known", 720, Some(1)), video("unknown", 720, None)];
        let selected = select_formats(&raw, 360, 7);
        assert_eq!(selected[0].format_id, "known");
    }

    #[test]
    fn drops_low_resolutions_and_caps_variant_count() {
        let mut raw: Vec<RawFormat> = (1..=9)
            .map(|idx| video(&format!("v{idx}"), 144 * idx, Some(idx as u64)))
            .collect();
        raw.push(video("tiny", 240, Some(999)));
        let selected = select_formats(&raw, 360, 7);
        assert_eq!(selected.len(), 7);
        assert!(selected.iter().all(|c| c.quality >= 360));
        assert!(selected.windows(2).all(|w| w[0].quality > w[1].quality));
    }

    #[test]
    fn audio_only_source_yields_single_audio_candidate() {
        let raw = vec![audio("a-low", Some(5)), audio("a-high", Some(9))];
        let selected = select_formats(&raw, 360, 7);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].format_id, "a-high");
        assert!(selected[0].is_audio_only());
        assert_eq!(selected[0].kind(), MediaKind::Audio);
    }

    #[test]
    fn nothing_usable_yields_empty_list() {
        let raw = vec![RawFormat {
            format_id: "storyboard".into(),
            vcodec: Some("none".into()),
            acodec: Some("none".into()),
            ..Default::default()
        }];
        assert!(select_formats(&raw, 360, 7).is_empty());
    }
}
