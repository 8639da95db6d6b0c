//! Output encoding profile. Stitched output is always H.264 4:2:0, profile
//! `high`, capped at level 4.1; only CRF and preset are caller choices.

use serde::{Deserialize, Serialize};

use crate::media::StreamInfo;

pub const BASELINE_VIDEO_CODEC: &str = "libx264";
pub const BASELINE_PIXEL_FORMAT: &str = "yuv420p";
pub const BASELINE_PROFILE: &str = "high";
pub const BASELINE_LEVEL: &str = "4.1";

pub const DEFAULT_PRESET: &str = "veryfast";
pub const DEFAULT_CRF: u8 = 22;

pub const AUDIO_CODEC: &str = "aac";
pub const AUDIO_BITRATE: &str = "192k";
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingProfile {
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_codec() -> String {
    BASELINE_VIDEO_CODEC.to_string()
}
fn default_pixel_format() -> String {
    BASELINE_PIXEL_FORMAT.to_string()
}
fn default_profile() -> String {
    BASELINE_PROFILE.to_string()
}
fn default_level() -> String {
    BASELINE_LEVEL.to_string()
}
fn default_crf() -> u8 {
    DEFAULT_CRF
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self::compatibility_baseline()
    }
}

impl EncodingProfile {
    pub fn compatibility_baseline() -> Self {
        Self {
            codec: default_codec(),
            pixel_format: default_pixel_format(),
            profile: default_profile(),
            level: default_level(),
            crf: DEFAULT_CRF,
            preset: default_preset(),
        }
    }

    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = crf.min(51);
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    /// Force codec, pixel format, profile and level to the baseline.
    pub fn enforce_baseline(self) -> Self {
        Self {
            crf: self.crf.min(51),
            preset: self.preset,
            ..Self::compatibility_baseline()
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.codec == BASELINE_VIDEO_CODEC
            && self.pixel_format == BASELINE_PIXEL_FORMAT
            && self.profile == BASELINE_PROFILE
            && self.level == BASELINE_LEVEL
    }

    /// Whether a probed stream satisfies this profile.
    ///
    /// ffprobe reports decoder names ("h264"), profile names like "High" and
    /// levels as integers (41). The level is a cap; lower levels pass.
    pub fn matches_stream(&self, stream: &StreamInfo) -> bool {
        let level_ok = match (stream.level, self.level_number()) {
            (Some(level), Some(cap)) => level <= cap,
            _ => false,
        };
        level_ok
            && stream.codec.eq_ignore_ascii_case(self.stream_codec())
            && stream.pixel_format.eq_ignore_ascii_case(&self.pixel_format)
            && stream.profile.eq_ignore_ascii_case(&self.profile)
    }

    /// One-line description for mismatch errors.
    pub fn describe_mismatch(&self, stream: &StreamInfo) -> String {
        format!(
            "{} {} {} level {}, expected {} {} {} level <= {}",
            stream.codec,
            stream.pixel_format,
            stream.profile,
            stream.level.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string()),
            self.stream_codec(),
            self.pixel_format,
            self.profile,
            self.level,
        )
    }

    /// Level as ffprobe reports it: "4.1" is 41, "4" is 40.
    pub fn level_number(&self) -> Option<u32> {
        let (major, minor) = self.level.split_once('.').unwrap_or((self.level.as_str(), "0"));
        Some(major.parse::<u32>().ok()? * 10 + minor.parse::<u32>().ok()?)
    }

    fn stream_codec(&self) -> &str {
        match self.codec.as_str() {
            "libx264" => "h264",
            "libx265" => "hevc",
            other => other,
        }
    }

    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-c:v".to_string(),
            self.codec.clone(),
            "-pix_fmt".to_string(),
            self.pixel_format.clone(),
            "-profile:v".to_string(),
            self.profile.clone(),
            "-level:v".to_string(),
            self.level.clone(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-c:a".to_string(),
            AUDIO_CODEC.to_string(),
            "-b:a".to_string(),
            AUDIO_BITRATE.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]
    }
}
