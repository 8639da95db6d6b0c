use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::chain::FailurePolicy;
use crate::cost::CostTable;
use crate::encoding::EncodingProfile;
use crate::request::{AspectRatio, Resolution};
use crate::stitch::TransitionSpec;

pub const API_KEY_ENV: &str = "CLIPCHAIN_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,

    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    #[serde(default = "default_max_concurrent_submissions")]
    pub max_concurrent_submissions: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub transition: TransitionSpec,
    #[serde(default)]
    pub encoding: EncodingProfile,
    #[serde(default)]
    pub enhance: EnhanceConfig,
    #[serde(default)]
    pub costs: CostTable,

    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: f64,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub resolution: Resolution,
    /// Pick one random seed per job when the job spec does not pin one.
    #[serde(default = "default_true")]
    pub randomize_seed: bool,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_enhance_height")]
    pub target_height: u32,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_height: default_enhance_height(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_image_model() -> String {
    "imagen-4.0-generate-001".to_string()
}

fn default_video_model() -> String {
    "veo-3.0-generate-001".to_string()
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_poll_max_attempts() -> u32 {
    60
}

fn default_max_concurrent_submissions() -> usize {
    2
}

fn default_segment_seconds() -> f64 {
    8.0
}

fn default_enhance_height() -> u32 {
    1080
}

fn default_true() -> bool {
    true
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_bin() -> String {
    "ffprobe".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: default_api_base_url(),
            image_model: default_image_model(),
            video_model: default_video_model(),
            jobs_dir: default_jobs_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_attempts: default_poll_max_attempts(),
            max_concurrent_submissions: default_max_concurrent_submissions(),
            failure_policy: FailurePolicy::default(),
            transition: TransitionSpec::default(),
            encoding: EncodingProfile::default(),
            enhance: EnhanceConfig::default(),
            costs: CostTable::default(),
            segment_seconds: default_segment_seconds(),
            aspect_ratio: AspectRatio::default(),
            resolution: Resolution::default(),
            randomize_seed: true,
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.api_key = key;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("config.json: api_key missing (or set {})", API_KEY_ENV);
        }
        if self.api_base_url.trim().is_empty() {
            anyhow::bail!("config.json: api_base_url missing");
        }
        if self.poll_interval_ms == 0 || self.poll_max_attempts == 0 {
            anyhow::bail!("config.json: poll_interval_ms and poll_max_attempts must be positive");
        }
        if self.max_concurrent_submissions == 0 {
            anyhow::bail!("config.json: max_concurrent_submissions must be at least 1");
        }
        if !(self.segment_seconds.is_finite() && self.segment_seconds > 0.0) {
            anyhow::bail!("config.json: segment_seconds must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
