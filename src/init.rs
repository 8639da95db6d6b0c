use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

use crate::{logi, logw};

pub async fn ensure_directories(jobs_dir: &Path) -> Result<()> {
    if !jobs_dir.exists() {
        fs::create_dir_all(jobs_dir)
            .await
            .with_context(|| format!("Failed to create jobs directory: {}", jobs_dir.display()))?;
        logi(format!("Created directory: {}", jobs_dir.display()));
    }
    Ok(())
}

/// Whether both ffmpeg and ffprobe resolve, either as paths or on `PATH`.
pub fn check_ffmpeg(ffmpeg: &str, ffprobe: &str) -> bool {
    let mut ok = true;
    for tool in [ffmpeg, ffprobe] {
        if which::which(tool).is_err() {
            logw(format!("{tool} not found. Please install FFmpeg or set its path in config.json."));
            ok = false;
        }
    }
    ok
}
