use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::media::{EncodeInvocation, EncodingTool, MediaInspector, StreamInfo};

const STDERR_SNIPPET: usize = 800;

/// ffmpeg/ffprobe on `PATH`, used both as inspector and encoder.
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegTool {
    pub fn new() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

async fn run_cmd(program: &str, args: &[String]) -> PipelineResult<()> {
    debug!("Running: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            PipelineError::encoding_tool(format!("failed to launch {program}: {e}"), None, None)
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr)
            .chars()
            .take(STDERR_SNIPPET)
            .collect::<String>();
        return Err(PipelineError::encoding_tool(
            format!("{program} exited with {}", output.status),
            Some(stderr),
            output.status.code(),
        ));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    profile: Option<String>,
    level: Option<i64>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok().filter(|v: &f64| *v > 0.0)
}

fn parse_stream_info(json: &[u8]) -> Result<StreamInfo, String> {
    let probe: FfprobeOutput = serde_json::from_slice(json).map_err(|e| e.to_string())?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| "no video stream".to_string())?;
    let has_audio = probe.streams.iter().any(|s| s.codec_type == "audio");

    let duration = probe
        .format
        .duration
        .as_deref()
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(-1.0);
    if duration.is_nan() || duration <= 0.0 {
        return Err("invalid duration".to_string());
    }

    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(24.0);

    Ok(StreamInfo {
        duration,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
        codec: video.codec_name.clone().unwrap_or_default(),
        pixel_format: video.pix_fmt.clone().unwrap_or_default(),
        profile: video.profile.clone().unwrap_or_default(),
        level: video.level.and_then(|l| u32::try_from(l).ok()).filter(|l| *l > 0),
        has_audio,
    })
}

#[async_trait]
impl MediaInspector for FfmpegTool {
    async fn stream_info(&self, path: &Path) -> PipelineResult<StreamInfo> {
        if !path.exists() {
            return Err(PipelineError::missing_artifact(path, "file does not exist"));
        }

        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PipelineError::missing_artifact(path, format!("ffprobe failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PipelineError::missing_artifact(
                path,
                format!("ffprobe exited with {}: {}", output.status, stderr),
            ));
        }

        parse_stream_info(&output.stdout).map_err(|why| PipelineError::missing_artifact(path, why))
    }

    async fn extract_frame(
        &self,
        input: &Path,
        timestamp: f64,
        output: &Path,
    ) -> PipelineResult<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Seeking after -i is frame accurate; near the tail this matters more than speed.
        let args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-ss".to_string(),
            format!("{:.3}", timestamp),
            "-frames:v".to_string(),
            "1".to_string(),
            output.display().to_string(),
        ];
        run_cmd(&self.ffmpeg, &args).await.map_err(|e| {
            PipelineError::missing_artifact(input, format!("frame extraction failed: {e}"))
        })?;

        let written = tokio::fs::metadata(output)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !written {
            return Err(PipelineError::missing_artifact(
                input,
                format!("no frame produced at {:.3}s", timestamp),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EncodingTool for FfmpegTool {
    async fn encode(&self, invocation: &EncodeInvocation) -> PipelineResult<()> {
        if let Some(parent) = invocation.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        run_cmd(&self.ffmpeg, &invocation.to_args()).await?;

        if !invocation.output.exists() {
            return Err(PipelineError::encoding_tool(
                format!("encoder produced no file at {}", invocation.output.display()),
                None,
                Some(0),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720,
             "pix_fmt": "yuv444p", "profile": "High 4:4:4 Predictive", "level": 41,
             "avg_frame_rate": "24/1", "r_frame_rate": "24/1"},
            {"codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"duration": "8.000000"}
    }"#;

    #[test]
    fn test_parse_stream_info() {
        let info = parse_stream_info(PROBE_JSON.as_bytes()).unwrap();
        assert!((info.duration - 8.0).abs() < 1e-9);
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.pixel_format, "yuv444p");
        assert_eq!(info.level, Some(41));
        assert!(info.has_audio);
        assert!((info.fps - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_stream_info_unknown_level() {
        let json = r#"{"streams": [{"codec_type": "video", "level": -99}], "format": {"duration": "3.0"}}"#;
        assert_eq!(parse_stream_info(json.as_bytes()).unwrap().level, None);
    }

    #[test]
    fn test_parse_stream_info_without_video() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3.0"}}"#;
        assert!(parse_stream_info(json.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_stream_info_rejects_zero_duration() {
        let json = r#"{"streams": [{"codec_type": "video"}], "format": {"duration": "0.0"}}"#;
        assert!(parse_stream_info(json.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert!(parse_frame_rate("0/0").is_none());
        assert!((parse_frame_rate("25").unwrap() - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stream_info_missing_file() {
        let tool = FfmpegTool::new();
        let err = tool
            .stream_info(Path::new("/definitely/not/here.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    }
}
