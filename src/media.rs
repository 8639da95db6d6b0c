//! Media capabilities the pipeline depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoding::EncodingProfile;
use crate::error::PipelineResult;

/// Subset of ffprobe output the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub pixel_format: String,
    pub profile: String,
    /// ffprobe's integer level, e.g. 41 for 4.1.
    #[serde(default)]
    pub level: Option<u32>,
    pub has_audio: bool,
}

#[async_trait]
pub trait MediaInspector: Send + Sync {
    async fn stream_info(&self, path: &Path) -> PipelineResult<StreamInfo>;

    async fn duration(&self, path: &Path) -> PipelineResult<f64> {
        Ok(self.stream_info(path).await?.duration)
    }

    /// Write the frame at `timestamp` seconds of `input` to `output`.
    async fn extract_frame(&self, input: &Path, timestamp: f64, output: &Path)
    -> PipelineResult<()>;
}

/// One encoder run: ordered inputs through a filter graph into one output.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeInvocation {
    pub inputs: Vec<PathBuf>,
    pub filter_graph: String,
    /// Output pads to map, e.g. `[vout]`, `[aout]`.
    pub maps: Vec<String>,
    pub profile: EncodingProfile,
    pub output: PathBuf,
}

impl EncodeInvocation {
    /// Arguments for an ffmpeg-compatible command line, without the program name.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];
        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.display().to_string());
        }
        if !self.filter_graph.is_empty() {
            args.push("-filter_complex".to_string());
            args.push(self.filter_graph.clone());
        }
        for map in &self.maps {
            args.push("-map".to_string());
            args.push(map.clone());
        }
        args.extend(self.profile.to_ffmpeg_args());
        args.push(self.output.display().to_string());
        args
    }
}

#[async_trait]
pub trait EncodingTool: Send + Sync {
    /// Run the encoder. A non-zero exit is `PipelineError::EncodingTool`.
    async fn encode(&self, invocation: &EncodeInvocation) -> PipelineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_args_order() {
        let inv = EncodeInvocation {
            inputs: vec![PathBuf::from("a.mp4"), PathBuf::from("b.mp4")],
            filter_graph: "[0:v][1:v]xfade=transition=fade:duration=0.500:offset=7.500[vout]"
                .to_string(),
            maps: vec!["[vout]".to_string()],
            profile: EncodingProfile::default(),
            output: PathBuf::from("out.mp4"),
        };
        let args = inv.to_args();

        let first_input = args.iter().position(|a| a == "a.mp4").unwrap();
        let second_input = args.iter().position(|a| a == "b.mp4").unwrap();
        let filter = args.iter().position(|a| a == "-filter_complex").unwrap();
        assert!(first_input < second_input);
        assert!(second_input < filter);
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
        assert!(args.contains(&"yuv420p".to_string()));
    }
}
