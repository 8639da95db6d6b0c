//! Optional post-stitch pass: lanczos upscale plus light sharpening,
//! re-encoded under the same compatibility baseline as the stitch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::encoding::EncodingProfile;
use crate::error::{PipelineError, PipelineResult};
use crate::media::{EncodeInvocation, EncodingTool, MediaInspector};

const UNSHARP: &str = "unsharp=5:5:0.6:5:5:0.0";

pub fn enhance_filter(target_height: u32) -> String {
    // Width -2 keeps the aspect ratio and an even pixel count for 4:2:0.
    format!("[0:v]scale=-2:{target_height}:flags=lanczos,{UNSHARP},setsar=1,format=yuv420p[vout]")
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnhanceOutcome {
    pub output_path: PathBuf,
    pub height: u32,
    pub duration: f64,
}

pub struct EnhancementPass {
    tool: Arc<dyn EncodingTool>,
    inspector: Arc<dyn MediaInspector>,
}

impl EnhancementPass {
    pub fn new(tool: Arc<dyn EncodingTool>, inspector: Arc<dyn MediaInspector>) -> Self {
        Self { tool, inspector }
    }

    pub async fn enhance(
        &self,
        input: &Path,
        output: &Path,
        target_height: u32,
        profile: &EncodingProfile,
    ) -> PipelineResult<EnhanceOutcome> {
        let profile = profile.clone().enforce_baseline();
        let invocation = EncodeInvocation {
            inputs: vec![input.to_path_buf()],
            filter_graph: enhance_filter(target_height),
            maps: vec!["[vout]".to_string(), "0:a?".to_string()],
            profile: profile.clone(),
            output: output.to_path_buf(),
        };
        self.tool.encode(&invocation).await?;

        let produced = self.inspector.stream_info(output).await.map_err(|e| {
            PipelineError::encoding_tool(format!("enhanced output unreadable: {e}"), None, None)
        })?;
        if !profile.matches_stream(&produced) {
            return Err(PipelineError::encoding_tool(
                format!("enhanced output is {}", profile.describe_mismatch(&produced)),
                None,
                None,
            ));
        }

        info!(height = produced.height, "Enhanced {}", output.display());
        Ok(EnhanceOutcome {
            output_path: output.to_path_buf(),
            height: produced.height,
            duration: produced.duration,
        })
    }
}
