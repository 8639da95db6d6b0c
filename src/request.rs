use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Image,
    Video,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Image => "image",
            GenerationKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Square => "1:1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Resolution {
    #[default]
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Hd720 => "720p",
            Resolution::Hd1080 => "1080p",
        }
    }
}

/// A still image on disk used to condition a generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameImage {
    pub path: PathBuf,
    /// Source timestamp in seconds, when extracted from a video.
    pub timestamp: Option<f64>,
}

impl FrameImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timestamp: None,
        }
    }

    pub fn at(path: impl Into<PathBuf>, timestamp: f64) -> Self {
        Self {
            path: path.into(),
            timestamp: Some(timestamp),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("webp") => "image/webp",
            _ => "image/png",
        }
    }
}

/// One submission to the generation service.
///
/// Requests are never mutated after construction; conditioning produces a
/// new request via [`GenerationRequest::conditioned_on`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    pub conditioning_image: Option<FrameImage>,
    pub duration_seconds: Option<f64>,
    pub aspect_ratio: AspectRatio,
    pub resolution: Resolution,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn image(prompt: impl Into<String>) -> Self {
        Self {
            kind: GenerationKind::Image,
            prompt: prompt.into(),
            conditioning_image: None,
            duration_seconds: None,
            aspect_ratio: AspectRatio::default(),
            resolution: Resolution::default(),
            negative_prompt: None,
            seed: None,
        }
    }

    pub fn video(prompt: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            kind: GenerationKind::Video,
            duration_seconds: Some(duration_seconds),
            ..Self::image(prompt)
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_negative_prompt(mut self, negative: Option<String>) -> Self {
        self.negative_prompt = negative.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Copy of this request conditioned on `frame`.
    pub fn conditioned_on(&self, frame: &FrameImage) -> Self {
        Self {
            conditioning_image: Some(frame.clone()),
            ..self.clone()
        }
    }

    pub fn conditioning_path(&self) -> Option<&Path> {
        self.conditioning_image.as_ref().map(|f| f.path.as_path())
    }

    /// Local validation done before anything is sent to the service.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(PipelineError::submission("prompt is empty"));
        }
        match (self.kind, self.duration_seconds) {
            (GenerationKind::Video, None) => {
                return Err(PipelineError::submission(
                    "video request requires duration_seconds",
                ));
            }
            (_, Some(d)) if !(d.is_finite() && d > 0.0) => {
                return Err(PipelineError::submission(format!(
                    "invalid duration_seconds: {d}"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.kind.as_str(),
            self.aspect_ratio.as_str(),
            self.resolution.as_str()
        )?;
        if let Some(d) = self.duration_seconds {
            write!(f, " {:.1}s", d)?;
        }
        if self.conditioning_image.is_some() {
            write!(f, " (conditioned)")?;
        }
        Ok(())
    }
}
