use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, PipelineResult};

/// Coarse stage a job was in, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    ReferenceImage,
    Segments,
    Stitching,
    Enhancing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::ReferenceImage => "reference_image",
            Stage::Segments => "segments",
            Stage::Stitching => "stitching",
            Stage::Enhancing => "enhancing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    Created,
    ImageGenerating,
    ImageReady,
    SegmentsGenerating { current: usize, total: usize },
    SegmentsReady,
    Stitching,
    Enhancing,
    Complete,
    Failed { stage: Stage, reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed { .. })
    }

    /// Stage a failure in this state is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            JobState::Created => Stage::Setup,
            JobState::ImageGenerating | JobState::ImageReady => Stage::ReferenceImage,
            JobState::SegmentsGenerating { .. } | JobState::SegmentsReady => Stage::Segments,
            JobState::Stitching => Stage::Stitching,
            JobState::Enhancing | JobState::Complete => Stage::Enhancing,
            JobState::Failed { stage, .. } => *stage,
        }
    }

    fn can_advance_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (s, Failed { .. }) => !s.is_terminal(),
            (Created, ImageGenerating) => true,
            (ImageGenerating, ImageReady) => true,
            (ImageReady, SegmentsGenerating { current: 0, total }) => *total > 0,
            (
                SegmentsGenerating { current, total },
                SegmentsGenerating {
                    current: next,
                    total: next_total,
                },
            ) => total == next_total && *next == current + 1 && next < total,
            (SegmentsGenerating { .. }, SegmentsReady) => true,
            (SegmentsReady, Stitching) => true,
            (Stitching, Enhancing) | (Stitching, Complete) => true,
            (Enhancing, Complete) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting anything the state machine does not allow.
    pub fn advance(&mut self, next: JobState) -> PipelineResult<()> {
        if !self.can_advance_to(&next) {
            return Err(PipelineError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Fail from the current stage.
    pub fn fail(&mut self, reason: impl Into<String>) -> PipelineResult<()> {
        let stage = self.stage();
        self.advance(JobState::Failed {
            stage,
            reason: reason.into(),
        })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => f.write_str("created"),
            JobState::ImageGenerating => f.write_str("image_generating"),
            JobState::ImageReady => f.write_str("image_ready"),
            JobState::SegmentsGenerating { current, total } => {
                write!(f, "segments_generating({} of {})", current + 1, total)
            }
            JobState::SegmentsReady => f.write_str("segments_ready"),
            JobState::Stitching => f.write_str("stitching"),
            JobState::Enhancing => f.write_str("enhancing"),
            JobState::Complete => f.write_str("complete"),
            JobState::Failed { stage, reason } => write!(f, "failed({stage}: {reason})"),
        }
    }
}
