use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    #[default]
    Pending,
    Generating,
    Ready,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Generating => "generating",
            SegmentStatus::Ready => "ready",
            SegmentStatus::Failed => "failed",
        }
    }
}

/// What happens to the rest of a job when one segment fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// The job fails immediately and nothing is stitched.
    #[default]
    AbortOnFirstFailure,
    /// The failed segment is recorded and the chain continues from the last good frame.
    BestEffort,
}

/// Where a segment's conditioning frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "segment")]
pub enum ConditioningSource {
    ReferenceImage,
    Segment(usize),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub scenario: String,
    pub artifact_path: Option<PathBuf>,
    /// Measured duration in seconds; nominal until the artifact is probed.
    pub duration: f64,
    pub status: SegmentStatus,
    pub last_frame_path: Option<PathBuf>,
    pub conditioned_on: ConditioningSource,
    pub failure_reason: Option<String>,
}

impl Segment {
    pub fn new(index: usize, scenario: impl Into<String>, nominal_duration: f64) -> Self {
        Self {
            index,
            scenario: scenario.into(),
            artifact_path: None,
            duration: nominal_duration,
            status: SegmentStatus::Pending,
            last_frame_path: None,
            conditioned_on: ConditioningSource::None,
            failure_reason: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == SegmentStatus::Ready
    }

    pub fn mark_generating(&mut self, conditioned_on: ConditioningSource) {
        self.status = SegmentStatus::Generating;
        self.conditioned_on = conditioned_on;
    }

    pub fn mark_ready(&mut self, artifact_path: PathBuf, duration: f64) {
        self.artifact_path = Some(artifact_path);
        self.duration = duration;
        self.status = SegmentStatus::Ready;
        self.failure_reason = None;
    }

    /// Last frame may only be attached to a ready segment.
    pub fn set_last_frame(&mut self, path: PathBuf) -> PipelineResult<()> {
        if !self.is_ready() {
            return Err(PipelineError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: "last_frame".to_string(),
            });
        }
        self.last_frame_path = Some(path);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = SegmentStatus::Failed;
        self.last_frame_path = None;
        self.failure_reason = Some(reason.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    segments: Vec<Segment>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment. Indices must be strictly increasing.
    pub fn push(&mut self, segment: Segment) -> PipelineResult<()> {
        if let Some(last) = self.segments.last() {
            if segment.index <= last.index {
                return Err(PipelineError::InvalidTransition {
                    from: format!("segment {}", last.index),
                    to: format!("segment {}", segment.index),
                });
            }
        }
        self.segments.push(segment);
        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut()
    }

    /// Mutable view; the slice cannot grow or reorder.
    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn ready(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_ready())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
    }

    /// Sum of ready segment durations, before transitions.
    pub fn total_ready_duration(&self) -> f64 {
        self.ready().map(|s| s.duration).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Gaps in the ready sequence left by failed segments.
    pub fn discontinuities(&self) -> Vec<Discontinuity> {
        let mut gaps = Vec::new();
        let mut previous: Option<usize> = None;
        let mut skipped = Vec::new();

        for segment in &self.segments {
            if segment.is_ready() {
                if !skipped.is_empty() {
                    gaps.push(Discontinuity {
                        after: previous,
                        before: Some(segment.index),
                        skipped: std::mem::take(&mut skipped),
                    });
                }
                previous = Some(segment.index);
            } else if segment.status == SegmentStatus::Failed {
                skipped.push(segment.index);
            }
        }
        if !skipped.is_empty() {
            gaps.push(Discontinuity {
                after: previous,
                before: None,
                skipped,
            });
        }
        gaps
    }
}

/// A visible jump in the stitched output where failed segments were dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discontinuity {
    /// Last ready segment before the gap.
    pub after: Option<usize>,
    /// First ready segment after the gap.
    pub before: Option<usize>,
    pub skipped: Vec<usize>,
}
