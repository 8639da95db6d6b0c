use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chain::{Chain, ConditioningSource, Discontinuity, SegmentStatus};
use crate::cost::CostLedger;
use crate::encoding::EncodingProfile;
use crate::state::{JobState, Stage};
use crate::stitch::{SkippedSegment, TransitionSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub index: usize,
    pub status: SegmentStatus,
    /// Present in the stitched output.
    pub included: bool,
    pub conditioned_on: ConditioningSource,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    /// Error kind, e.g. `quota_exceeded`.
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub reference_image: Option<PathBuf>,
    pub chain: Chain,
    pub transition: TransitionSpec,
    pub profile: EncodingProfile,
    pub costs: CostLedger,
    #[serde(default)]
    pub stage_timings: Vec<StageTiming>,
    #[serde(default)]
    pub total_elapsed_ms: u64,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub achieved_duration: Option<f64>,
    #[serde(default)]
    pub segment_outcomes: Vec<SegmentOutcome>,
    #[serde(default)]
    pub skipped: Vec<SkippedSegment>,
    #[serde(default)]
    pub discontinuities: Vec<Discontinuity>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
}

impl JobManifest {
    pub fn new(job_id: impl Into<String>, transition: TransitionSpec, profile: EncodingProfile) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            created_at: now,
            updated_at: now,
            state: JobState::Created,
            seed: None,
            reference_image: None,
            chain: Chain::new(),
            transition,
            profile,
            costs: CostLedger::default(),
            stage_timings: Vec::new(),
            total_elapsed_ms: 0,
            output_path: None,
            achieved_duration: None,
            segment_outcomes: Vec::new(),
            skipped: Vec::new(),
            discontinuities: Vec::new(),
            failure: None,
        }
    }

    pub fn record_timing(&mut self, stage: Stage, elapsed_ms: u64) {
        match self.stage_timings.iter_mut().find(|t| t.stage == stage) {
            Some(timing) => timing.elapsed_ms += elapsed_ms,
            None => self.stage_timings.push(StageTiming { stage, elapsed_ms }),
        }
    }

    pub fn timing(&self, stage: Stage) -> Option<u64> {
        self.stage_timings
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.elapsed_ms)
    }

    /// Rebuild per-segment outcomes from the chain and the stitched set.
    pub fn refresh_outcomes(&mut self, included: &[usize]) {
        self.segment_outcomes = self
            .chain
            .segments()
            .iter()
            .map(|s| SegmentOutcome {
                index: s.index,
                status: s.status,
                included: included.contains(&s.index),
                conditioned_on: s.conditioned_on,
                duration: s.duration,
                reason: s.failure_reason.clone(),
            })
            .collect();
        self.discontinuities = self.chain.discontinuities();
    }

    /// Copy with every path made relative to `base` where possible.
    pub fn relative_to(&self, base: &Path) -> Self {
        let rel = |p: &Path| pathdiff::diff_paths(p, base).unwrap_or_else(|| p.to_path_buf());

        let mut copy = self.clone();
        copy.reference_image = self.reference_image.as_deref().map(rel);
        copy.output_path = self.output_path.as_deref().map(rel);
        for segment in copy.chain.segments_mut() {
            segment.artifact_path = segment.artifact_path.as_deref().map(rel);
            segment.last_frame_path = segment.last_frame_path.as_deref().map(rel);
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Segment;

    fn manifest_with_chain() -> JobManifest {
        let mut m = JobManifest::new("job-1", TransitionSpec::default(), EncodingProfile::default());
        for i in 0..3 {
            let mut seg = Segment::new(i, format!("s{i}"), 8.0);
            if i == 1 {
                seg.mark_failed("blocked");
            } else {
                seg.mark_ready(PathBuf::from(format!("/jobs/job-1/segments/segment_{i:03}.mp4")), 8.0);
            }
            m.chain.push(seg).unwrap();
        }
        m
    }

    #[test]
    fn test_outcomes_and_discontinuities() {
        let mut m = manifest_with_chain();
        m.refresh_outcomes(&[0, 2]);
        assert_eq!(m.segment_outcomes.len(), 3);
        assert!(!m.segment_outcomes[1].included);
        assert_eq!(m.segment_outcomes[1].reason.as_deref(), Some("blocked"));
        assert_eq!(m.discontinuities.len(), 1);
        assert_eq!(m.discontinuities[0].skipped, vec![1]);
    }

    #[test]
    fn test_relative_paths() {
        let mut m = manifest_with_chain();
        m.output_path = Some(PathBuf::from("/jobs/job-1/output/stitched.mp4"));
        let rel = m.relative_to(Path::new("/jobs/job-1"));
        assert_eq!(rel.output_path, Some(PathBuf::from("output/stitched.mp4")));
        assert_eq!(
            rel.chain.segments()[0].artifact_path,
            Some(PathBuf::from("segments/segment_000.mp4"))
        );
    }

    #[test]
    fn test_timings_accumulate_per_stage() {
        let mut m = JobManifest::new("j", TransitionSpec::default(), EncodingProfile::default());
        m.record_timing(Stage::Segments, 100);
        m.record_timing(Stage::Segments, 50);
        m.record_timing(Stage::Stitching, 10);
        assert_eq!(m.timing(Stage::Segments), Some(150));
        assert_eq!(m.stage_timings.len(), 2);
    }

    #[test]
    fn test_json_round_trip_keeps_state() {
        let mut m = manifest_with_chain();
        m.state.fail("boom").unwrap();
        let json = serde_json::to_string_pretty(&m).unwrap();
        let back: JobManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, m.state);
        assert_eq!(back.chain.len(), 3);
    }
}
