//! Boundary-frame extraction and continuity chaining.
//!
//! Segment `i + 1` is conditioned on the last frame of the latest ready
//! segment. Frames are only ever pulled from fully written, ready artifacts.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::chain::{Chain, ConditioningSource, FailurePolicy, Segment};
use crate::error::{PipelineError, PipelineResult};
use crate::media::MediaInspector;
use crate::poller::partial_path;
use crate::request::{FrameImage, GenerationRequest};

/// Distance from the measured end at which the last frame is sampled.
pub const LAST_FRAME_OFFSET_SECS: f64 = 0.1;

/// Timestamp for the last-frame sample of a clip lasting `duration` seconds.
///
/// Always strictly below `duration` for any positive duration.
pub fn last_frame_timestamp(duration: f64) -> f64 {
    (duration - LAST_FRAME_OFFSET_SECS).max(0.0)
}

/// A finished segment as produced by a [`SegmentGenerator`].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSegment {
    pub path: PathBuf,
    /// Measured duration in seconds.
    pub duration: f64,
}

/// Produces one durable, probed video segment per request.
#[async_trait]
pub trait SegmentGenerator: Send {
    async fn generate(
        &mut self,
        index: usize,
        request: &GenerationRequest,
    ) -> PipelineResult<GeneratedSegment>;

    /// Called once per segment after it resolved to ready or failed.
    async fn segment_resolved(&mut self, _segment: &Segment) {}
}

#[derive(Debug)]
pub struct ChainAbort {
    pub index: usize,
    pub error: PipelineError,
}

#[derive(Debug)]
pub struct ChainBuild {
    pub chain: Chain,
    /// Set when the chain stopped before every request was attempted.
    pub aborted: Option<ChainAbort>,
    /// Sum of ready segment durations, before transitions.
    pub achieved_duration: f64,
}

pub struct ContinuityManager {
    inspector: Arc<dyn MediaInspector>,
    frames_dir: PathBuf,
}

impl ContinuityManager {
    pub fn new(inspector: Arc<dyn MediaInspector>, frames_dir: impl Into<PathBuf>) -> Self {
        Self {
            inspector,
            frames_dir: frames_dir.into(),
        }
    }

    pub async fn extract_last_frame(&self, artifact: &Path) -> PipelineResult<FrameImage> {
        ensure_complete(artifact).await?;

        let duration = self.inspector.duration(artifact).await?;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(PipelineError::missing_artifact(
                artifact,
                format!("unusable duration {duration}"),
            ));
        }

        let timestamp = last_frame_timestamp(duration);
        let output = self.frame_path(artifact, "last");
        self.inspector
            .extract_frame(artifact, timestamp, &output)
            .await?;

        debug!(artifact = %artifact.display(), duration, timestamp, "Extracted last frame");
        Ok(FrameImage::at(output, timestamp))
    }

    pub async fn extract_first_frame(&self, artifact: &Path) -> PipelineResult<FrameImage> {
        ensure_complete(artifact).await?;

        let output = self.frame_path(artifact, "first");
        self.inspector.extract_frame(artifact, 0.0, &output).await?;
        Ok(FrameImage::at(output, 0.0))
    }

    fn frame_path(&self, artifact: &Path, which: &str) -> PathBuf {
        let stem = artifact
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("segment");
        self.frames_dir.join(format!("{stem}_{which}.png"))
    }

    /// Generate every request in order, threading boundary frames forward.
    ///
    /// `seed` conditions the first request and any request that follows
    /// only failed segments. Quota exhaustion and cancellation stop the
    /// chain under either policy.
    pub async fn build_chain(
        &self,
        seed: Option<FrameImage>,
        requests: &[GenerationRequest],
        generator: &mut dyn SegmentGenerator,
        policy: FailurePolicy,
    ) -> PipelineResult<ChainBuild> {
        let mut chain = Chain::new();
        let mut latest: Option<(FrameImage, ConditioningSource)> =
            seed.map(|frame| (frame, ConditioningSource::ReferenceImage));
        let mut aborted = None;

        for (index, base) in requests.iter().enumerate() {
            let mut segment = Segment::new(index, &base.prompt, base.duration_seconds.unwrap_or(0.0));

            let (request, source) = match &latest {
                Some((frame, source)) => (base.conditioned_on(frame), *source),
                None => (base.clone(), ConditioningSource::None),
            };
            segment.mark_generating(source);

            let failure = match generator.generate(index, &request).await {
                Ok(generated) => {
                    segment.mark_ready(generated.path.clone(), generated.duration);
                    if index + 1 < requests.len() {
                        match self.extract_last_frame(&generated.path).await {
                            Ok(frame) => {
                                segment.set_last_frame(frame.path.clone())?;
                                latest = Some((frame, ConditioningSource::Segment(index)));
                                None
                            }
                            Err(e) => {
                                segment.mark_failed(format!("last frame: {e}"));
                                Some(e)
                            }
                        }
                    } else {
                        None
                    }
                }
                Err(e) => {
                    segment.mark_failed(e.to_string());
                    Some(e)
                }
            };

            generator.segment_resolved(&segment).await;
            chain.push(segment)?;

            if let Some(error) = failure {
                if policy == FailurePolicy::AbortOnFirstFailure || error.is_chain_fatal() {
                    warn!(segment = index, "Chain stopped: {}", error);
                    aborted = Some(ChainAbort { index, error });
                    break;
                }
                warn!(segment = index, "Segment skipped, continuing from last good frame: {}", error);
            }
        }

        let achieved_duration = chain.total_ready_duration();
        info!(
            segments = chain.len(),
            ready = chain.ready().count(),
            achieved_duration,
            "Chain built"
        );
        Ok(ChainBuild {
            chain,
            aborted,
            achieved_duration,
        })
    }
}

/// Reject files that are absent, empty, or still being written.
async fn ensure_complete(path: &Path) -> PipelineResult<()> {
    if path.extension().and_then(|e| e.to_str()) == Some("part") {
        return Err(PipelineError::missing_artifact(path, "partial download"));
    }
    if fs::try_exists(partial_path(path)).await.unwrap_or(false) {
        return Err(PipelineError::missing_artifact(path, "still being written"));
    }
    let meta = fs::metadata(path)
        .await
        .map_err(|e| PipelineError::missing_artifact(path, e.to_string()))?;
    if meta.len() == 0 {
        return Err(PipelineError::missing_artifact(path, "file is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SegmentStatus;
    use crate::media::StreamInfo;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingInspector {
        durations: HashMap<PathBuf, f64>,
        extractions: Mutex<Vec<(PathBuf, f64)>>,
    }

    #[async_trait]
    impl MediaInspector for RecordingInspector {
        async fn stream_info(&self, path: &Path) -> PipelineResult<StreamInfo> {
            Ok(StreamInfo {
                duration: self.durations.get(path).copied().unwrap_or(8.0),
                width: 1280,
                height: 720,
                fps: 24.0,
                codec: "h264".to_string(),
                pixel_format: "yuv420p".to_string(),
                profile: "High".to_string(),
                level: Some(41),
                has_audio: true,
            })
        }

        async fn extract_frame(
            &self,
            input: &Path,
            timestamp: f64,
            output: &Path,
        ) -> PipelineResult<()> {
            self.extractions
                .lock()
                .unwrap()
                .push((input.to_path_buf(), timestamp));
            fs::create_dir_all(output.parent().unwrap()).await?;
            fs::write(output, b"png").await?;
            Ok(())
        }
    }

    /// Writes a segment file per request, failing the configured indices.
    struct FakeGenerator {
        dir: PathBuf,
        fail: Vec<usize>,
        quota_at: Option<usize>,
        seen: Vec<GenerationRequest>,
    }

    #[async_trait]
    impl SegmentGenerator for FakeGenerator {
        async fn generate(
            &mut self,
            index: usize,
            request: &GenerationRequest,
        ) -> PipelineResult<GeneratedSegment> {
            self.seen.push(request.clone());
            if self.quota_at == Some(index) {
                return Err(PipelineError::quota_exceeded("429"));
            }
            if self.fail.contains(&index) {
                return Err(PipelineError::RemoteFailed("blocked".to_string()));
            }
            let path = self.dir.join(format!("segment_{index:03}.mp4"));
            fs::write(&path, b"mp4").await?;
            Ok(GeneratedSegment {
                path,
                duration: 8.0,
            })
        }
    }

    fn requests(n: usize) -> Vec<GenerationRequest> {
        (0..n)
            .map(|i| GenerationRequest::video(format!("scene {i}"), 8.0))
            .collect()
    }

    fn generator(dir: &Path, fail: Vec<usize>) -> FakeGenerator {
        FakeGenerator {
            dir: dir.to_path_buf(),
            fail,
            quota_at: None,
            seen: Vec::new(),
        }
    }

    #[test]
    fn test_last_frame_timestamp_below_duration() {
        for d in [8.0, 7.958, 0.1, 0.05, 0.001] {
            let t = last_frame_timestamp(d);
            assert!(t < d, "t={t} d={d}");
            assert!(t >= 0.0);
        }
        assert!((last_frame_timestamp(8.0) - 7.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_extract_last_frame_samples_before_end() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("segment_000.mp4");
        fs::write(&clip, b"mp4").await.unwrap();

        let mut inspector = RecordingInspector::default();
        inspector.durations.insert(clip.clone(), 7.958);
        let inspector = Arc::new(inspector);
        let manager = ContinuityManager::new(inspector.clone(), dir.path().join("frames"));

        let frame = manager.extract_last_frame(&clip).await.unwrap();
        assert!(frame.path.ends_with("frames/segment_000_last.png"));
        let calls = inspector.extractions.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1 < 7.958);
    }

    #[tokio::test]
    async fn test_extract_first_frame_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("segment_001.mp4");
        fs::write(&clip, b"mp4").await.unwrap();
        let inspector = Arc::new(RecordingInspector::default());
        let manager = ContinuityManager::new(inspector.clone(), dir.path());

        let frame = manager.extract_first_frame(&clip).await.unwrap();
        assert_eq!(frame.timestamp, Some(0.0));
        assert!(frame.path.ends_with("segment_001_first.png"));
    }

    #[tokio::test]
    async fn test_refuses_missing_empty_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = Arc::new(RecordingInspector::default());
        let manager = ContinuityManager::new(inspector.clone(), dir.path());

        let missing = dir.path().join("absent.mp4");
        let empty = dir.path().join("empty.mp4");
        fs::write(&empty, b"").await.unwrap();
        let in_flight = dir.path().join("seg.mp4");
        fs::write(&in_flight, b"mp4").await.unwrap();
        fs::write(partial_path(&in_flight), b"more").await.unwrap();
        let part = dir.path().join("seg2.mp4.part");
        fs::write(&part, b"mp4").await.unwrap();

        for path in [&missing, &empty, &in_flight, &part] {
            let err = manager.extract_last_frame(path).await.unwrap_err();
            assert!(matches!(err, PipelineError::MissingArtifact { .. }), "{path:?}");
        }
        assert!(inspector.extractions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chain_conditions_each_segment_on_previous() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = Arc::new(RecordingInspector::default());
        let manager = ContinuityManager::new(inspector.clone(), dir.path().join("frames"));
        let mut generator = generator(dir.path(), vec![]);

        let build = manager
            .build_chain(
                Some(FrameImage::new(dir.path().join("reference.png"))),
                &requests(3),
                &mut generator,
                FailurePolicy::AbortOnFirstFailure,
            )
            .await
            .unwrap();

        assert!(build.aborted.is_none());
        assert_eq!(build.chain.ready().count(), 3);
        assert!((build.achieved_duration - 24.0).abs() < 1e-9);

        let segs = build.chain.segments();
        assert_eq!(segs[0].conditioned_on, ConditioningSource::ReferenceImage);
        assert_eq!(segs[1].conditioned_on, ConditioningSource::Segment(0));
        assert_eq!(segs[2].conditioned_on, ConditioningSource::Segment(1));
        assert!(generator.seen[2]
            .conditioning_path()
            .unwrap()
            .ends_with("segment_001_last.png"));
        // The final segment has no successor to condition.
        assert_eq!(inspector.extractions.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_best_effort_skips_failed_segment() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = Arc::new(RecordingInspector::default());
        let manager = ContinuityManager::new(inspector.clone(), dir.path().join("frames"));
        let mut generator = generator(dir.path(), vec![2]);

        let build = manager
            .build_chain(None, &requests(4), &mut generator, FailurePolicy::BestEffort)
            .await
            .unwrap();

        assert!(build.aborted.is_none());
        let segs = build.chain.segments();
        assert_eq!(segs[2].status, SegmentStatus::Failed);
        assert!(segs[2].last_frame_path.is_none());
        assert_eq!(segs[3].conditioned_on, ConditioningSource::Segment(1));
        assert!(generator.seen[3]
            .conditioning_path()
            .unwrap()
            .ends_with("segment_001_last.png"));

        let failed_clip = dir.path().join("segment_002.mp4");
        assert!(inspector
            .extractions
            .lock()
            .unwrap()
            .iter()
            .all(|(input, _)| input != &failed_clip));
    }

    #[tokio::test]
    async fn test_abort_policy_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ContinuityManager::new(Arc::new(RecordingInspector::default()), dir.path());
        let mut generator = generator(dir.path(), vec![1]);

        let build = manager
            .build_chain(
                None,
                &requests(4),
                &mut generator,
                FailurePolicy::AbortOnFirstFailure,
            )
            .await
            .unwrap();

        assert_eq!(build.chain.len(), 2);
        assert_eq!(build.aborted.as_ref().map(|a| a.index), Some(1));
        assert_eq!(generator.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_quota_stops_best_effort_chain() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ContinuityManager::new(Arc::new(RecordingInspector::default()), dir.path());
        let mut generator = generator(dir.path(), vec![]);
        generator.quota_at = Some(1);

        let build = manager
            .build_chain(None, &requests(3), &mut generator, FailurePolicy::BestEffort)
            .await
            .unwrap();

        let abort = build.aborted.unwrap();
        assert_eq!(abort.index, 1);
        assert!(abort.error.is_quota());
        assert_eq!(generator.seen.len(), 2);
    }
}
