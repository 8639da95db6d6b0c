//! Stitches ready segments into one output with per-boundary transitions.
//!
//! Transitions are folded pairwise: segment `i` is merged into the running
//! result before segment `i + 1` is considered, so the filter graph grows
//! linearly with the chain. Video and audio share each boundary's duration
//! and offset.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{Chain, SegmentStatus};
use crate::encoding::{AUDIO_SAMPLE_RATE, EncodingProfile};
use crate::error::{PipelineError, PipelineResult};
use crate::media::{EncodeInvocation, EncodingTool, MediaInspector};

const FALLBACK_WIDTH: u32 = 1280;
const FALLBACK_HEIGHT: u32 = 720;
const FALLBACK_FPS: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    #[serde(alias = "hard-cut", alias = "cut")]
    HardCut,
    Dissolve,
    #[default]
    Fade,
    Wipe,
}

impl TransitionKind {
    /// Name of the matching ffmpeg `xfade` transition.
    pub fn xfade_name(&self) -> Option<&'static str> {
        match self {
            TransitionKind::HardCut => None,
            TransitionKind::Dissolve => Some("dissolve"),
            TransitionKind::Fade => Some("fade"),
            TransitionKind::Wipe => Some("wipeleft"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    #[serde(default)]
    pub kind: TransitionKind,
    /// Seconds. Ignored for hard cuts.
    #[serde(default = "default_transition_duration")]
    pub duration: f64,
}

fn default_transition_duration() -> f64 {
    0.5
}

impl Default for TransitionSpec {
    fn default() -> Self {
        Self {
            kind: TransitionKind::Fade,
            duration: default_transition_duration(),
        }
    }
}

impl TransitionSpec {
    pub fn new(kind: TransitionKind, duration: f64) -> Self {
        Self { kind, duration }
    }

    pub fn hard_cut() -> Self {
        Self::new(TransitionKind::HardCut, 0.0)
    }

    /// Duration actually used between two clips: never more than half the shorter one.
    pub fn effective_duration(&self, left: f64, right: f64) -> f64 {
        if self.kind == TransitionKind::HardCut || self.duration.is_nan() || self.duration <= 0.0 {
            return 0.0;
        }
        self.duration.min(left.min(right) / 2.0).max(0.0)
    }
}

/// One probed input to the stitch.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchInput {
    pub index: usize,
    pub path: PathBuf,
    pub duration: f64,
    pub has_audio: bool,
}

/// Target canvas every input is normalized to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub after: usize,
    pub before: usize,
    /// Shared by the video transition and the audio crossfade.
    pub duration: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StitchPlan {
    pub filter_graph: String,
    pub video_label: String,
    pub audio_label: String,
    pub boundaries: Vec<Boundary>,
    pub achieved_duration: f64,
}

/// Build the filter graph for `inputs`, in order.
///
/// Pure: the same inputs and transition always produce the same plan.
/// Inputs whose chain indices are not consecutive meet with a hard cut.
pub fn plan_stitch(inputs: &[StitchInput], transition: &TransitionSpec, canvas: Canvas) -> StitchPlan {
    let mut chains: Vec<String> = Vec::with_capacity(inputs.len() * 3);

    for (i, input) in inputs.iter().enumerate() {
        chains.push(format!(
            "[{i}:v]fps={fps},scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,format=yuv420p,\
             trim=duration={d:.3},setpts=PTS-STARTPTS[v{i}]",
            fps = format_fps(canvas.fps),
            w = canvas.width,
            h = canvas.height,
            d = input.duration,
        ));
        if input.has_audio {
            chains.push(format!(
                "[{i}:a]aresample={rate},aformat=sample_fmts=fltp:channel_layouts=stereo,\
                 apad,atrim=duration={d:.3},asetpts=PTS-STARTPTS[a{i}]",
                rate = AUDIO_SAMPLE_RATE,
                d = input.duration,
            ));
        } else {
            chains.push(format!(
                "anullsrc=r={rate}:cl=stereo,aformat=sample_fmts=fltp,\
                 atrim=duration={d:.3},asetpts=PTS-STARTPTS[a{i}]",
                rate = AUDIO_SAMPLE_RATE,
                d = input.duration,
            ));
        }
    }

    let mut boundaries = Vec::new();
    let mut video = "v0".to_string();
    let mut audio = "a0".to_string();
    let mut accumulated = inputs.first().map(|s| s.duration).unwrap_or(0.0);

    for (i, pair) in inputs.windows(2).enumerate() {
        let (left, right) = (&pair[0], &pair[1]);
        let n = i + 1;
        let t = if right.index == left.index + 1 {
            transition.effective_duration(left.duration, right.duration)
        } else {
            0.0
        };
        let next_video = format!("vx{n}");
        let next_audio = format!("ax{n}");

        match transition.kind.xfade_name() {
            Some(name) if t > 0.0 => {
                let offset = (accumulated - t).max(0.0);
                chains.push(format!(
                    "[{video}][v{n}]xfade=transition={name}:duration={t:.3}:offset={offset:.3}[{next_video}]"
                ));
                chains.push(format!(
                    "[{audio}][a{n}]acrossfade=d={t:.3}:c1=tri:c2=tri[{next_audio}]"
                ));
                boundaries.push(Boundary {
                    after: left.index,
                    before: right.index,
                    duration: t,
                    offset,
                });
                accumulated += right.duration - t;
            }
            _ => {
                chains.push(format!(
                    "[{video}][{audio}][v{n}][a{n}]concat=n=2:v=1:a=1[{next_video}][{next_audio}]"
                ));
                boundaries.push(Boundary {
                    after: left.index,
                    before: right.index,
                    duration: 0.0,
                    offset: accumulated,
                });
                accumulated += right.duration;
            }
        }
        video = next_video;
        audio = next_audio;
    }

    StitchPlan {
        filter_graph: chains.join(";"),
        video_label: format!("[{video}]"),
        audio_label: format!("[{audio}]"),
        boundaries,
        achieved_duration: accumulated,
    }
}

fn format_fps(fps: f64) -> String {
    if (fps - fps.round()).abs() < 1e-6 {
        format!("{}", fps.round() as u64)
    } else {
        format!("{fps:.3}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSegment {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchOutcome {
    pub output_path: PathBuf,
    pub achieved_duration: f64,
    pub included: Vec<usize>,
    pub skipped: Vec<SkippedSegment>,
    pub boundaries: Vec<Boundary>,
    pub profile: EncodingProfile,
}

pub struct StitchingEngine {
    tool: Arc<dyn EncodingTool>,
    inspector: Arc<dyn MediaInspector>,
}

impl StitchingEngine {
    pub fn new(tool: Arc<dyn EncodingTool>, inspector: Arc<dyn MediaInspector>) -> Self {
        Self { tool, inspector }
    }

    /// Stitch the ready segments of `chain` into `output`.
    ///
    /// The output is always encoded under the compatibility baseline; only
    /// CRF and preset are taken from `profile`.
    pub async fn stitch(
        &self,
        chain: &Chain,
        transition: &TransitionSpec,
        profile: &EncodingProfile,
        output: &Path,
    ) -> PipelineResult<StitchOutcome> {
        let mut ready = Vec::new();
        let mut skipped = Vec::new();
        for segment in chain.segments() {
            match (&segment.status, &segment.artifact_path) {
                (SegmentStatus::Ready, Some(path)) => ready.push((segment.index, path.clone(), segment.duration)),
                (status, _) => skipped.push(SkippedSegment {
                    index: segment.index,
                    reason: segment
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("segment {}", status.as_str())),
                }),
            }
        }
        if ready.is_empty() {
            return Err(PipelineError::NothingToStitch);
        }

        let mut inputs = Vec::with_capacity(ready.len());
        let mut canvas = None;
        for (index, path, duration) in ready {
            let info = self.inspector.stream_info(&path).await?;
            if canvas.is_none() {
                canvas = Some(Canvas {
                    width: if info.width > 0 { info.width } else { FALLBACK_WIDTH },
                    height: if info.height > 0 { info.height } else { FALLBACK_HEIGHT },
                    fps: if info.fps > 0.0 { info.fps } else { FALLBACK_FPS },
                });
            }
            inputs.push(StitchInput {
                index,
                path,
                duration,
                has_audio: info.has_audio,
            });
        }
        let canvas = canvas.unwrap_or(Canvas {
            width: FALLBACK_WIDTH,
            height: FALLBACK_HEIGHT,
            fps: FALLBACK_FPS,
        });

        let plan = plan_stitch(&inputs, transition, canvas);
        let profile = profile.clone().enforce_baseline();
        debug!(filter = %plan.filter_graph, "Stitch filter graph");

        let invocation = EncodeInvocation {
            inputs: inputs.iter().map(|i| i.path.clone()).collect(),
            filter_graph: plan.filter_graph.clone(),
            maps: vec![plan.video_label.clone(), plan.audio_label.clone()],
            profile: profile.clone(),
            output: output.to_path_buf(),
        };
        self.tool.encode(&invocation).await?;

        let produced = self.inspector.stream_info(output).await.map_err(|e| {
            PipelineError::encoding_tool(format!("stitched output unreadable: {e}"), None, None)
        })?;
        if !profile.matches_stream(&produced) {
            return Err(PipelineError::encoding_tool(
                format!("stitched output is {}", profile.describe_mismatch(&produced)),
                None,
                None,
            ));
        }
        if (produced.duration - plan.achieved_duration).abs() > 0.25 {
            warn!(
                expected = plan.achieved_duration,
                measured = produced.duration,
                "Stitched duration differs from plan"
            );
        }

        let included: Vec<usize> = inputs.iter().map(|i| i.index).collect();
        info!(
            included = included.len(),
            skipped = skipped.len(),
            achieved_duration = plan.achieved_duration,
            "Stitched {}",
            output.display()
        );

        Ok(StitchOutcome {
            output_path: output.to_path_buf(),
            achieved_duration: plan.achieved_duration,
            included,
            skipped,
            boundaries: plan.boundaries,
            profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Segment;
    use crate::media::StreamInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const CANVAS: Canvas = Canvas {
        width: 1280,
        height: 720,
        fps: 24.0,
    };

    fn inputs(durations: &[f64]) -> Vec<StitchInput> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| StitchInput {
                index: i,
                path: PathBuf::from(format!("segment_{i:03}.mp4")),
                duration: *d,
                has_audio: true,
            })
            .collect()
    }

    #[test]
    fn test_three_segments_with_fade() {
        let plan = plan_stitch(&inputs(&[8.0, 8.0, 8.0]), &TransitionSpec::default(), CANVAS);

        assert!((plan.achieved_duration - 23.0).abs() < 1e-9);
        assert_eq!(plan.filter_graph.matches("xfade=").count(), 2);
        assert_eq!(plan.filter_graph.matches("acrossfade=").count(), 2);
        assert!(plan.filter_graph.contains("offset=7.500"));
        assert!(plan.filter_graph.contains("offset=15.000"));
        assert_eq!(plan.video_label, "[vx2]");
        assert_eq!(plan.audio_label, "[ax2]");
    }

    #[test]
    fn test_uniform_chain_duration() {
        for n in 1..6usize {
            let plan = plan_stitch(
                &inputs(&vec![6.0; n]),
                &TransitionSpec::new(TransitionKind::Dissolve, 0.75),
                CANVAS,
            );
            let expected = n as f64 * 6.0 - (n as f64 - 1.0) * 0.75;
            assert!((plan.achieved_duration - expected).abs() < 1e-9, "n={n}");
        }
    }

    #[test]
    fn test_video_and_audio_share_boundary_duration() {
        let plan = plan_stitch(
            &inputs(&[8.0, 8.0]),
            &TransitionSpec::new(TransitionKind::Wipe, 0.4),
            CANVAS,
        );
        assert!(plan.filter_graph.contains("xfade=transition=wipeleft:duration=0.400"));
        assert!(plan.filter_graph.contains("acrossfade=d=0.400"));
        assert_eq!(plan.boundaries.len(), 1);
        assert!((plan.boundaries[0].offset - 7.6).abs() < 1e-9);
    }

    #[test]
    fn test_hard_cut_uses_concat() {
        let plan = plan_stitch(&inputs(&[8.0, 8.0, 8.0]), &TransitionSpec::hard_cut(), CANVAS);
        assert!(!plan.filter_graph.contains("xfade"));
        assert_eq!(plan.filter_graph.matches("concat=n=2").count(), 2);
        assert!((plan.achieved_duration - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_transition_clamped_to_half_shorter_clip() {
        let spec = TransitionSpec::new(TransitionKind::Fade, 2.0);
        assert!((spec.effective_duration(8.0, 1.0) - 0.5).abs() < 1e-9);
        let plan = plan_stitch(&inputs(&[8.0, 1.0]), &spec, CANVAS);
        assert!((plan.achieved_duration - 8.5).abs() < 1e-9);
    }

    #[test]
    fn test_gap_in_chain_is_a_hard_cut() {
        let mut ins = inputs(&[8.0, 8.0, 8.0]);
        ins[2].index = 3;
        let plan = plan_stitch(&ins, &TransitionSpec::default(), CANVAS);

        assert!((plan.achieved_duration - 23.5).abs() < 1e-9);
        assert_eq!(plan.filter_graph.matches("xfade=").count(), 1);
        assert_eq!(plan.filter_graph.matches("concat=n=2").count(), 1);
        assert_eq!(plan.boundaries[1].after, 1);
        assert_eq!(plan.boundaries[1].before, 3);
        assert_eq!(plan.boundaries[1].duration, 0.0);
        assert!((plan.boundaries[1].offset - 15.5).abs() < 1e-9);
    }

    #[test]
    fn test_silent_track_for_input_without_audio() {
        let mut ins = inputs(&[8.0, 8.0]);
        ins[1].has_audio = false;
        let plan = plan_stitch(&ins, &TransitionSpec::default(), CANVAS);
        assert!(plan.filter_graph.contains("anullsrc=r=44100:cl=stereo"));
        assert!(!plan.filter_graph.contains("[1:a]"));
    }

    #[test]
    fn test_transition_spec_serde() {
        let spec: TransitionSpec = serde_json::from_str(r#"{"kind": "hard-cut"}"#).unwrap();
        assert_eq!(spec.kind, TransitionKind::HardCut);
        let spec: TransitionSpec = serde_json::from_str(r#"{"kind": "wipe", "duration": 1.0}"#).unwrap();
        assert_eq!(spec, TransitionSpec::new(TransitionKind::Wipe, 1.0));
    }

    struct FakeMedia {
        output_pixel_format: String,
        output_level: Option<u32>,
        invocations: Mutex<Vec<EncodeInvocation>>,
    }

    impl FakeMedia {
        fn new(output_pixel_format: &str) -> Arc<Self> {
            Self::with_level(output_pixel_format, Some(41))
        }

        fn with_level(output_pixel_format: &str, output_level: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                output_pixel_format: output_pixel_format.to_string(),
                output_level,
                invocations: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MediaInspector for FakeMedia {
        async fn stream_info(&self, path: &Path) -> PipelineResult<StreamInfo> {
            let is_output = path.ends_with("stitched.mp4");
            Ok(StreamInfo {
                duration: 8.0,
                width: 1920,
                height: 1080,
                fps: 24.0,
                codec: "h264".to_string(),
                pixel_format: if is_output {
                    self.output_pixel_format.clone()
                } else {
                    "yuv444p".to_string()
                },
                profile: if is_output {
                    "High".to_string()
                } else {
                    "High 4:4:4 Predictive".to_string()
                },
                level: if is_output { self.output_level } else { Some(51) },
                has_audio: true,
            })
        }

        async fn extract_frame(&self, _: &Path, _: f64, _: &Path) -> PipelineResult<()> {
            unreachable!("stitching never extracts frames")
        }
    }

    #[async_trait]
    impl EncodingTool for FakeMedia {
        async fn encode(&self, invocation: &EncodeInvocation) -> PipelineResult<()> {
            self.invocations.lock().unwrap().push(invocation.clone());
            Ok(())
        }
    }

    fn chain(statuses: &[bool]) -> Chain {
        let mut chain = Chain::new();
        for (i, ok) in statuses.iter().enumerate() {
            let mut seg = Segment::new(i, format!("s{i}"), 8.0);
            if *ok {
                seg.mark_ready(PathBuf::from(format!("segment_{i:03}.mp4")), 8.0);
            } else {
                seg.mark_failed("remote failure");
            }
            chain.push(seg).unwrap();
        }
        chain
    }

    #[tokio::test]
    async fn test_stitch_skips_failed_and_enforces_baseline() {
        let media = FakeMedia::new("yuv420p");
        let engine = StitchingEngine::new(media.clone(), media.clone());
        let requested = EncodingProfile::default().with_crf(18);
        let mut off_baseline = requested.clone();
        off_baseline.pixel_format = "yuv444p".to_string();
        off_baseline.profile = "high444".to_string();

        let outcome = engine
            .stitch(
                &chain(&[true, true, false, true]),
                &TransitionSpec::default(),
                &off_baseline,
                Path::new("out/stitched.mp4"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.included, vec![0, 1, 3]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].index, 2);
        assert_eq!(outcome.skipped[0].reason, "remote failure");
        assert!((outcome.achieved_duration - 23.5).abs() < 1e-9);
        assert_eq!(outcome.boundaries.len(), 2);
        assert_eq!(outcome.boundaries[1].duration, 0.0);
        assert!(outcome.profile.is_baseline());
        assert_eq!(outcome.profile.crf, 18);

        let invocations = media.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].inputs.len(), 3);
        let args = invocations[0].to_args();
        assert!(args.contains(&"yuv420p".to_string()));
        assert!(args.contains(&"4.1".to_string()));
        assert!(!args.iter().any(|a| a.contains("segment_002")));
    }

    #[tokio::test]
    async fn test_stitch_is_deterministic() {
        let media = FakeMedia::new("yuv420p");
        let engine = StitchingEngine::new(media.clone(), media.clone());
        let chain = chain(&[true, true, true]);
        let spec = TransitionSpec::default();
        let out = Path::new("stitched.mp4");

        let a = engine
            .stitch(&chain, &spec, &EncodingProfile::default(), out)
            .await
            .unwrap();
        let b = engine
            .stitch(&chain, &spec, &EncodingProfile::default(), out)
            .await
            .unwrap();
        assert_eq!(a.achieved_duration, b.achieved_duration);
        assert_eq!(a.included, b.included);
        let invocations = media.invocations.lock().unwrap();
        assert_eq!(invocations[0].filter_graph, invocations[1].filter_graph);
    }

    #[tokio::test]
    async fn test_nothing_to_stitch() {
        let media = FakeMedia::new("yuv420p");
        let engine = StitchingEngine::new(media.clone(), media.clone());
        let err = engine
            .stitch(
                &chain(&[false, false]),
                &TransitionSpec::default(),
                &EncodingProfile::default(),
                Path::new("stitched.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NothingToStitch));
        assert!(media.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_off_baseline_output_is_an_encoding_error() {
        let media = FakeMedia::new("yuv444p");
        let engine = StitchingEngine::new(media.clone(), media.clone());
        let err = engine
            .stitch(
                &chain(&[true]),
                &TransitionSpec::default(),
                &EncodingProfile::default(),
                Path::new("stitched.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EncodingTool { .. }));
    }

    #[tokio::test]
    async fn test_output_above_level_cap_is_an_encoding_error() {
        let media = FakeMedia::with_level("yuv420p", Some(51));
        let engine = StitchingEngine::new(media.clone(), media.clone());
        let err = engine
            .stitch(
                &chain(&[true, true]),
                &TransitionSpec::default(),
                &EncodingProfile::default(),
                Path::new("stitched.mp4"),
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::EncodingTool { message, .. } => assert!(message.contains("level 51")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
