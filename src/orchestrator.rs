//! Runs jobs end to end: reference image, chained segments, stitch and the
//! optional enhancement pass.
//!
//! Each job is one sequential flow. The manifest is persisted at every
//! state change and finalized whatever the outcome.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::api::{GenerationClient, GenerationService};
use crate::chain::Segment;
use crate::config::Config;
use crate::continuity::{ContinuityManager, GeneratedSegment, SegmentGenerator};
use crate::cost::CostKind;
use crate::enhance::EnhancementPass;
use crate::error::{PipelineError, PipelineResult};
use crate::ffmpeg::FfmpegTool;
use crate::job_spec::{JobSettings, JobSpec};
use crate::manifest::{FailureRecord, JobManifest};
use crate::media::{EncodingTool, MediaInspector};
use crate::poller::{OperationPoller, OperationResult};
use crate::request::{FrameImage, GenerationKind, GenerationRequest};
use crate::state::{JobState, Stage};
use crate::stitch::StitchingEngine;
use crate::store::{JobDir, JobStore};
use crate::throttle::SubmissionThrottle;
use crate::{logi, logok, logw};

/// Advisory cancellation shared between a caller and its running jobs.
///
/// Checked between stages and before each submission. Operations already
/// submitted run to completion remotely; their results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobOutcome {
    Succeeded,
    SucceededWithSkips { skipped: Vec<usize> },
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub job_dir: PathBuf,
    pub outcome: JobOutcome,
    pub manifest: JobManifest,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, JobOutcome::Failed { .. })
    }

    /// Final artifact: enhanced output when produced, else the stitch.
    pub fn output_path(&self) -> Option<&Path> {
        self.manifest.output_path.as_deref()
    }
}

/// Mutable state of one running job. Owned by exactly one `run` call.
struct JobRun {
    dir: JobDir,
    manifest: JobManifest,
    settings: JobSettings,
    cancel: CancelFlag,
}

pub struct Pipeline {
    config: Config,
    poller: OperationPoller,
    inspector: Arc<dyn MediaInspector>,
    encoder: Arc<dyn EncodingTool>,
    store: JobStore,
    throttle: Arc<SubmissionThrottle>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        service: Arc<dyn GenerationService>,
        inspector: Arc<dyn MediaInspector>,
        encoder: Arc<dyn EncodingTool>,
    ) -> Self {
        let store = JobStore::new(&config.jobs_dir);
        let throttle = Arc::new(SubmissionThrottle::new(config.max_concurrent_submissions));
        Self {
            config,
            poller: OperationPoller::new(service),
            inspector,
            encoder,
            store,
            throttle,
        }
    }

    /// Pipeline over the HTTP client and the ffmpeg tools on `PATH`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let service: Arc<dyn GenerationService> = Arc::new(GenerationClient::new(&config)?);
        let ffmpeg = Arc::new(FfmpegTool::with_binaries(&config.ffmpeg_bin, &config.ffprobe_bin));
        Ok(Self::new(config, service, ffmpeg.clone(), ffmpeg))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn throttle(&self) -> &Arc<SubmissionThrottle> {
        &self.throttle
    }

    /// Run one job to a terminal state. Never panics on job failure; the
    /// outcome is in the report.
    pub async fn run(&self, spec: JobSpec, cancel: CancelFlag) -> JobReport {
        let job_id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("job", job_id = %job_id);
        self.run_job(job_id, spec, cancel).instrument(span).await
    }

    async fn run_job(&self, job_id: String, spec: JobSpec, cancel: CancelFlag) -> JobReport {
        let started = Instant::now();
        let settings = spec.settings(&self.config);
        let seed = spec.seed.or_else(|| {
            self.config
                .randomize_seed
                .then(|| rand::thread_rng().gen_range(0..u32::MAX as u64))
        });

        let mut manifest = JobManifest::new(
            &job_id,
            settings.transition,
            self.config.encoding.clone().enforce_baseline(),
        );
        manifest.seed = seed;

        let dir = match self.store.create(&mut manifest).await {
            Ok(dir) => dir,
            Err(e) => {
                logw(format!("Job {job_id}: could not create job directory: {e}"));
                let reason = e.to_string();
                let _ = manifest.state.fail(reason.clone());
                manifest.failure = Some(FailureRecord {
                    stage: Stage::Setup,
                    kind: e.kind().to_string(),
                    reason: reason.clone(),
                });
                return JobReport {
                    job_id,
                    job_dir: self.store.root().to_path_buf(),
                    outcome: JobOutcome::Failed {
                        stage: Stage::Setup,
                        reason,
                    },
                    manifest,
                };
            }
        };

        logi(format!(
            "Job {job_id}: {} segment(s), policy {:?}, transition {:?} {:.2}s",
            spec.scenarios.len(),
            settings.policy,
            settings.transition.kind,
            settings.transition.duration
        ));

        let mut run = JobRun {
            dir,
            manifest,
            settings,
            cancel,
        };
        let result = self.drive(&spec, seed, &mut run).await;
        run.manifest.total_elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                let skipped: Vec<usize> = run.manifest.skipped.iter().map(|s| s.index).collect();
                if skipped.is_empty() {
                    logok(format!("Job {job_id} complete"));
                    JobOutcome::Succeeded
                } else {
                    logok(format!("Job {job_id} complete, skipped segments {skipped:?}"));
                    JobOutcome::SucceededWithSkips { skipped }
                }
            }
            Err(e) => {
                let stage = run.manifest.state.stage();
                let reason = e.to_string();
                if !run.manifest.state.is_terminal() {
                    let _ = run.manifest.state.fail(reason.clone());
                }
                run.manifest.failure = Some(FailureRecord {
                    stage,
                    kind: e.kind().to_string(),
                    reason: reason.clone(),
                });
                logw(format!("Job {job_id} failed at {stage}: {reason}"));
                JobOutcome::Failed { stage, reason }
            }
        };

        if let Err(e) = self.store.finalize(&mut run.dir, &mut run.manifest).await {
            logw(format!("Job {job_id}: could not write final manifest: {e}"));
        }

        JobReport {
            job_id,
            job_dir: run.dir.root().to_path_buf(),
            outcome,
            manifest: run.manifest,
        }
    }

    async fn drive(&self, spec: &JobSpec, seed: Option<u64>, run: &mut JobRun) -> PipelineResult<()> {
        // Reference image
        run.cancel.check()?;
        self.advance(run, JobState::ImageGenerating).await?;
        let t = Instant::now();
        let dest = run.dir.reference_image_path();
        let request = spec.image_request(&run.settings, seed);
        let reference = self
            .generate(run, &request, CostKind::ReferenceImage, None, &dest)
            .await;
        run.manifest.record_timing(Stage::ReferenceImage, elapsed_ms(t));
        reference?;
        run.manifest.reference_image = Some(dest.clone());
        self.advance(run, JobState::ImageReady).await?;
        logok(format!("Reference image ready: {}", dest.display()));

        // Chained segments
        run.cancel.check()?;
        let requests = spec.segment_requests(&run.settings, seed);
        let total = requests.len();
        self.advance(run, JobState::SegmentsGenerating { current: 0, total }).await?;
        let t = Instant::now();
        let continuity = ContinuityManager::new(self.inspector.clone(), run.dir.frames_dir());
        let policy = run.settings.policy;
        let build = {
            let mut generator = JobSegments {
                pipeline: self,
                run: &mut *run,
                total,
            };
            continuity
                .build_chain(Some(FrameImage::new(dest)), &requests, &mut generator, policy)
                .await
        };
        run.manifest.record_timing(Stage::Segments, elapsed_ms(t));
        let build = build?;
        run.manifest.chain = build.chain;
        run.manifest.refresh_outcomes(&[]);
        if let Some(abort) = build.aborted {
            return Err(abort.error);
        }
        self.advance(run, JobState::SegmentsReady).await?;

        // Stitch
        run.cancel.check()?;
        self.advance(run, JobState::Stitching).await?;
        let t = Instant::now();
        let engine = StitchingEngine::new(self.encoder.clone(), self.inspector.clone());
        let stitched = engine
            .stitch(
                &run.manifest.chain,
                &run.settings.transition,
                &self.config.encoding,
                &run.dir.stitched_path(),
            )
            .await;
        run.manifest.record_timing(Stage::Stitching, elapsed_ms(t));
        let stitched = stitched?;
        run.manifest
            .costs
            .record(CostKind::Stitch, None, self.config.costs.stitch, true);
        run.manifest.output_path = Some(stitched.output_path.clone());
        run.manifest.achieved_duration = Some(stitched.achieved_duration);
        run.manifest.profile = stitched.profile.clone();
        run.manifest.skipped = stitched.skipped.clone();
        run.manifest.refresh_outcomes(&stitched.included);
        logok(format!(
            "Stitched {} segment(s) into {:.2}s: {}",
            stitched.included.len(),
            stitched.achieved_duration,
            stitched.output_path.display()
        ));

        // Enhancement
        if run.settings.enhance {
            run.cancel.check()?;
            self.advance(run, JobState::Enhancing).await?;
            let t = Instant::now();
            let pass = EnhancementPass::new(self.encoder.clone(), self.inspector.clone());
            let enhanced = pass
                .enhance(
                    &stitched.output_path,
                    &run.dir.enhanced_path(),
                    self.config.enhance.target_height,
                    &self.config.encoding,
                )
                .await;
            run.manifest.record_timing(Stage::Enhancing, elapsed_ms(t));
            let enhanced = enhanced?;
            run.manifest
                .costs
                .record(CostKind::Enhancement, None, self.config.costs.enhancement, true);
            run.manifest.output_path = Some(enhanced.output_path);
        }

        self.advance(run, JobState::Complete).await
    }

    async fn advance(&self, run: &mut JobRun, next: JobState) -> PipelineResult<()> {
        run.manifest.state.advance(next)?;
        debug!(state = %run.manifest.state, "Job state");
        self.persist(run).await;
        Ok(())
    }

    async fn persist(&self, run: &mut JobRun) {
        if let Err(e) = self.store.update(&run.dir, &mut run.manifest).await {
            warn!("Could not persist manifest: {}", e);
        }
    }

    /// Submit, wait and fetch one artifact to `dest`, recording its cost.
    async fn generate(
        &self,
        run: &mut JobRun,
        request: &GenerationRequest,
        kind: CostKind,
        segment: Option<usize>,
        dest: &Path,
    ) -> PipelineResult<()> {
        run.cancel.check()?;
        let amount = match request.kind {
            GenerationKind::Image => self.config.costs.image,
            GenerationKind::Video => self
                .config
                .costs
                .video_segment(request.duration_seconds.unwrap_or(0.0)),
        };

        let permit = self.throttle.acquire().await?;
        let handle = match self.poller.submit(request).await {
            Ok(handle) => {
                self.throttle.record_success(permit);
                handle
            }
            Err(e) => {
                if e.is_quota() {
                    self.throttle.record_quota(permit);
                }
                run.manifest.costs.record(kind, segment, amount, false);
                return Err(e);
            }
        };

        let waited = self
            .poller
            .wait(&handle, self.config.poll_interval(), self.config.poll_max_attempts)
            .await;
        let result = match waited {
            Ok(result) => result,
            Err(e) => {
                run.manifest.costs.record(kind, segment, amount, false);
                return Err(e);
            }
        };

        match result {
            OperationResult::Done(artifact) => {
                run.manifest.costs.record(kind, segment, amount, true);
                if run.cancel.is_cancelled() {
                    debug!(handle = %handle.id(), "Discarding result of cancelled job");
                    return Err(PipelineError::Cancelled);
                }
                let bytes = self.poller.fetch_artifact(&artifact, dest).await?;
                debug!(handle = %handle.id(), bytes, "Fetched {}", dest.display());
                Ok(())
            }
            OperationResult::Failed(reason) => {
                run.manifest.costs.record(kind, segment, amount, false);
                Err(PipelineError::RemoteFailed(reason))
            }
            OperationResult::Pending => {
                run.manifest.costs.record(kind, segment, amount, false);
                Err(PipelineError::RemoteFailed("operation still pending".to_string()))
            }
        }
    }

    /// Run independent jobs concurrently. They share only the throttle and
    /// the stateless clients. Reports come back in input order.
    pub async fn run_batch(self: &Arc<Self>, specs: Vec<JobSpec>, cancel: CancelFlag) -> Vec<JobReport> {
        let mut set = JoinSet::new();
        for (i, spec) in specs.into_iter().enumerate() {
            let pipeline = Arc::clone(self);
            let cancel = cancel.clone();
            set.spawn(async move { (i, pipeline.run(spec, cancel).await) });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                Err(e) => logw(format!("Job task aborted: {e}")),
            }
        }
        reports.sort_by_key(|(i, _)| *i);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Segment generator bound to one running job.
struct JobSegments<'a> {
    pipeline: &'a Pipeline,
    run: &'a mut JobRun,
    total: usize,
}

#[async_trait]
impl SegmentGenerator for JobSegments<'_> {
    async fn generate(
        &mut self,
        index: usize,
        request: &GenerationRequest,
    ) -> PipelineResult<GeneratedSegment> {
        self.run.cancel.check()?;
        if index > 0 {
            self.pipeline
                .advance(
                    self.run,
                    JobState::SegmentsGenerating {
                        current: index,
                        total: self.total,
                    },
                )
                .await?;
        }
        logi(format!(
            "Segment {}/{}: {}",
            index + 1,
            self.total,
            match request.conditioning_path() {
                Some(p) => format!("conditioned on {}", p.display()),
                None => "unconditioned".to_string(),
            }
        ));

        let path = self.run.dir.segment_path(index);
        self.pipeline
            .generate(self.run, request, CostKind::VideoSegment, Some(index), &path)
            .await?;
        let duration = self.pipeline.inspector.duration(&path).await?;
        Ok(GeneratedSegment { path, duration })
    }

    async fn segment_resolved(&mut self, segment: &Segment) {
        if segment.is_ready() {
            logok(format!("Segment {} ready ({:.2}s)", segment.index, segment.duration));
        } else {
            logw(format!(
                "Segment {} failed: {}",
                segment.index,
                segment.failure_reason.as_deref().unwrap_or("unknown")
            ));
        }
        if self.run.manifest.chain.push(segment.clone()).is_ok() {
            self.pipeline.persist(self.run).await;
        }
    }
}
