use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::chain::FailurePolicy;
use crate::config::Config;
use crate::request::{AspectRatio, GenerationRequest, Resolution};
use crate::store::is_valid_job_id;
use crate::stitch::TransitionSpec;

/// One job as supplied by the caller. Prompts are opaque text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub image_prompt: String,
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub segment_seconds: Option<f64>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub transition: Option<TransitionSpec>,
    #[serde(default)]
    pub enhance: Option<bool>,
}

/// Job spec merged with config defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub policy: FailurePolicy,
    pub transition: TransitionSpec,
    pub enhance: bool,
    pub segment_seconds: f64,
    pub aspect_ratio: AspectRatio,
    pub resolution: Resolution,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobSpecFile {
    Wrapped { jobs: Vec<JobSpec> },
    List(Vec<JobSpec>),
    Single(JobSpec),
}

impl JobSpec {
    pub fn from_json(text: &str) -> Result<Vec<Self>> {
        let file: JobSpecFile =
            serde_json::from_str(text).with_context(|| "Failed to parse job spec JSON")?;
        let specs = match file {
            JobSpecFile::Wrapped { jobs } | JobSpecFile::List(jobs) => jobs,
            JobSpecFile::Single(spec) => vec![spec],
        };
        if specs.is_empty() {
            anyhow::bail!("job spec file contains no jobs");
        }
        for (i, spec) in specs.iter().enumerate() {
            spec.validate().with_context(|| format!("job #{i}"))?;
        }
        Ok(specs)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read job spec: {}", path.as_ref().display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id {
            if !is_valid_job_id(id) {
                anyhow::bail!("id {id:?} must be a single directory name");
            }
        }
        if self.image_prompt.trim().is_empty() {
            anyhow::bail!("image_prompt is empty");
        }
        if self.scenarios.is_empty() {
            anyhow::bail!("scenarios is empty");
        }
        if let Some(i) = self.scenarios.iter().position(|s| s.trim().is_empty()) {
            anyhow::bail!("scenario {i} is empty");
        }
        if let Some(secs) = self.segment_seconds {
            if !secs.is_finite() || secs <= 0.0 {
                anyhow::bail!("segment_seconds must be positive");
            }
        }
        Ok(())
    }

    pub fn settings(&self, config: &Config) -> JobSettings {
        JobSettings {
            policy: self.failure_policy.unwrap_or(config.failure_policy),
            transition: self.transition.unwrap_or(config.transition),
            enhance: self.enhance.unwrap_or(config.enhance.enabled),
            segment_seconds: self.segment_seconds.unwrap_or(config.segment_seconds),
            aspect_ratio: self.aspect_ratio.unwrap_or(config.aspect_ratio),
            resolution: self.resolution.unwrap_or(config.resolution),
        }
    }

    pub fn image_request(&self, settings: &JobSettings, seed: Option<u64>) -> GenerationRequest {
        GenerationRequest::image(&self.image_prompt)
            .with_aspect_ratio(settings.aspect_ratio)
            .with_resolution(settings.resolution)
            .with_negative_prompt(self.negative_prompt.clone())
            .with_seed(seed)
    }

    /// One unconditioned video request per scenario, in order.
    pub fn segment_requests(&self, settings: &JobSettings, seed: Option<u64>) -> Vec<GenerationRequest> {
        self.scenarios
            .iter()
            .map(|scenario| {
                GenerationRequest::video(scenario, settings.segment_seconds)
                    .with_aspect_ratio(settings.aspect_ratio)
                    .with_resolution(settings.resolution)
                    .with_negative_prompt(self.negative_prompt.clone())
                    .with_seed(seed)
            })
            .collect()
    }
}
