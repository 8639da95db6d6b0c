use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use super::{ArtifactRef, GenerationService, RemoteError, RemoteStatus};
use crate::config::Config;
use crate::logw;
use crate::request::{GenerationKind, GenerationRequest};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const BODY_SNIPPET: usize = 800;

static QUOTA_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)quota|rate[ _-]?limit|resource[ _-]?exhausted|too many requests")
        .expect("static regex")
});

#[derive(Debug, Serialize)]
struct InlineImage {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    kind: &'static str,
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conditioning_image: Option<InlineImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<f64>,
    aspect_ratio: &'static str,
    resolution: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    done: bool,
    artifact: Option<PollArtifact>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct PollArtifact {
    uri: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl ErrorBody {
    fn code_string(&self) -> Option<String> {
        self.status.clone().or_else(|| {
            self.code.as_ref().map(|c| match c {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
    }

    fn is_quota(&self) -> bool {
        self.code_string()
            .map(|c| c.eq_ignore_ascii_case("RESOURCE_EXHAUSTED") || c == "429")
            .unwrap_or(false)
            || QUOTA_MESSAGE.is_match(&self.message)
    }
}

fn snippet(raw: &str) -> String {
    raw.chars().take(BODY_SNIPPET).collect()
}

/// Map a non-success HTTP response onto the remote error classes.
fn classify_failure(status: StatusCode, raw: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(raw).ok().map(|e| e.error);
    let message = parsed
        .as_ref()
        .map(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), snippet(raw)));

    if status == StatusCode::TOO_MANY_REQUESTS || parsed.as_ref().is_some_and(ErrorBody::is_quota) {
        return RemoteError::Quota(message);
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return RemoteError::Transport(message);
    }
    RemoteError::Rejected(message)
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

/// HTTP binding to the remote generation service.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    client: Client,
    base_url: String,
    api_key: String,
    image_model: String,
    video_model: String,
}

impl GenerationClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, cfg))
    }

    pub fn with_client(client: Client, cfg: &Config) -> Self {
        Self {
            client,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            image_model: cfg.image_model.clone(),
            video_model: cfg.video_model.clone(),
        }
    }

    async fn inline_image(request: &GenerationRequest) -> Result<Option<InlineImage>, RemoteError> {
        let Some(frame) = request.conditioning_image.as_ref() else {
            return Ok(None);
        };
        let bytes = fs::read(&frame.path).await.map_err(|e| {
            RemoteError::Rejected(format!(
                "conditioning image {} unreadable: {}",
                frame.path.display(),
                e
            ))
        })?;
        Ok(Some(InlineImage {
            mime_type: frame.mime_type(),
            data: BASE64.encode(bytes),
        }))
    }
}

#[async_trait]
impl GenerationService for GenerationClient {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, RemoteError> {
        let model = match request.kind {
            GenerationKind::Image => &self.image_model,
            GenerationKind::Video => &self.video_model,
        };
        let body = SubmitBody {
            kind: request.kind.as_str(),
            model,
            prompt: &request.prompt,
            negative_prompt: request.negative_prompt.as_deref(),
            conditioning_image: Self::inline_image(request).await?,
            duration_seconds: request.duration_seconds,
            aspect_ratio: request.aspect_ratio.as_str(),
            resolution: request.resolution.as_str(),
            seed: request.seed,
        };

        let resp = self
            .client
            .post(format!("{}/v1/generations", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            logw(format!("Generation submit HTTP {}: {}", status.as_u16(), snippet(&raw)));
            return Err(classify_failure(status, &raw));
        }

        let parsed: SubmitResponse = serde_json::from_str(&raw).map_err(|e| {
            RemoteError::Rejected(format!("unparseable submit response ({e}): {}", snippet(&raw)))
        })?;
        if parsed.name.trim().is_empty() {
            return Err(RemoteError::Rejected("empty operation name".to_string()));
        }
        Ok(parsed.name)
    }

    async fn poll(&self, operation: &str) -> Result<RemoteStatus, RemoteError> {
        let resp = self
            .client
            .get(format!("{}/v1/operations/{}", self.base_url, operation))
            .header("x-api-key", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let raw = resp.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(classify_failure(status, &raw));
        }

        // A truncated body is indistinguishable from a dropped connection.
        let parsed: PollResponse = serde_json::from_str(&raw)
            .map_err(|e| RemoteError::Transport(format!("unparseable poll response: {e}")))?;

        if let Some(err) = parsed.error {
            if err.is_quota() {
                return Err(RemoteError::Quota(err.message));
            }
            return Ok(RemoteStatus::failed(err.code_string().as_deref(), err.message));
        }
        if !parsed.done {
            return Ok(RemoteStatus::pending());
        }

        match parsed.artifact {
            Some(PollArtifact { uri: Some(uri), .. }) if !uri.is_empty() => {
                Ok(RemoteStatus::done(ArtifactRef::Uri(uri)))
            }
            Some(PollArtifact { data: Some(data), .. }) => {
                let bytes = BASE64.decode(data.as_bytes()).map_err(|e| {
                    RemoteError::Rejected(format!("artifact payload is not base64: {e}"))
                })?;
                Ok(RemoteStatus::done(ArtifactRef::Inline(Arc::from(bytes))))
            }
            _ => Ok(RemoteStatus::failed(
                None,
                "operation finished without an artifact",
            )),
        }
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>, RemoteError> {
        let resp = self
            .client
            .get(uri)
            .header("x-api-key", &self.api_key)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &raw));
        }
        let bytes = resp.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }
}
