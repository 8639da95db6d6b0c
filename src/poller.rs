//! Submit/poll/wait over long-running remote generation operations.
//!
//! A handle memoizes its terminal result, so polling a finished operation
//! never reaches the service again. The memo lives behind an async mutex
//! that is held for the duration of a poll, which also guarantees at most
//! one in-flight poll per handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ArtifactRef, GenerationService, RemoteError, RemoteStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::request::{GenerationKind, GenerationRequest};

/// Tagged outcome of one poll. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Done(ArtifactRef),
    Failed(String),
    Pending,
}

impl OperationResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationResult::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: String,
    kind: GenerationKind,
    terminal: Arc<Mutex<Option<OperationResult>>>,
}

impl OperationHandle {
    pub fn new(id: impl Into<String>, kind: GenerationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            terminal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> GenerationKind {
        self.kind
    }
}

/// Bounded retry for transient transport failures while polling.
#[derive(Debug, Clone)]
pub struct TransientRetry {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl TransientRetry {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

pub struct OperationPoller {
    service: Arc<dyn GenerationService>,
    retry: TransientRetry,
}

impl OperationPoller {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self {
            service,
            retry: TransientRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: TransientRetry) -> Self {
        self.retry = retry;
        self
    }

    pub async fn submit(&self, request: &GenerationRequest) -> PipelineResult<OperationHandle> {
        request.validate()?;

        let id = self.service.submit(request).await.map_err(|e| match e {
            RemoteError::Quota(m) => PipelineError::QuotaExceeded(m),
            RemoteError::Rejected(m) => PipelineError::Submission(m),
            // Resubmitting on transport errors risks a duplicate billed job.
            RemoteError::Transport(m) => PipelineError::Submission(format!("transport: {m}")),
        })?;

        debug!(handle = %id, request = %request, "Submitted generation");
        Ok(OperationHandle::new(id, request.kind))
    }

    /// One status check. Terminal results are memoized on the handle.
    pub async fn poll(&self, handle: &OperationHandle) -> PipelineResult<OperationResult> {
        let mut terminal = handle.terminal.lock().await;
        if let Some(result) = terminal.as_ref() {
            return Ok(result.clone());
        }

        let status = self.poll_with_retry(handle.id()).await?;
        let result = match status {
            RemoteStatus {
                error: Some(failure),
                ..
            } => OperationResult::Failed(match failure.code {
                Some(code) => format!("{code}: {}", failure.message),
                None => failure.message,
            }),
            RemoteStatus {
                done: true,
                artifact: Some(artifact),
                ..
            } => OperationResult::Done(artifact),
            RemoteStatus { done: true, .. } => {
                OperationResult::Failed("operation finished without an artifact".to_string())
            }
            _ => OperationResult::Pending,
        };

        if result.is_terminal() {
            *terminal = Some(result.clone());
        }
        Ok(result)
    }

    async fn poll_with_retry(&self, id: &str) -> PipelineResult<RemoteStatus> {
        let mut attempt = 0u32;
        loop {
            match self.service.poll(id).await {
                Ok(status) => return Ok(status),
                Err(RemoteError::Quota(m)) => return Err(PipelineError::QuotaExceeded(m)),
                Err(RemoteError::Rejected(m)) => return Ok(RemoteStatus::failed(None, m)),
                Err(RemoteError::Transport(m)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    debug!(handle = %id, attempt, ?delay, "Transient poll failure, retrying: {}", m);
                    tokio::time::sleep(delay).await;
                }
                Err(RemoteError::Transport(m)) => {
                    return Err(PipelineError::TransientPoll {
                        message: m,
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }

    /// Poll every `interval` until terminal, at most `max_attempts` times.
    ///
    /// Never takes longer than `interval * max_attempts`: the whole loop runs
    /// under that deadline, including any transient retries.
    pub async fn wait(
        &self,
        handle: &OperationHandle,
        interval: Duration,
        max_attempts: u32,
    ) -> PipelineResult<OperationResult> {
        let started = Instant::now();
        let budget = interval.saturating_mul(max_attempts);

        let looped = tokio::time::timeout(budget, async {
            for attempt in 1..=max_attempts {
                let result = self.poll(handle).await?;
                if result.is_terminal() {
                    return Ok(Some(result));
                }
                if attempt < max_attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            Ok::<_, PipelineError>(None)
        })
        .await;

        match looped {
            Ok(Ok(Some(result))) => Ok(result),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) | Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(handle = %handle.id(), max_attempts, elapsed_ms, "Operation timed out");
                Err(PipelineError::OperationTimeout {
                    handle: handle.id().to_string(),
                    attempts: max_attempts,
                    elapsed_ms,
                })
            }
        }
    }

    /// Materialize an artifact at `dest`.
    ///
    /// Bytes land in a `.part` sibling, are synced, then renamed, so `dest`
    /// only ever exists fully written.
    pub async fn fetch_artifact(&self, artifact: &ArtifactRef, dest: &Path) -> PipelineResult<u64> {
        let bytes: Vec<u8> = match artifact {
            ArtifactRef::Inline(bytes) => bytes.to_vec(),
            ArtifactRef::Uri(uri) => self.download_with_retry(uri).await?,
        };
        if bytes.is_empty() {
            return Err(PipelineError::RemoteFailed("artifact is empty".to_string()));
        }
        write_durably(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn download_with_retry(&self, uri: &str) -> PipelineResult<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match self.service.download(uri).await {
                Ok(bytes) => return Ok(bytes),
                Err(RemoteError::Quota(m)) => return Err(PipelineError::QuotaExceeded(m)),
                Err(RemoteError::Rejected(m)) => {
                    return Err(PipelineError::RemoteFailed(format!("download rejected: {m}")));
                }
                Err(RemoteError::Transport(m)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    debug!(uri, attempt, ?delay, "Transient download failure, retrying: {}", m);
                    tokio::time::sleep(delay).await;
                }
                Err(RemoteError::Transport(m)) => {
                    return Err(PipelineError::TransientPoll {
                        message: format!("download: {m}"),
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

async fn write_durably(dest: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part = partial_path(dest);
    let mut file = fs::File::create(&part).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&part, dest).await?;
    Ok(())
}
