use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed request or immediate remote rejection. Fatal to that submission only.
    #[error("Submission rejected: {0}")]
    Submission(String),

    #[error("Transient poll failure after {attempts} attempts: {message}")]
    TransientPoll { message: String, attempts: u32 },

    /// Rate limit or quota exhaustion. Never retried in place.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Operation {handle} still pending after {attempts} polls ({elapsed_ms} ms)")]
    OperationTimeout {
        handle: String,
        attempts: u32,
        elapsed_ms: u64,
    },

    /// The remote service reported a terminal failure for the operation.
    #[error("Remote operation failed: {0}")]
    RemoteFailed(String),

    #[error("Artifact missing or unreadable: {path}: {reason}")]
    MissingArtifact { path: PathBuf, reason: String },

    #[error("Encoding tool failed: {message}")]
    EncodingTool {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Nothing to stitch: every segment failed")]
    NothingToStitch,

    #[error("cancelled")]
    Cancelled,

    /// A job id that is not a single plain path component.
    #[error("Invalid job id {0:?}")]
    InvalidJobId(String),

    #[error("Illegal job state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn submission(msg: impl Into<String>) -> Self {
        Self::Submission(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn missing_artifact(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MissingArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn encoding_tool(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::EncodingTool {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Errors worth another poll attempt. Quota errors are deliberately excluded.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientPoll { .. })
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, PipelineError::QuotaExceeded(_))
    }

    /// Errors that end the whole chain regardless of the failure policy.
    pub fn is_chain_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::QuotaExceeded(_) | PipelineError::Cancelled
        )
    }

    /// Short machine-friendly label used in manifests.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Submission(_) => "submission",
            PipelineError::TransientPoll { .. } => "transient_poll",
            PipelineError::QuotaExceeded(_) => "quota_exceeded",
            PipelineError::OperationTimeout { .. } => "operation_timeout",
            PipelineError::RemoteFailed(_) => "remote_failed",
            PipelineError::MissingArtifact { .. } => "missing_artifact",
            PipelineError::EncodingTool { .. } => "encoding_tool",
            PipelineError::NothingToStitch => "nothing_to_stitch",
            PipelineError::Cancelled => "cancelled",
            PipelineError::InvalidJobId(_) => "invalid_job_id",
            PipelineError::InvalidTransition { .. } => "invalid_transition",
            PipelineError::Io(_) => "io",
            PipelineError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_is_not_retryable() {
        let err = PipelineError::quota_exceeded("429");
        assert!(err.is_quota());
        assert!(!err.is_retryable());
        assert!(err.is_chain_fatal());
    }

    #[test]
    fn test_transient_is_retryable() {
        let err = PipelineError::TransientPoll {
            message: "connection reset".to_string(),
            attempts: 1,
        };
        assert!(err.is_retryable());
        assert!(!err.is_chain_fatal());
        assert_eq!(err.kind(), "transient_poll");
    }

    #[test]
    fn test_timeout_message_names_handle() {
        let err = PipelineError::OperationTimeout {
            handle: "operations/abc".to_string(),
            attempts: 6,
            elapsed_ms: 60_000,
        };
        assert!(err.to_string().contains("operations/abc"));
    }
}
