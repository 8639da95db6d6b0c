use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::request::GenerationRequest;

pub mod generation;

pub use generation::GenerationClient;

/// Reference to a finished artifact as reported by the service.
#[derive(Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Uri(String),
    Inline(Arc<[u8]>),
}

impl fmt::Debug for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactRef::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            ArtifactRef::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub code: Option<String>,
    pub message: String,
}

/// One status response from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub done: bool,
    pub artifact: Option<ArtifactRef>,
    pub error: Option<RemoteFailure>,
}

impl RemoteStatus {
    pub fn pending() -> Self {
        Self {
            done: false,
            artifact: None,
            error: None,
        }
    }

    pub fn done(artifact: ArtifactRef) -> Self {
        Self {
            done: true,
            artifact: Some(artifact),
            error: None,
        }
    }

    pub fn failed(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            done: true,
            artifact: None,
            error: Some(RemoteFailure {
                code: code.map(str::to_string),
                message: message.into(),
            }),
        }
    }
}

/// Classified failure of a single call to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service refused the call; repeating it will not help.
    Rejected(String),
    /// Rate limit or quota exhaustion.
    Quota(String),
    /// Network or 5xx failure; the same call may succeed later.
    Transport(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Rejected(m) => write!(f, "rejected: {m}"),
            RemoteError::Quota(m) => write!(f, "quota: {m}"),
            RemoteError::Transport(m) => write!(f, "transport: {m}"),
        }
    }
}

/// The remote media-generation service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Submit a request, returning the operation name.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, RemoteError>;

    async fn poll(&self, operation: &str) -> Result<RemoteStatus, RemoteError>;

    async fn download(&self, uri: &str) -> Result<Vec<u8>, RemoteError>;
}
