//! Error taxonomy shared by the cache core and its collaborators.
//!
//! [`CardError`] is `Clone` so that a single generation outcome can be handed
//! to every request that joined the same in-flight generation.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CardError {
    /// Malformed owner/repo input.  Never reaches the coordinator.
    #[error("invalid repository identifier: {0}")]
    InvalidIdentifier(String),

    /// The upstream reports that the repository does not exist.
    #[error("repository not found: {0}")]
    UpstreamNotFound(String),

    /// Timeout, rate limit, network failure or unexpected upstream reply.
    #[error("upstream unavailable: {message}")]
    UpstreamTransient {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Writing the artifact to durable storage failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The generation task ended without producing a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CardError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "invalid",
            Self::UpstreamNotFound(_) => "not_found",
            Self::UpstreamTransient { .. } => "transient",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for CardError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
