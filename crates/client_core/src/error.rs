use shared::domain::ChatScope;
use thiserror::Error;

/// Failure taxonomy shared by the gateway, delivery pipeline and orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Connection lost, timeout or a temporary server condition. Retried locally.
    #[error("transport error: {0}")]
    Transport(String),
    /// The server rejected the request. Never retried.
    #[error("rejected by server: {0}")]
    Validation(String),
    /// The result arrived after the context it belonged to changed.
    #[error("stale result for {scope}")]
    Stale { scope: ChatScope },
    /// A duplicate request was suppressed by a concurrency guard.
    #[error("skipped: {0}")]
    GuardSkip(&'static str),
    #[error("connection is not ready")]
    NotConnected,
}

impl ChatError {
    /// Silent errors are logged only and never surfaced to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, ChatError::Stale { .. } | ChatError::GuardSkip(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::NotConnected)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
