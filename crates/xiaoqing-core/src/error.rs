use std::time::Duration;

use crate::config::RetryPolicy;

/// Failures of a chat turn.
///
/// Everything the network layer can throw at a turn is converted into one of
/// these at the transport boundary. A stream that simply goes quiet until the
/// turn timeout is not an error; see [`crate::transport::StreamEnd`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("not logged in, please log in first")]
    Unauthenticated,
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("session expired, please log in again")]
    SessionExpired,
    #[error("chat request failed ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("{message}")]
    Client { status: u16, message: String },
    #[error("failed to read response: {0}")]
    TransientIo(String),
    #[error("response body was empty")]
    EmptyBody,
    #[error("request timed out, the server took too long to respond, please try again later")]
    Timeout(String),
    #[error("network request failed: {0}")]
    Transport(String),
    #[error("{last}")]
    RetriesExhausted { attempts: u32, last: Box<ChatError> },
    #[error("chat turn cancelled")]
    Cancelled,
}

impl ChatError {
    /// Whether the whole turn may be resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Server { .. }
                | ChatError::TransientIo(_)
                | ChatError::EmptyBody
                | ChatError::Timeout(_)
                | ChatError::Transport(_)
        )
    }

    pub fn retry_delay(&self, policy: &RetryPolicy) -> Duration {
        match self {
            ChatError::Server { .. } => policy.server_error_delay,
            ChatError::Timeout(_) => policy.timeout_delay,
            _ => policy.io_delay,
        }
    }

    /// The underlying error once retries are unwrapped.
    pub fn root(&self) -> &ChatError {
        match self {
            ChatError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Text for a toast-style notification.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Failures of the account endpoints (login, registration, passwords, SMS).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not logged in, please log in first")]
    NotLoggedIn,
    #[error("session expired, please log in again")]
    SessionExpired,
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Pulls a human readable message out of an error body.
///
/// FastAPI-style `{"detail": "..."}` bodies are unwrapped; any other non-empty
/// body is returned as-is.
pub(crate) fn detail_from_body(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return Some(detail.to_string());
        }
    }
    Some(body.to_string())
}
