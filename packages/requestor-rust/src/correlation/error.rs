use std::time::Duration;

/// Failure delivered to a pending request's continuation, or returned when a
/// request cannot be registered at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// No reply arrived before the request's timeout elapsed.
    #[error("no reply for correlation id `{correlation_id}` within {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },
    /// The transport refused or failed to send the request.
    #[error("failed to send request: {message}")]
    Send { message: String },
    /// The transport never supplied the message id needed to rebind.
    #[error("failed to rebind correlation id: {message}")]
    Rebind { message: String },
    #[error("correlation manager is not running")]
    NotRunning,
    #[error("correlation id `{0}` is already pending")]
    DuplicateKey(String),
    /// The manager was stopped while the request was outstanding.
    #[error("request abandoned before it resolved")]
    Abandoned,
}

impl CorrelationError {
    /// True for "no reply in time", as opposed to any other failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
