//! Agent-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by an agent or by the executor around it.
///
/// The engine uses [`AgentError::is_retryable`] to decide between requeueing
/// the execution and failing it outright.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    /// Transient failure (connection refused, timeout, 5xx).
    #[error("retryable agent error: {0}")]
    Retryable(String),

    /// Permanent failure such as invalid input or configuration.
    #[error("fatal agent error: {0}")]
    Fatal(String),

    /// The shared breaker refused the call.
    #[error("circuit breaker '{breaker}' is open, retry after {retry_after:?}")]
    CircuitOpen { breaker: String, retry_after: Duration },

    /// No agent is registered for this type.
    #[error("no agent registered for type '{0}'")]
    UnknownAgent(String),

    /// The agent did not answer in time.
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
}

/// Substrings of transport failures, matched case-insensitively.
const RETRYABLE_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "econnrefused",
    "econnreset",
    "timed out",
    "timeout",
    "unavailable",
];

/// Server-side HTTP statuses worth retrying.
const RETRYABLE_STATUS: &[&str] = &["500", "502", "503", "504"];

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::CircuitOpen { .. } | Self::Timeout(_))
    }

    /// Wrap a collaborator's error text: transport and 5xx failures become
    /// [`AgentError::Retryable`], everything else [`AgentError::Fatal`].
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let server_status = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| RETRYABLE_STATUS.contains(&token));
        if server_status || RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::Retryable(message)
        } else {
            Self::Fatal(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        assert!(AgentError::Retryable("connection refused".into()).is_retryable());
        assert!(AgentError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(AgentError::CircuitOpen { breaker: "agent-executor".into(), retry_after: Duration::ZERO }.is_retryable());
    }

    #[test]
    fn validation_failures_are_not() {
        assert!(!AgentError::Fatal("field 'threshold' must be a number".into()).is_retryable());
        assert!(!AgentError::UnknownAgent("nope".into()).is_retryable());
    }

    #[test]
    fn classify_splits_transport_from_validation() {
        assert!(AgentError::classify("connect ECONNREFUSED 10.0.0.4:4840").is_retryable());
        assert!(AgentError::classify("gateway answered 503 Service Unavailable").is_retryable());
        assert!(AgentError::classify("read timed out").is_retryable());
        assert_eq!(AgentError::classify("limit must be below 5000"), AgentError::Fatal("limit must be below 5000".into()));
        assert!(!AgentError::classify("unknown node id ns=2;s=Press1").is_retryable());
    }
}
