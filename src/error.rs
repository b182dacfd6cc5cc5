//! Crate-wide error taxonomy for the dispatch pipeline.
//!
//! Mirrors the classification in the design doc: a handful of named
//! failure modes that the retry state machine and the inbound
//! transformers need to distinguish, plus an escape hatch for anything
//! else via `Internal`.

use thiserror::Error;

/// A stable, named failure mode surfaced by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The requested model is not known to any enabled channel, or the
    /// request omitted a model entirely.
    #[error("model not available: {0}")]
    InvalidModel(String),

    /// A channel filter narrowed the candidate list to empty, or an
    /// admin-specified channel doesn't exist / doesn't support the model.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Upstream returned 5xx.
    #[error("upstream server error: status={status} body={body}")]
    Upstream5xx { status: u16, body: String },

    /// A transport-level failure talking to the upstream (timeout, reset,
    /// DNS, refused connection, ...).
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Upstream returned 4xx; never retried.
    #[error("upstream client error: status={status} body={body}")]
    Upstream4xx { status: u16, body: String },

    /// The retry budget was spent across all candidate channels.
    #[error("all channels exhausted after {attempts} attempt(s)")]
    AllChannelsExhausted { attempts: usize },

    /// The upstream stream closed with an error mid-way.
    #[error("stream error: {0}")]
    StreamError(String),

    /// A programmer error / invariant violation. Always fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Classifies whether the retry state machine should attempt another
    /// channel/attempt for this error. Matches the taxonomy in the
    /// design: 5xx and connection errors are retryable; 4xx, invalid
    /// model, and channel-unavailable never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Upstream5xx { .. } | GatewayError::ConnectionError(_)
        )
    }

    /// HTTP status code a provider-native error body should report.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidModel(_) => 400,
            GatewayError::ChannelUnavailable(_) => 503,
            GatewayError::Upstream5xx { status, .. } => *status,
            GatewayError::ConnectionError(_) => 502,
            GatewayError::Upstream4xx { status, .. } => *status,
            GatewayError::AllChannelsExhausted { .. } => 503,
            GatewayError::StreamError(_) => 502,
            GatewayError::Internal(_) => 500,
        }
    }
}

/// Extracts a human-readable message from a JSON error body, checking
/// `error.message` then `errors.message`, falling back to the raw
/// `Display` of the error. Used by terminal persistence (see
/// `stream_persist` and `pipeline`) to populate a readable failure
/// message on the request/execution rows.
pub fn extract_error_message(body: &[u8], fallback: &dyn std::fmt::Display) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("errors")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    fallback.to_string()
}
