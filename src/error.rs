//! Error types for FluidMCP gateway operations.
//!
//! Every component returns a classified `GatewayError`; only the HTTP surface
//! translates kinds to status codes. Transport errors (`std::io::Error`,
//! `reqwest::Error`) never cross a component boundary unclassified.

use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Unknown server or model id
    #[error("not found: {0}")]
    NotFound(String),

    /// Model lacks a capability the request requires
    #[error("model '{0}' does not support {1}")]
    CapabilityMismatch(String, String),

    /// Feature unsupported for this provider (e.g. streaming on predictions)
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Missing or wrong bearer token, or provider-side 401
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local limiter exhausted or provider 429 after retries
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Non-retryable 4xx from a provider; the original status is echoed
    #[error("provider rejected request ({status}): {message}")]
    Client { status: u16, message: String },

    /// 5xx from a provider after retries
    #[error("provider error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Transport failure: broken pipe to a child or provider connection error
    #[error("transport error for '{0}': {1}")]
    Io(String, String),

    /// Deadline exceeded on a call, poll, or probe
    #[error("timeout for '{0}'")]
    Timeout(String),

    /// Lifecycle operation illegal in the current state
    #[error("invalid state for '{0}': {1}")]
    InvalidState(String, String),

    /// Duplicate server or model id found in config
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Invalid configuration for a named server or model
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// JSON-RPC protocol error reported by a child
    #[error("protocol error for server '{0}': {1}")]
    Protocol(String, String),
}

impl GatewayError {
    /// Stable classification string, used as the `error_type` telemetry label.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "not_found",
            GatewayError::CapabilityMismatch(_, _) => "capability_mismatch",
            GatewayError::NotImplemented(_) => "not_implemented",
            GatewayError::Auth(_) => "auth_error",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::Client { .. } => "client_error",
            GatewayError::Server { .. } => "server_error",
            GatewayError::Io(_, _) => "io_error",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::InvalidState(_, _) => "invalid_state",
            GatewayError::DuplicateId(_) | GatewayError::InvalidConfig(_, _) => "invalid_config",
            GatewayError::Protocol(_, _) => "protocol_error",
        }
    }

    /// Whether the retry engine may attempt this operation again.
    ///
    /// Retriable: transport failures, timeouts, and provider statuses in
    /// {429, 500, 502, 503, 504}. Everything else (auth, capability, other
    /// 4xx, 501/505-style 5xx, config) propagates immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            GatewayError::Io(_, _) | GatewayError::Timeout(_) | GatewayError::RateLimited(_) => {
                true
            }
            GatewayError::Server { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = GatewayError::NotFound("demo".to_string());
        assert_eq!(err.to_string(), "not found: demo");
    }

    #[test]
    fn test_capability_mismatch_display() {
        let err =
            GatewayError::CapabilityMismatch("llava".to_string(), "text-to-image".to_string());
        assert_eq!(
            err.to_string(),
            "model 'llava' does not support text-to-image"
        );
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(GatewayError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(GatewayError::Auth("bad token".into()).kind(), "auth_error");
        assert_eq!(
            GatewayError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .kind(),
            "server_error"
        );
        assert_eq!(
            GatewayError::DuplicateId("a".into()).kind(),
            "invalid_config"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(GatewayError::Io("demo".into(), "broken pipe".into()).is_retriable());
        assert!(GatewayError::Timeout("demo".into()).is_retriable());
        assert!(GatewayError::RateLimited("provider 429".into()).is_retriable());
        assert!(!GatewayError::Auth("denied".into()).is_retriable());
        assert!(
            !GatewayError::Client {
                status: 400,
                message: "bad body".into()
            }
            .is_retriable()
        );
        assert!(!GatewayError::NotFound("demo".into()).is_retriable());
    }

    #[test]
    fn test_retriable_server_statuses_are_enumerated() {
        for status in [500, 502, 503, 504] {
            assert!(
                GatewayError::Server {
                    status,
                    message: "transient".into()
                }
                .is_retriable(),
                "{status} should be retriable"
            );
        }
        for status in [501, 505, 507, 511] {
            assert!(
                !GatewayError::Server {
                    status,
                    message: "permanent".into()
                }
                .is_retriable(),
                "{status} should propagate immediately"
            );
        }
    }
}
