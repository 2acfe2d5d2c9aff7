//! Error taxonomy for callback ingress and outbound delivery.
//!
//! Codes are stable so operators can correlate log lines, dead-letter
//! records, and HTTP responses without parsing free-form messages.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors shared by every courier component.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    // Ingress errors (E1001-E1003)
    /// Callback signature did not match the tenant token (E1001).
    #[error("[E1001] Signature mismatch: callback rejected")]
    SignatureMismatch,

    /// Ciphertext, padding, or framing was malformed (E1002).
    #[error("[E1002] Decryption failed: {reason}")]
    DecryptionFailed {
        /// What part of the pipeline rejected the payload
        reason: String,
    },

    /// Callback body could not be parsed into a message (E1003).
    #[error("[E1003] Invalid message format: {reason}")]
    InvalidMessageFormat {
        /// Parser diagnostic
        reason: String,
    },

    // Credential errors (E2001-E2002)
    /// No credential is configured or cached for the tenant (E2001).
    #[error("[E2001] Credential missing for tenant {tenant}")]
    CredentialMissing {
        /// Account identifier of the tenant
        tenant: String,
    },

    /// Token issuance failed (E2002).
    #[error("[E2002] Credential refresh failed: {reason}")]
    CredentialRefreshFailed {
        /// Underlying failure
        reason: String,
    },

    // Delivery errors (E3001-E3003)
    /// Circuit breaker rejected the call without contacting upstream (E3001).
    #[error("[E3001] Circuit open: {resource} is failing fast")]
    CircuitOpen {
        /// Protected resource name
        resource: String,
    },

    /// Platform returned a non-zero errcode (E3002).
    #[error("[E3002] Upstream error {code}: {message}")]
    UpstreamError {
        /// Platform errcode
        code: i64,
        /// Platform errmsg
        message: String,
    },

    /// Send task exhausted its retry budget (E3003).
    #[error("[E3003] Retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    // System errors (E9001-E9999)
    /// Configuration rejected at startup or resolution time.
    #[error("[E9001] Configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal failure.
    #[error("[E9999] Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Creates a decryption failure.
    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::DecryptionFailed { reason: reason.into() }
    }

    /// Creates an invalid message format error.
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidMessageFormat { reason: reason.into() }
    }

    /// Creates an upstream platform error.
    pub fn upstream(code: i64, message: impl Into<String>) -> Self {
        Self::UpstreamError { code, message: message.into() }
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SignatureMismatch => "E1001",
            Self::DecryptionFailed { .. } => "E1002",
            Self::InvalidMessageFormat { .. } => "E1003",
            Self::CredentialMissing { .. } => "E2001",
            Self::CredentialRefreshFailed { .. } => "E2002",
            Self::CircuitOpen { .. } => "E3001",
            Self::UpstreamError { .. } => "E3002",
            Self::RetriesExhausted { .. } => "E3003",
            Self::Configuration(_) => "E9001",
            Self::Internal(_) => "E9999",
        }
    }

    /// Returns whether a delivery retry could succeed.
    ///
    /// Ingress errors are terminal for the request that produced them.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CredentialRefreshFailed { .. }
                | Self::CircuitOpen { .. }
                | Self::UpstreamError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::SignatureMismatch.code(), "E1001");
        assert_eq!(CoreError::decryption("pad").code(), "E1002");
        assert_eq!(CoreError::invalid_format("xml").code(), "E1003");
        assert_eq!(CoreError::CredentialMissing { tenant: "t".into() }.code(), "E2001");
        assert_eq!(CoreError::upstream(40001, "invalid secret").code(), "E3002");
        assert_eq!(CoreError::RetriesExhausted { attempts: 3 }.code(), "E3003");
    }

    #[test]
    fn ingress_errors_are_terminal() {
        assert!(!CoreError::SignatureMismatch.is_retryable());
        assert!(!CoreError::decryption("bad base64").is_retryable());
        assert!(!CoreError::invalid_format("empty").is_retryable());
        assert!(CoreError::CircuitOpen { resource: "send".into() }.is_retryable());
        assert!(CoreError::upstream(-1, "system busy").is_retryable());
    }

    #[test]
    fn display_carries_code_and_detail() {
        let err = CoreError::upstream(60020, "not allow to access from your ip");
        assert_eq!(err.to_string(), "[E3002] Upstream error 60020: not allow to access from your ip");
    }
}
