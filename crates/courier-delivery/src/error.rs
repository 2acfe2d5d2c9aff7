//! Error types for the outbound send path.
//!
//! Distinguishes transport failures, platform errcodes, resilience outcomes
//! (rate limiting, open circuits), and credential problems so the queue can
//! decide between retrying, dead-lettering, and dropping a task.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Platform errcodes meaning the access token is invalid or expired.
pub const TOKEN_INVALID_CODES: [i64; 3] = [40014, 41001, 42001];

/// Platform errcodes that no retry can fix: bad secret, bad recipients, bad
/// agent, caller IP not allowlisted.
const PERMANENT_CODES: [i64; 6] = [40001, 40003, 40013, 40056, 60020, 81013];

/// Errors raised while issuing tokens or sending messages.
///
/// `Clone` because one token refresh result is shared by every caller that
/// waited on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Connection could not be established or was reset.
    #[error("network connection failed: {message}")]
    Network {
        /// Transport diagnostic
        message: String,
    },

    /// The request did not complete within its timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Non-success HTTP status from the platform gateway.
    #[error("unexpected HTTP {status_code} from platform")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body, truncated
        body: String,
    },

    /// Platform answered with a non-zero errcode.
    #[error("platform error {code}: {message}")]
    Upstream {
        /// Platform errcode
        code: i64,
        /// Platform errmsg
        message: String,
    },

    /// Platform response could not be decoded.
    #[error("invalid platform response: {message}")]
    InvalidResponse {
        /// Decoder diagnostic
        message: String,
    },

    /// Local rate limiter rejected the call.
    #[error("rate limited on {key}: retry after {wait_ms}ms")]
    RateLimited {
        /// Rate-limited resource
        key: String,
        /// Suggested wait, in milliseconds
        wait_ms: u64,
    },

    /// Circuit breaker failed the call without contacting the platform.
    #[error("circuit breaker open for {resource}")]
    CircuitOpen {
        /// Protected resource name
        resource: String,
    },

    /// No tenant configuration for the account id.
    #[error("no credential configured for tenant {tenant}")]
    CredentialMissing {
        /// Account id that failed to resolve
        tenant: String,
    },

    /// Token issuance failed.
    #[error("credential refresh failed: {reason}")]
    CredentialRefreshFailed {
        /// Underlying failure
        reason: String,
        /// Whether the underlying failure can never succeed on retry
        permanent: bool,
    },

    /// Task gave up after its retry budget.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Caller cancelled the task.
    #[error("delivery cancelled")]
    Cancelled,

    /// Invalid client or tenant configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration diagnostic
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal diagnostic
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates an HTTP status error.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates a platform errcode error.
    pub fn upstream(code: i64, message: impl Into<String>) -> Self {
        Self::Upstream { code, message: message.into() }
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into() }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(key: impl Into<String>, wait: Duration) -> Self {
        Self::RateLimited { key: key.into(), wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(resource: impl Into<String>) -> Self {
        Self::CircuitOpen { resource: resource.into() }
    }

    /// Wraps a token issuance failure.
    pub fn refresh_failed(source: &Self) -> Self {
        Self::CredentialRefreshFailed { reason: source.to_string(), permanent: !source.is_retryable() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a later attempt of the same task could succeed.
    ///
    /// An open circuit counts as retryable here: the queue reschedules with
    /// backoff rather than hammering the breaker from the same call stack.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::CircuitOpen { .. } => true,

            Self::CredentialRefreshFailed { permanent, .. } => !permanent,
            Self::HttpStatus { status_code, .. } => *status_code == 429 || *status_code >= 500,
            Self::Upstream { code, .. } => !PERMANENT_CODES.contains(code),

            Self::InvalidResponse { .. }
            | Self::CredentialMissing { .. }
            | Self::RetriesExhausted { .. }
            | Self::Cancelled
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Whether the platform rejected the access token itself.
    pub fn is_token_invalid(&self) -> bool {
        matches!(self, Self::Upstream { code, .. } if TOKEN_INVALID_CODES.contains(code))
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait_ms, .. } => Some(Duration::from_millis(*wait_ms)),
            _ => None,
        }
    }
}

impl From<DeliveryError> for CoreError {
    fn from(error: DeliveryError) -> Self {
        match error {
            DeliveryError::Upstream { code, message } => Self::UpstreamError { code, message },
            DeliveryError::CircuitOpen { resource } => Self::CircuitOpen { resource },
            DeliveryError::CredentialMissing { tenant } => Self::CredentialMissing { tenant },
            DeliveryError::CredentialRefreshFailed { reason, .. } => Self::CredentialRefreshFailed { reason },
            DeliveryError::RetriesExhausted { attempts } => Self::RetriesExhausted { attempts },
            DeliveryError::Configuration { message } => Self::Configuration(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Category of delivery error for log fields and health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity and timeouts.
    Network,
    /// Non-zero errcode or unexpected HTTP status.
    Upstream,
    /// Local rate limiting.
    RateLimit,
    /// Circuit breaker protection.
    Circuit,
    /// Token resolution or issuance.
    Credential,
    /// Caller cancellation.
    Cancelled,
    /// Configuration problems.
    Configuration,
    /// Everything else.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. }
            | DeliveryError::Upstream { .. }
            | DeliveryError::InvalidResponse { .. } => Self::Upstream,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::CredentialMissing { .. } | DeliveryError::CredentialRefreshFailed { .. } => {
                Self::Credential
            },
            DeliveryError::Cancelled => Self::Cancelled,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::RetriesExhausted { .. } | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Upstream => write!(f, "upstream"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Circuit => write!(f, "circuit"),
            Self::Credential => write!(f, "credential"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
