//! Error taxonomy for the token-minting pipeline.
//!
//! Every failure the tool can surface falls into one of these categories.
//! Each category maps to a distinct process exit code so that calling
//! automation (a supervisor restarting the runner, a provisioning script)
//! can tell retryable failures apart from ones that need operator action.

use std::time::Duration;

use thiserror::Error;

/// Main error type for the JIT token pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Private key file missing, unreadable, or not a valid RSA PEM
    #[error("GitHub App private key unavailable: {0}")]
    KeyUnavailable(String),

    /// The signing operation itself failed
    #[error("failed to sign App JWT: {0}")]
    SigningFailure(String),

    /// GitHub rejected the App assertion or installation token request.
    /// `status` is `None` when a local validity check failed before any
    /// request was sent.
    #[error("authentication rejected{}: {detail}", http_status_suffix(.status))]
    AuthenticationRejected {
        status: Option<u16>,
        detail: String,
    },

    /// The installation token lacks rights for the requested runner scope
    #[error("installation token lacks access to the requested scope (HTTP {status}): {detail}")]
    ScopeInsufficient { status: u16, detail: String },

    /// A runner with the requested name already exists and is active
    #[error("runner name '{runner}' already registered: {detail}")]
    RunnerNameConflict { runner: String, detail: String },

    /// GitHub asked us to back off
    #[error("rate limited by GitHub: {detail}")]
    RateLimited {
        /// Server-specified backoff from the Retry-After header, if any
        retry_after: Option<Duration>,
        detail: String,
    },

    /// Network-level failure (connect, TLS, timeout, 5xx)
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Could not hand the token to its destination
    #[error("token delivery failed: {0}")]
    DeliveryFailure(String),

    /// Pipeline aborted by signal or deadline
    #[error("cancelled before the token was delivered")]
    Cancelled,

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse category of an [`Error`], used for the orchestrator's terminal
/// state and for exit-code mapping. Unlike `Error` itself this is `Copy`
/// and comparable, so tests can assert on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    KeyUnavailable,
    SigningFailure,
    AuthenticationRejected,
    ScopeInsufficient,
    RunnerNameConflict,
    RateLimited,
    TransportFailure,
    DeliveryFailure,
    Cancelled,
    Config,
}

impl Error {
    /// Create a transport failure from any displayable cause.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::TransportFailure(msg.into())
    }

    /// Create a delivery failure from any displayable cause.
    pub fn delivery(msg: impl Into<String>) -> Self {
        Error::DeliveryFailure(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::KeyUnavailable(_) => ErrorCategory::KeyUnavailable,
            Error::SigningFailure(_) => ErrorCategory::SigningFailure,
            Error::AuthenticationRejected { .. } => ErrorCategory::AuthenticationRejected,
            Error::ScopeInsufficient { .. } => ErrorCategory::ScopeInsufficient,
            Error::RunnerNameConflict { .. } => ErrorCategory::RunnerNameConflict,
            Error::RateLimited { .. } => ErrorCategory::RateLimited,
            Error::TransportFailure(_) => ErrorCategory::TransportFailure,
            Error::DeliveryFailure(_) => ErrorCategory::DeliveryFailure,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::Config(_) => ErrorCategory::Config,
        }
    }

    /// Whether a bounded in-stage retry can help.
    ///
    /// Only rate limiting and transport failures are retried; everything
    /// else needs external intervention (new key, renamed runner, wider
    /// App permissions) and is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::TransportFailure(_)
        )
    }

    /// Server-requested backoff, if the platform supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Process exit code for this error's category.
    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }
}

impl ErrorCategory {
    /// Distinct exit code per category (0 is reserved for success,
    /// 1 for unexpected panics, 2 for usage/configuration errors).
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Config => 2,
            ErrorCategory::KeyUnavailable => 10,
            ErrorCategory::SigningFailure => 11,
            ErrorCategory::AuthenticationRejected => 12,
            ErrorCategory::ScopeInsufficient => 13,
            ErrorCategory::RunnerNameConflict => 14,
            ErrorCategory::RateLimited => 15,
            ErrorCategory::TransportFailure => 16,
            ErrorCategory::DeliveryFailure => 17,
            ErrorCategory::Cancelled => 18,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::TransportFailure(format!("request timed out: {e}"))
        } else {
            // reqwest redacts URLs with credentials in its Display impl
            Error::TransportFailure(e.to_string())
        }
    }
}

fn http_status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" by GitHub (HTTP {code})"),
        None => String::new(),
    }
}

/// Result type alias for the pipeline.
pub type Result<T, E = Error> = std::result::Result<T, E>;
