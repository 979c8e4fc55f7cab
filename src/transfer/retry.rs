//! Failure classification for transfers
//!
//! Maps HTTP statuses and transport errors onto the recovery the engine
//! applies: re-authenticate, back off and retry, or give up.

use reqwest::{Error as ReqwestError, StatusCode};
use std::time::Duration;

/// Classification of a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network timeout or stalled connection
    NetworkTimeout,
    /// Connection refused, DNS failure
    NetworkOffline,
    /// HTTP 429
    RateLimit,
    /// HTTP 5xx
    ServerError(u16),
    /// HTTP 401/403
    AuthFailed(u16),
    /// Other 4xx
    ClientError(u16),
    /// Anything else on the transport
    NetworkGeneric,
}

impl FailureClass {
    /// Short description used in log lines
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::AuthFailed(401) => "authentication failed (401)",
            Self::AuthFailed(403) => "authentication failed (403)",
            Self::AuthFailed(_) => "authentication failed",
            Self::ClientError(code) => match code {
                404 => "resource not found",
                410 => "resource gone",
                _ => "client error",
            },
            Self::NetworkGeneric => "network error",
        }
    }

    /// Remediation hint shown after the final failure
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check your network connection and firewall settings",
            Self::NetworkOffline => "Verify internet connectivity and DNS resolution",
            Self::RateLimit => "Lower --concurrency or wait before retrying",
            Self::ServerError(_) => "The provider may be experiencing issues, try again later",
            Self::AuthFailed(_) => "Check the credentials stored for this provider in ~/.netrc",
            Self::ClientError(_) => "The product may have been removed or archived",
            Self::NetworkGeneric => "Check network connectivity and try again",
        }
    }

    /// Whether backing off and retrying may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthFailed(_) | Self::ClientError(_))
    }

    /// Whether fresh credentials may fix the failure
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }
}

/// Classify an HTTP status or reqwest error
pub fn classify(status: Option<StatusCode>, err: Option<&ReqwestError>) -> FailureClass {
    if let Some(status) = status {
        match status.as_u16() {
            401 | 403 => return FailureClass::AuthFailed(status.as_u16()),
            429 => return FailureClass::RateLimit,
            _ => {}
        }

        if status.is_server_error() {
            return FailureClass::ServerError(status.as_u16());
        }

        if status.is_client_error() {
            return FailureClass::ClientError(status.as_u16());
        }
    }

    if let Some(err) = err {
        if err.is_timeout() {
            return FailureClass::NetworkTimeout;
        }

        if err.is_connect() {
            return FailureClass::NetworkOffline;
        }
    }

    FailureClass::NetworkGeneric
}

/// Log line emitted before sleeping for a retry
pub fn format_retry(
    attempt: u32,
    max_attempts: u32,
    class: FailureClass,
    backoff: Duration,
    target: &str,
) -> String {
    format!(
        "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... ({})",
        attempt,
        max_attempts,
        class.description(),
        backoff.as_secs_f64(),
        target
    )
}
