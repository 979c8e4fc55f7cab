//! Resilient transfer engine
//!
//! A [`TransferRequest`] moves through an explicit state machine:
//!
//! ```text
//! Planning -> Requesting -> Redirecting -> Streaming -> Verifying -> Decompressing -> Done
//!                                    \___________ any state ___________/-> Failed
//! ```
//!
//! Bytes are written to `<target>.part` and renamed into place only after
//! verification, so a cancelled or failed transfer never leaves a partially
//! named final file.

pub mod archive;
pub mod config;
pub mod engine;
pub mod lock;
pub mod progress;
pub mod request;
pub mod retry;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::error::ErrorKind;
use retry::FailureClass;

pub use archive::{name_difference, ArchiveError, ArchiveUnpacker, Unpacker};
pub use config::TransferConfig;
pub use engine::{CredentialRefresher, TransferEngine, TransferOutcome, TransferStatus};
pub use progress::TransferObserver;
pub use request::{
    compression_suffix, strip_compression_suffix, Credential, ExistsPolicy, SourceLocator,
    TransferRequest,
};

/// States of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Applying the exists policy
    Planning,
    /// Sending the request
    Requesting,
    /// Following a redirect hop
    Redirecting,
    /// Writing the body to the partial file
    Streaming,
    /// Checking size and digest
    Verifying,
    /// Unpacking and reconciling the product name
    Decompressing,
    /// Final file in place
    Done,
    /// Terminal failure
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Planning => "planning",
            TransferState::Requesting => "requesting",
            TransferState::Redirecting => "redirecting",
            TransferState::Streaming => "streaming",
            TransferState::Verifying => "verifying",
            TransferState::Decompressing => "decompressing",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Target exists and the policy is `Error`
    #[error("Target already exists: {}", .0.display())]
    TargetExists(PathBuf),

    /// Another transfer holds the target lock
    #[error("Target is being written by another transfer: {}", .0.display())]
    TargetBusy(PathBuf),

    /// The request could not be built
    #[error("Invalid request for {url}: {message}")]
    InvalidRequest {
        /// Offending URL
        url: String,
        /// Reason
        message: String,
    },

    /// Too many redirect hops
    #[error("Redirect loop: gave up after {hops} redirects starting at {url}")]
    RedirectLoop {
        /// First URL of the chain
        url: String,
        /// Hops seen, including the rejected one
        hops: u32,
    },

    /// 401/403 from the server
    #[error("Authentication rejected (HTTP {status}) at {url}")]
    Authentication {
        /// Status code
        status: u16,
        /// URL that rejected the credential
        url: String,
    },

    /// 5xx, 429 or a network error
    #[error("{} at {url}: {message}", .class.description())]
    Transient {
        /// Status code, `None` for network errors
        status: Option<u16>,
        /// Classification
        class: FailureClass,
        /// URL of the failed request
        url: String,
        /// Server or transport message
        message: String,
    },

    /// 4xx other than authentication
    #[error("Request to {url} failed with HTTP {status}: {message}")]
    PermanentClient {
        /// Status code
        status: u16,
        /// URL of the failed request
        url: String,
        /// Server message
        message: String,
    },

    /// Retry budget spent on transient failures
    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Last failure
        source: Box<TransferError>,
    },

    /// Size, digest or name check failed
    #[error("Verification failed: expected {what} '{expected}', found '{actual}'")]
    VerificationMismatch {
        /// What was checked ("size", "sha256", "name")
        what: &'static str,
        /// Expected value
        expected: String,
        /// Actual value
        actual: String,
        /// Archive kept for inspection
        archive: Option<PathBuf>,
    },

    /// Archive could not be unpacked; the archive is kept
    #[error("Failed to unpack {}: {message}", .archive.display())]
    Unpack {
        /// Archive path
        archive: PathBuf,
        /// Unpacker message
        message: String,
    },

    /// Fresh credentials could not be obtained
    #[error("Credential refresh failed: {0}")]
    CredentialRefresh(String),

    /// Shutdown requested or deadline exceeded
    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Build the error matching a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, url: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match retry::classify(Some(status), None) {
            FailureClass::AuthFailed(code) => TransferError::Authentication {
                status: code,
                url: url.to_string(),
            },
            class if class.is_retryable() => TransferError::Transient {
                status: Some(status.as_u16()),
                class,
                url: url.to_string(),
                message,
            },
            _ => TransferError::PermanentClient {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            },
        }
    }

    /// Build the error matching a transport failure
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_builder() {
            return TransferError::InvalidRequest {
                url: url.to_string(),
                message: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return Self::from_status(status, url, err.to_string());
        }
        TransferError::Transient {
            status: None,
            class: retry::classify(None, Some(&err)),
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    /// Fieldless classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::TargetExists(_) | TransferError::TargetBusy(_) | TransferError::Io(_) => {
                ErrorKind::Io
            }
            TransferError::PermanentClient { status: 404, .. } => ErrorKind::NotFound,
            TransferError::InvalidRequest { .. } | TransferError::PermanentClient { .. } => {
                ErrorKind::PermanentClientError
            }
            TransferError::RedirectLoop { .. } => ErrorKind::RedirectLoop,
            TransferError::Authentication { .. } | TransferError::CredentialRefresh(_) => {
                ErrorKind::AuthenticationError
            }
            TransferError::Transient { .. } | TransferError::RetriesExhausted { .. } => {
                ErrorKind::TransientServerError
            }
            TransferError::VerificationMismatch { .. } | TransferError::Unpack { .. } => {
                ErrorKind::VerificationMismatch
            }
            TransferError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether backing off and retrying may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    /// Whether fresh credentials may fix the failure
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, TransferError::Authentication { .. })
    }

    /// Classification of the underlying HTTP failure, if any
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            TransferError::Transient { class, .. } => Some(*class),
            TransferError::Authentication { status, .. } => Some(FailureClass::AuthFailed(*status)),
            TransferError::PermanentClient { status, .. } => Some(FailureClass::ClientError(*status)),
            TransferError::RetriesExhausted { source, .. } => source.failure_class(),
            _ => None,
        }
    }
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;
