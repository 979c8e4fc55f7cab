//! Error kinds shared by every layer
//!
//! Each module keeps its own `thiserror` enum with context; [`ErrorKind`] is
//! the fieldless classification callers branch on.

use std::fmt;

/// Fieldless error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed time, geometry or name constraint
    InvalidConstraint,
    /// Collection name absent from the provider table
    UnknownCollection,
    /// Collection known but not at the requested level
    UnsupportedLevel,
    /// Several rows match one `(sand_name, level)`
    AmbiguousCollection,
    /// Reference table missing or unreadable
    MissingReferenceData,
    /// No credential stored for the provider host
    MissingCredentials,
    /// Provider rejected the credentials
    AuthenticationError,
    /// Provider reports more matches than it returned
    TooManyMatches,
    /// Redirect chain longer than allowed
    RedirectLoop,
    /// 5xx, 429 or network failure after retries
    TransientServerError,
    /// 4xx other than authentication
    PermanentClientError,
    /// Size, checksum or name check failed
    VerificationMismatch,
    /// Operation not offered by the provider
    NotSupported,
    /// Requested item does not exist
    NotFound,
    /// Several products match a single product id
    AmbiguousProduct,
    /// Shutdown or deadline
    Cancelled,
    /// Filesystem failure
    Io,
    /// Unexpected payload shape
    Parse,
}

impl ErrorKind {
    /// Stable name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConstraint => "InvalidConstraint",
            ErrorKind::UnknownCollection => "UnknownCollection",
            ErrorKind::UnsupportedLevel => "UnsupportedLevel",
            ErrorKind::AmbiguousCollection => "AmbiguousCollection",
            ErrorKind::MissingReferenceData => "MissingReferenceData",
            ErrorKind::MissingCredentials => "MissingCredentials",
            ErrorKind::AuthenticationError => "AuthenticationError",
            ErrorKind::TooManyMatches => "TooManyMatches",
            ErrorKind::RedirectLoop => "RedirectLoop",
            ErrorKind::TransientServerError => "TransientServerError",
            ErrorKind::PermanentClientError => "PermanentClientError",
            ErrorKind::VerificationMismatch => "VerificationMismatch",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AmbiguousProduct => "AmbiguousProduct",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "Io",
            ErrorKind::Parse => "Parse",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
