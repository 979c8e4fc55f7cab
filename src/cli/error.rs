//! CLI error types and conversions

use crate::constraint::ConstraintError;
use crate::provider::{CredentialError, ProviderError};
use crate::registry::RegistryError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Provider operation failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Reference table error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Malformed constraint flag
    #[error("invalid constraint: {0}")]
    Constraint(#[from] ConstraintError),

    /// Credential store unreadable
    #[error("credential error: {0}")]
    Credentials(#[from] CredentialError),

    /// Some downloads of a batch failed
    #[error("{failed} of {total} downloads failed")]
    DownloadsFailed {
        /// Failed transfers
        failed: usize,
        /// Transfers attempted
        total: usize,
    },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Output serialization failed
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
