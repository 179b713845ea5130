//! Error taxonomy shared by every feature.
//!
//! Backend failures are mapped into [`FeatureError`] at the backend boundary
//! (see [`FeatureError::from_io`]); vault and crypto failures are carried in
//! [`FeatureError::Vault`] with their own context-rich types.

use std::io;

use thiserror::Error;

use crate::path::Path;

pub use crate::crypto::CryptoError;
pub use crate::crypto::content::{ContentContext, ContentError};
pub use crate::crypto::names::{NameContext, NameError};
pub use crate::vault::VaultError;

/// Result alias used by all features.
pub type Result<T, E = FeatureError> = std::result::Result<T, E>;

/// Coarse classification used by callers to choose how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    AccessDenied,
    /// User or connection cancellation; never offer "retry".
    Canceled,
    /// Backend I/O failure; safe to offer "retry".
    Transfer,
    Unsupported,
    /// Partially applied operation that needs user attention.
    Incomplete,
    /// Vault key or integrity failure.
    Vault,
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("{path} not found")]
    NotFound { path: Path },

    #[error("{path} already exists")]
    AlreadyExists { path: Path },

    #[error("access denied to {path}: {reason}")]
    AccessDenied { path: Path, reason: String },

    /// The user declined the unlock prompt for the vault at `root`.
    #[error("unlock of vault {root} canceled by user")]
    VaultUnlockCancel { root: Path },

    #[error("transfer of {path} failed: {reason}")]
    TransferFailure {
        path: Path,
        reason: String,
        #[source]
        cause: Option<io::Error>,
    },

    #[error("{capability} is not supported by {backend}")]
    Unsupported {
        capability: &'static str,
        backend: String,
    },

    #[error("connection canceled")]
    ConnectionCanceled,

    /// An emulated move copied `from` to `to` but could not remove `from`.
    ///
    /// Both copies exist. Retrying the move blindly would duplicate work.
    #[error("moved {from} to {to} but the source could not be deleted: {cause}")]
    MoveIncomplete {
        from: Path,
        to: Path,
        #[source]
        cause: Box<FeatureError>,
    },

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl FeatureError {
    /// Map an I/O error reported for `path` into the taxonomy.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FeatureError::NotFound { path: path.clone() },
            io::ErrorKind::AlreadyExists => FeatureError::AlreadyExists { path: path.clone() },
            io::ErrorKind::PermissionDenied => FeatureError::AccessDenied {
                path: path.clone(),
                reason: err.to_string(),
            },
            // Errors raised by our own stream adapters travel as io::Error::other.
            _ if err.get_ref().is_some_and(|inner| inner.is::<FeatureError>()) => {
                match err.into_inner().map(|inner| inner.downcast::<FeatureError>()) {
                    Some(Ok(feature)) => *feature,
                    _ => FeatureError::transfer(path, "unrecognized stream error"),
                }
            }
            _ => FeatureError::TransferFailure {
                path: path.clone(),
                reason: err.to_string(),
                cause: Some(err),
            },
        }
    }

    pub fn transfer(path: &Path, reason: impl Into<String>) -> Self {
        FeatureError::TransferFailure {
            path: path.clone(),
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn not_found(path: &Path) -> Self {
        FeatureError::NotFound { path: path.clone() }
    }

    /// Wrap this error for transport through `std::io` traits.
    pub fn into_io(self) -> io::Error {
        match self {
            FeatureError::NotFound { .. } => io::Error::new(io::ErrorKind::NotFound, self),
            FeatureError::AccessDenied { .. } => {
                io::Error::new(io::ErrorKind::PermissionDenied, self)
            }
            other => io::Error::other(other),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FeatureError::NotFound { .. } => ErrorCategory::NotFound,
            FeatureError::AccessDenied { .. } => ErrorCategory::AccessDenied,
            FeatureError::VaultUnlockCancel { .. } | FeatureError::ConnectionCanceled => {
                ErrorCategory::Canceled
            }
            FeatureError::AlreadyExists { .. } | FeatureError::TransferFailure { .. } => {
                ErrorCategory::Transfer
            }
            FeatureError::Unsupported { .. } => ErrorCategory::Unsupported,
            FeatureError::MoveIncomplete { .. } => ErrorCategory::Incomplete,
            FeatureError::Vault(_) => ErrorCategory::Vault,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.category() == ErrorCategory::Canceled
    }

    /// Only genuine backend I/O failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeatureError::TransferFailure { .. })
    }
}
