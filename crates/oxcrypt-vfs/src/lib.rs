//! File operation features over pluggable storage backends, with Cryptomator
//! vaults encrypted and decrypted transparently wherever they are found.
//!
//! A [`Session`] hands out capabilities such as [`MoveFeature`] or
//! [`ListFeature`]. When the session has a [`VaultRegistry`], every feature
//! is wrapped so that paths inside a vault are routed through the vault's
//! encryption layer and everything else goes straight to the backend.

pub mod backend;
pub mod callback;
pub mod config;
pub mod crypto;
pub mod error;
pub mod feature;
pub mod path;
pub mod registry;
pub mod session;
pub mod status;
pub mod vault;

pub use callback::{
    ConnectionCallback, Credentials, DeleteCallback, ListProgressListener, PasswordCallback,
    UnlockRequest,
};
pub use config::{AccessDeniedPolicy, FeatureConfig, RegistryConfig, VaultConfig};
pub use error::{ErrorCategory, FeatureError, Result};
pub use feature::{
    AttributedList, CopyFeature, DeleteFeature, DirectoryFeature, FindFeature, ListFeature,
    MoveFeature, ReadFeature, TouchFeature, WriteFeature, WriteStream,
};
pub use path::{EntryType, Path, PathAttributes};
pub use registry::{Discovery, VaultRegistry};
pub use session::{Backend, Capability, Session, SessionId};
pub use status::TransferStatus;
pub use vault::{Vault, VaultError};
