//! Callbacks supplied by the composing application.
//!
//! All callbacks are invoked synchronously on the thread running the
//! operation. Errors returned by a callback are propagated unchanged.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use secrecy::SecretString;

use crate::error::{FeatureError, Result};
use crate::path::Path;

/// Context handed to the password prompt.
#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub vault_root: Path,
    /// 1-based attempt number within the current unlock.
    pub attempt: u32,
    /// Set when the previous passphrase was rejected.
    pub previous_failed: bool,
}

/// The two outcomes of a password prompt.
pub enum Credentials {
    Password(SecretString),
    Cancel,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password([REDACTED])"),
            Credentials::Cancel => f.write_str("Cancel"),
        }
    }
}

/// Blocking password prompt used to unlock vaults.
pub trait PasswordCallback: Send + Sync {
    fn prompt(&self, request: &UnlockRequest) -> Credentials;
}

/// Prompt that always cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPasswordCallback;

impl PasswordCallback for DisabledPasswordCallback {
    fn prompt(&self, _request: &UnlockRequest) -> Credentials {
        Credentials::Cancel
    }
}

/// Prompt answering with a fixed passphrase.
pub struct StaticPasswordCallback(SecretString);

impl StaticPasswordCallback {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(SecretString::from(passphrase.into()))
    }
}

impl PasswordCallback for StaticPasswordCallback {
    fn prompt(&self, _request: &UnlockRequest) -> Credentials {
        Credentials::Password(self.0.clone())
    }
}

impl<F> PasswordCallback for F
where
    F: Fn(&UnlockRequest) -> Credentials + Send + Sync,
{
    fn prompt(&self, request: &UnlockRequest) -> Credentials {
        self(request)
    }
}

/// Connection-level cancellation, polled at every blocking I/O boundary.
pub trait ConnectionCallback: Send + Sync {
    fn is_cancelled(&self) -> bool;

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FeatureError::ConnectionCanceled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledConnectionCallback;

impl ConnectionCallback for DisabledConnectionCallback {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Cancellation flag that can be flipped from another thread.
#[derive(Debug, Default)]
pub struct CancellationFlag(AtomicBool);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ConnectionCallback for CancellationFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Told about every entry removed by a delete.
pub trait DeleteCallback: Send + Sync {
    fn deleted(&self, file: &Path);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDeleteCallback;

impl DeleteCallback for DisabledDeleteCallback {
    fn deleted(&self, _file: &Path) {}
}

/// Receives directory listings chunk by chunk.
///
/// Returning an error aborts the listing.
pub trait ListProgressListener: Send + Sync {
    fn chunk(&self, directory: &Path, entries: &[Path]) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledListProgressListener;

impl ListProgressListener for DisabledListProgressListener {
    fn chunk(&self, _directory: &Path, _entries: &[Path]) -> Result<()> {
        Ok(())
    }
}
