//! Cryptographic primitives for vault encryption.

pub mod content;
pub mod key_wrap;
pub mod keys;
pub mod masterkey_file;
pub mod names;

use thiserror::Error;

/// Errors raised while deriving, wrapping or unwrapping key material.
///
/// Variants flagged `[INTEGRITY VIOLATION]` indicate tampering and should
/// be treated as security events.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// **[INTEGRITY VIOLATION]** The version MAC of the masterkey file does not verify.
    #[error("[INTEGRITY VIOLATION] HMAC verification failed - masterkey file tampered")]
    HmacVerificationFailed,

    /// Wrong passphrase, or a corrupted masterkey file. The two are
    /// cryptographically indistinguishable.
    #[error("Key unwrap failed - incorrect passphrase or corrupted/tampered vault")]
    KeyUnwrapIntegrityFailed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid scrypt parameters: {0}")]
    InvalidScryptParams(String),

    #[error("Invalid ciphertext length for key unwrap")]
    InvalidCiphertextLength,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key wrap failed: {0}")]
    KeyWrap(#[from] key_wrap::WrapError),

    #[error("Malformed masterkey file: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CryptoError {
    /// Whether this error means the passphrase was wrong.
    pub fn is_wrong_passphrase(&self) -> bool {
        matches!(self, CryptoError::KeyUnwrapIntegrityFailed)
    }
}

impl From<key_wrap::UnwrapError> for CryptoError {
    fn from(err: key_wrap::UnwrapError) -> Self {
        match err {
            key_wrap::UnwrapError::InvalidCiphertextLength
            | key_wrap::UnwrapError::CiphertextTooShort => CryptoError::InvalidCiphertextLength,
            key_wrap::UnwrapError::InvalidIntegrityCheck => CryptoError::KeyUnwrapIntegrityFailed,
        }
    }
}

pub use keys::MasterKey;
pub use masterkey_file::{MasterKeyFile, ScryptSettings};
