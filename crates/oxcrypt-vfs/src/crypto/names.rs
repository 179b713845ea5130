//! Name encryption and directory-id hashing.
//!
//! Names are encrypted with AES-SIV using the parent directory id as
//! associated data, so a ciphertext name only decrypts in the directory it
//! was created in. Directory ids are hashed into the two-level data
//! directory layout `d/XX/YYYY...`.

use std::fmt;

use aes_siv::{KeyInit, siv::Aes256Siv};
use base64::{Engine as _, engine::general_purpose};
use data_encoding::BASE32;
use ring::digest;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use super::MasterKey;

/// Suffix of every encrypted node name.
pub const ENCRYPTED_SUFFIX: &str = ".c9r";

/// Debugging context attached to name errors.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    pub encrypted_name: Option<String>,
    pub cleartext_name: Option<String>,
    pub dir_id: Option<String>,
}

impl NameContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_encrypted_name(mut self, name: impl Into<String>) -> Self {
        self.encrypted_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_cleartext_name(mut self, name: impl Into<String>) -> Self {
        self.cleartext_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_dir_id(mut self, dir_id: impl Into<String>) -> Self {
        self.dir_id = Some(dir_id.into());
        self
    }
}

impl fmt::Display for NameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref name) = self.cleartext_name {
            parts.push(format!("filename '{name}'"));
        } else if let Some(ref enc_name) = self.encrypted_name {
            let shown: String = enc_name.chars().take(40).collect();
            if shown.len() < enc_name.len() {
                parts.push(format!("encrypted name '{shown}...'"));
            } else {
                parts.push(format!("encrypted name '{shown}'"));
            }
        }

        if let Some(ref dir_id) = self.dir_id {
            if dir_id.is_empty() {
                parts.push("in directory <root>".to_string());
            } else {
                let shown: String = dir_id.chars().take(12).collect();
                parts.push(format!("in directory {shown}"));
            }
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

#[derive(Error, Debug)]
pub enum NameError {
    /// **[INTEGRITY VIOLATION]** The name was tampered with, encrypted under
    /// another key, or moved from another directory.
    #[error(
        "[INTEGRITY VIOLATION] Failed to decrypt {context}: authentication failed - possible tampering, wrong key, or filename moved between directories"
    )]
    DecryptionFailed { context: NameContext },

    #[error("Invalid base64 encoding for {context}: {reason}")]
    Base64Decode { reason: String, context: NameContext },

    #[error("Invalid UTF-8 after decryption for {context}: {reason}")]
    Utf8Decode { reason: String, context: NameContext },

    #[error("Unexpected encryption failure for {context}")]
    EncryptionFailed { context: NameContext },

    #[error("Failed to hash directory ID '{dir_id}': encryption error")]
    DirIdHashFailed { dir_id: String },
}

/// Hash a directory id into its storage location.
///
/// `BASE32(SHA1(AES-SIV(dir_id)))`, 32 characters. The data directory of
/// the directory is `d/<hash[..2]>/<hash[2..]>` below the vault root.
pub fn hash_dir_id(dir_id: &str, master_key: &MasterKey) -> Result<String, NameError> {
    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let no_associated_data: &[&[u8]] = &[];
        let encrypted = cipher
            .encrypt(no_associated_data, dir_id.as_bytes())
            .map_err(|_| NameError::DirIdHashFailed {
                dir_id: dir_id.to_string(),
            })?;

        let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
        Ok(BASE32.encode(hashed.as_ref()))
    })
}

/// Encrypt `name` for storage below the directory `parent_dir_id`.
///
/// Returns the base64url name including the `.c9r` suffix. The name is
/// NFC-normalized first so NFD input (macOS) maps to the same ciphertext.
pub fn encrypt_name(
    name: &str,
    parent_dir_id: &str,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let normalized: String = name.nfc().collect();

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let encrypted = cipher
            .encrypt(associated_data, normalized.as_bytes())
            .map_err(|_| NameError::EncryptionFailed {
                context: NameContext::new()
                    .with_cleartext_name(name)
                    .with_dir_id(parent_dir_id),
            })?;

        let mut encoded = general_purpose::URL_SAFE.encode(&encrypted);
        encoded.push_str(ENCRYPTED_SUFFIX);
        Ok(encoded)
    })
}

/// Decrypt a `.c9r` node name found below `parent_dir_id`.
pub fn decrypt_name(
    encrypted_name: &str,
    parent_dir_id: &str,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let context = || {
        NameContext::new()
            .with_encrypted_name(encrypted_name)
            .with_dir_id(parent_dir_id)
    };

    let stem = encrypted_name
        .strip_suffix(ENCRYPTED_SUFFIX)
        .unwrap_or(encrypted_name);

    // Padded is canonical; unpadded names come from other implementations
    let decoded = general_purpose::URL_SAFE
        .decode(stem)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(stem))
        .map_err(|e| NameError::Base64Decode {
            reason: e.to_string(),
            context: context(),
        })?;

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let decrypted = cipher
            .decrypt(associated_data, &decoded)
            .map_err(|_| NameError::DecryptionFailed { context: context() })?;

        String::from_utf8(decrypted).map_err(|e| NameError::Utf8Decode {
            reason: e.to_string(),
            context: context(),
        })
    })
}
