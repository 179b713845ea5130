//! File content encryption.
//!
//! A ciphertext file is a 68-byte header followed by chunks. The header is
//! `nonce(12) || AES-GCM(0xFF * 8 || content_key(32)) || tag(16)` under the
//! master AES key. Each chunk carries up to 32 KiB of plaintext as
//! `nonce(12) || AES-GCM(chunk) || tag(16)` under the content key, with
//! `chunk_number (u64 BE) || header_nonce` as associated data. An empty file
//! is a header plus one empty chunk.

use std::fmt;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use tracing::{trace, warn};
use zeroize::Zeroizing;

use super::MasterKey;

pub const HEADER_SIZE: usize = 68;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const CHUNK_PLAINTEXT_SIZE: usize = 32 * 1024;
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
pub const CHUNK_CIPHERTEXT_SIZE: usize = CHUNK_PLAINTEXT_SIZE + CHUNK_OVERHEAD;

/// Debugging context attached to content errors.
#[derive(Debug, Clone, Default)]
pub struct ContentContext {
    pub path: Option<String>,
    pub chunk_number: Option<u64>,
}

impl ContentContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_chunk(mut self, chunk_number: u64) -> Self {
        self.chunk_number = Some(chunk_number);
        self
    }
}

impl fmt::Display for ContentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref path) = self.path {
            parts.push(format!("file '{path}'"));
        }
        if let Some(chunk) = self.chunk_number {
            parts.push(format!("chunk {chunk}"));
        }
        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum ContentError {
    /// **[INTEGRITY VIOLATION]**
    #[error(
        "Failed to decrypt header for {context}: invalid authentication tag - possible tampering or wrong key"
    )]
    HeaderDecryption { context: ContentContext },

    /// **[INTEGRITY VIOLATION]**
    #[error(
        "Failed to decrypt content for {context}: invalid authentication tag - possible tampering or wrong key"
    )]
    ContentDecryption { context: ContentContext },

    #[error("Invalid file header for {context}: {reason}")]
    InvalidHeader {
        reason: String,
        context: ContentContext,
    },

    #[error("Incomplete chunk for {context}: expected at least 28 bytes, got {actual_size}")]
    IncompleteChunk {
        context: ContentContext,
        actual_size: usize,
    },

    #[error("Failed to encrypt {context}: {reason}")]
    Encryption {
        reason: String,
        context: ContentContext,
    },
}

impl ContentError {
    #[must_use]
    pub fn with_context(self, context: ContentContext) -> Self {
        let merge = |old: ContentContext| ContentContext {
            path: context.path.clone().or(old.path),
            chunk_number: old.chunk_number.or(context.chunk_number),
        };
        match self {
            ContentError::HeaderDecryption { context } => {
                ContentError::HeaderDecryption { context: merge(context) }
            }
            ContentError::ContentDecryption { context } => {
                ContentError::ContentDecryption { context: merge(context) }
            }
            ContentError::InvalidHeader { reason, context } => ContentError::InvalidHeader {
                reason,
                context: merge(context),
            },
            ContentError::IncompleteChunk {
                context,
                actual_size,
            } => ContentError::IncompleteChunk {
                context: merge(context),
                actual_size,
            },
            ContentError::Encryption { reason, context } => ContentError::Encryption {
                reason,
                context: merge(context),
            },
        }
    }
}

/// Decrypted per-file header.
pub struct FileHeader {
    nonce: [u8; NONCE_SIZE],
    content_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

impl FileHeader {
    /// Fresh header with a random nonce and content key.
    pub fn random() -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut nonce);
        rand::rng().fill_bytes(&mut content_key[..]);
        FileHeader { nonce, content_key }
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    pub fn encrypt(&self, master_key: &MasterKey) -> Result<Vec<u8>, ContentError> {
        master_key.with_aes_key(|aes_key| {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(aes_key));

            let mut plaintext = Zeroizing::new(Vec::with_capacity(40));
            plaintext.extend_from_slice(&[0xFF; 8]);
            plaintext.extend_from_slice(&self.content_key[..]);

            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&self.nonce), plaintext.as_slice())
                .map_err(|e| ContentError::Encryption {
                    reason: e.to_string(),
                    context: ContentContext::new(),
                })?;

            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(&self.nonce);
            header.extend_from_slice(&ciphertext);
            Ok(header)
        })
    }

    pub fn decrypt(encrypted: &[u8], master_key: &MasterKey) -> Result<Self, ContentError> {
        if encrypted.len() != HEADER_SIZE {
            warn!(actual_size = encrypted.len(), "Invalid header size");
            return Err(ContentError::InvalidHeader {
                reason: format!("expected {HEADER_SIZE} bytes, got {}", encrypted.len()),
                context: ContentContext::new(),
            });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&encrypted[..NONCE_SIZE]);

        master_key.with_aes_key(|aes_key| {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(aes_key));
            let decrypted = Zeroizing::new(
                cipher
                    .decrypt(Nonce::from_slice(&nonce), &encrypted[NONCE_SIZE..])
                    .map_err(|_| {
                        warn!("Header decryption failed - authentication tag mismatch");
                        ContentError::HeaderDecryption {
                            context: ContentContext::new(),
                        }
                    })?,
            );

            if decrypted.len() != 40 {
                return Err(ContentError::InvalidHeader {
                    reason: format!("decrypted payload is {} bytes, expected 40", decrypted.len()),
                    context: ContentContext::new(),
                });
            }
            // Reserved bytes are not validated, matching other implementations.
            let mut content_key = Zeroizing::new([0u8; 32]);
            content_key.copy_from_slice(&decrypted[8..]);
            Ok(FileHeader { nonce, content_key })
        })
    }

    fn chunk_aad(&self, chunk_number: u64) -> [u8; 8 + NONCE_SIZE] {
        let mut aad = [0u8; 8 + NONCE_SIZE];
        aad[..8].copy_from_slice(&chunk_number.to_be_bytes());
        aad[8..].copy_from_slice(&self.nonce);
        aad
    }

    pub fn encrypt_chunk(&self, chunk_number: u64, plaintext: &[u8]) -> Result<Vec<u8>, ContentError> {
        trace!(chunk_number, len = plaintext.len(), "Encrypting chunk");
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.content_key[..]));
        let mut chunk_nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut chunk_nonce);

        let aad = self.chunk_aad(chunk_number);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&chunk_nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| ContentError::Encryption {
                reason: e.to_string(),
                context: ContentContext::new().with_chunk(chunk_number),
            })?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&chunk_nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt_chunk(&self, chunk_number: u64, encrypted: &[u8]) -> Result<Vec<u8>, ContentError> {
        trace!(chunk_number, len = encrypted.len(), "Decrypting chunk");
        if encrypted.len() < CHUNK_OVERHEAD {
            return Err(ContentError::IncompleteChunk {
                context: ContentContext::new().with_chunk(chunk_number),
                actual_size: encrypted.len(),
            });
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.content_key[..]));
        let aad = self.chunk_aad(chunk_number);
        cipher
            .decrypt(
                Nonce::from_slice(&encrypted[..NONCE_SIZE]),
                Payload {
                    msg: &encrypted[NONCE_SIZE..],
                    aad: &aad,
                },
            )
            .map_err(|_| ContentError::ContentDecryption {
                context: ContentContext::new().with_chunk(chunk_number),
            })
    }
}

/// Ciphertext size for `plaintext` bytes, counting the empty chunk of an empty file.
pub fn ciphertext_size(plaintext: u64) -> u64 {
    let chunk = CHUNK_PLAINTEXT_SIZE as u64;
    let chunks = plaintext.div_ceil(chunk).max(1);
    HEADER_SIZE as u64 + plaintext + chunks * CHUNK_OVERHEAD as u64
}

/// Plaintext size for a ciphertext of `ciphertext` bytes, `None` if no valid
/// file has that size.
pub fn plaintext_size(ciphertext: u64) -> Option<u64> {
    let body = ciphertext.checked_sub(HEADER_SIZE as u64)?;
    let full = body / CHUNK_CIPHERTEXT_SIZE as u64;
    let rest = body % CHUNK_CIPHERTEXT_SIZE as u64;
    let tail = match rest {
        0 => 0,
        r if r < CHUNK_OVERHEAD as u64 => return None,
        r => r - CHUNK_OVERHEAD as u64,
    };
    Some(full * CHUNK_PLAINTEXT_SIZE as u64 + tail)
}

/// Chunk containing the plaintext `offset` and the offset within it.
pub fn chunk_position(offset: u64) -> (u64, usize) {
    let chunk = CHUNK_PLAINTEXT_SIZE as u64;
    #[allow(clippy::cast_possible_truncation)]
    let within = (offset % chunk) as usize;
    (offset / chunk, within)
}

/// Ciphertext offset at which chunk `chunk_number` starts.
pub fn chunk_ciphertext_offset(chunk_number: u64) -> u64 {
    HEADER_SIZE as u64 + chunk_number * CHUNK_CIPHERTEXT_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MasterKey {
        MasterKey::new([0x01; 32], [0x02; 32])
    }

    #[test]
    fn test_header_round_trip() {
        let key = key();
        let header = FileHeader::random();
        let encrypted = header.encrypt(&key).unwrap();
        assert_eq!(encrypted.len(), HEADER_SIZE);

        let decrypted = FileHeader::decrypt(&encrypted, &key).unwrap();
        assert_eq!(decrypted.nonce(), header.nonce());
        let chunk = header.encrypt_chunk(0, b"hello").unwrap();
        assert_eq!(decrypted.decrypt_chunk(0, &chunk).unwrap(), b"hello");
    }

    #[test]
    fn test_tampered_header_rejected() {
        let key = key();
        let mut encrypted = FileHeader::random().encrypt(&key).unwrap();
        encrypted[20] ^= 0x01;
        assert!(matches!(
            FileHeader::decrypt(&encrypted, &key),
            Err(ContentError::HeaderDecryption { .. })
        ));
    }

    #[test]
    fn test_chunks_bound_to_position() {
        let header = FileHeader::random();
        let chunk = header.encrypt_chunk(3, b"data").unwrap();
        assert!(matches!(
            header.decrypt_chunk(4, &chunk),
            Err(ContentError::ContentDecryption { .. })
        ));
        assert!(matches!(
            header.decrypt_chunk(3, &chunk[..10]),
            Err(ContentError::IncompleteChunk { actual_size: 10, .. })
        ));
    }

    #[test]
    fn test_size_math() {
        assert_eq!(ciphertext_size(0), 96);
        assert_eq!(plaintext_size(96), Some(0));
        assert_eq!(plaintext_size(HEADER_SIZE as u64), Some(0));
        assert_eq!(plaintext_size(10), None);
        assert_eq!(plaintext_size(HEADER_SIZE as u64 + 5), None);
        for size in [1, 100, 32 * 1024, 32 * 1024 + 1, 100_000] {
            assert_eq!(plaintext_size(ciphertext_size(size)), Some(size), "size {size}");
        }
    }

    #[test]
    fn test_chunk_position() {
        assert_eq!(chunk_position(0), (0, 0));
        assert_eq!(chunk_position(32 * 1024 + 5), (1, 5));
        assert_eq!(chunk_ciphertext_offset(1), 68 + 32 * 1024 + 28);
    }

    #[test]
    fn test_context_display() {
        let ctx = ContentContext::new().with_path("/v/a.txt").with_chunk(2);
        assert_eq!(ctx.to_string(), "file '/v/a.txt', chunk 2");
        let err = ContentError::ContentDecryption {
            context: ContentContext::new().with_chunk(2),
        }
        .with_context(ContentContext::new().with_path("/v/a.txt"));
        assert!(err.to_string().contains("file '/v/a.txt', chunk 2"));
    }
}
