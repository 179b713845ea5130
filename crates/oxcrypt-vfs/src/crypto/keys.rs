#![forbid(unsafe_code)]

use std::fmt;

use generic_array::{GenericArray, typenum::U64};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroize;

/// Master key pair of an unlocked vault.
///
/// Holds the 256-bit AES encryption key and the 256-bit MAC key. Both are
/// kept in [`SecretBox`] containers, which zero their memory on drop, and
/// are only reachable through scoped accessors so key bytes never escape
/// into caller-owned buffers.
pub struct MasterKey {
    aes_master_key: SecretBox<[u8; 32]>,
    mac_master_key: SecretBox<[u8; 32]>,
}

impl MasterKey {
    /// Generate a new random key pair using the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        rand::rng().fill_bytes(&mut aes_key);
        rand::rng().fill_bytes(&mut mac_key);
        let key = Self::new(aes_key, mac_key);
        aes_key.zeroize();
        mac_key.zeroize();
        key
    }

    /// Create a key pair from raw key material.
    ///
    /// The caller is responsible for zeroing the source arrays.
    pub fn new(aes_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        MasterKey {
            aes_master_key: SecretBox::new(Box::new(aes_key)),
            mac_master_key: SecretBox::new(Box::new(mac_key)),
        }
    }

    /// Run `f` with the AES key.
    pub fn with_aes_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(self.aes_master_key.expose_secret())
    }

    /// Run `f` with the MAC key.
    pub fn with_mac_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(self.mac_master_key.expose_secret())
    }

    /// Run `f` with both keys in AES-SIV order (MAC || AES).
    ///
    /// The combined buffer is zeroed once `f` returns.
    pub fn with_siv_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&GenericArray<u8, U64>) -> R,
    {
        // GenericArray doesn't implement DefaultIsZeroes
        struct ZeroizeOnDrop(GenericArray<u8, U64>);

        impl Drop for ZeroizeOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroizeOnDrop(GenericArray::<u8, U64>::default());
        key.0[..32].copy_from_slice(self.mac_master_key.expose_secret());
        key.0[32..].copy_from_slice(self.aes_master_key.expose_secret());
        f(&key.0)
    }
}

impl Clone for MasterKey {
    fn clone(&self) -> Self {
        Self::new(
            *self.aes_master_key.expose_secret(),
            *self.mac_master_key.expose_secret(),
        )
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("aes_master_key", &"[REDACTED]")
            .field("mac_master_key", &"[REDACTED]")
            .finish()
    }
}
