#![forbid(unsafe_code)]

//! The `masterkey.cryptomator` file.
//!
//! Holds both master keys wrapped (RFC 3394) with a key encryption key
//! derived from the passphrase via scrypt, plus an HMAC over the legacy
//! version field.

use ring::hmac;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use tracing::{debug, instrument, warn};
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use super::key_wrap::{unwrap_key, wrap_key};
use super::{CryptoError, MasterKey};

const SCRYPT_SALT_LENGTH: usize = 8;
const SCRYPT_PARALLELIZATION: u32 = 1;

/// Legacy version field, fixed at 999 since vault format 8.
const MASTERKEY_FILE_VERSION: u32 = 999;

/// scrypt cost settings used when creating a masterkey file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptSettings {
    /// log2 of the cost parameter N.
    pub cost_log2: u8,
    /// Block size r.
    pub block_size: u32,
}

impl Default for ScryptSettings {
    /// N = 2^15, r = 8.
    fn default() -> Self {
        Self {
            cost_log2: 15,
            block_size: 8,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyFile {
    version: u32,

    #[serde_as(as = "Base64")]
    pub scrypt_salt: Vec<u8>,

    /// Cost parameter N, a power of two.
    pub scrypt_cost_param: i32,

    pub scrypt_block_size: i32,

    /// RFC 3394 wrapped AES master key.
    #[serde_as(as = "Base64")]
    pub primary_master_key: Vec<u8>,

    /// RFC 3394 wrapped MAC master key.
    #[serde_as(as = "Base64")]
    pub hmac_master_key: Vec<u8>,

    /// HMAC-SHA256 of the big-endian version.
    #[serde_as(as = "Base64")]
    pub version_mac: Vec<u8>,
}

impl MasterKeyFile {
    pub fn from_json(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Wrap `master_key` under `passphrase` with a fresh salt.
    #[instrument(level = "debug", skip(master_key, passphrase))]
    pub fn create(
        master_key: &MasterKey,
        passphrase: &str,
        settings: ScryptSettings,
    ) -> Result<Self, CryptoError> {
        let mut salt = vec![0u8; SCRYPT_SALT_LENGTH];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);

        let kek = derive_kek(passphrase, &salt, settings.cost_log2, settings.block_size)?;
        let kek = kek.expose_secret();

        // Encryption key first, then MAC key
        let primary_master_key = master_key.with_aes_key(|key| wrap_key(key, kek))?;
        let hmac_master_key = master_key.with_mac_key(|key| wrap_key(key, kek))?;

        let version_mac = master_key.with_mac_key(|key| {
            let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
            hmac::sign(&hmac_key, &MASTERKEY_FILE_VERSION.to_be_bytes())
                .as_ref()
                .to_vec()
        });

        debug!(cost_log2 = settings.cost_log2, "Created masterkey file");
        Ok(MasterKeyFile {
            version: MASTERKEY_FILE_VERSION,
            scrypt_salt: salt,
            scrypt_cost_param: 1i32 << settings.cost_log2,
            scrypt_block_size: i32::try_from(settings.block_size).map_err(|_| {
                CryptoError::InvalidScryptParams(format!("block size {}", settings.block_size))
            })?,
            primary_master_key,
            hmac_master_key,
            version_mac,
        })
    }

    /// Derive the KEK from `passphrase` and unwrap both master keys.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyUnwrapIntegrityFailed`: wrong passphrase or corrupted file
    /// - `CryptoError::HmacVerificationFailed`: **[INTEGRITY VIOLATION]** version tampered
    #[instrument(level = "debug", skip_all)]
    pub fn unlock(&self, passphrase: &str) -> Result<MasterKey, CryptoError> {
        let cost = u32::try_from(self.scrypt_cost_param)
            .ok()
            .filter(|n| n.is_power_of_two() && *n > 1)
            .ok_or_else(|| {
                CryptoError::InvalidScryptParams(format!(
                    "cost parameter {} is not a power of two",
                    self.scrypt_cost_param
                ))
            })?;
        let block_size = u32::try_from(self.scrypt_block_size).map_err(|_| {
            CryptoError::InvalidScryptParams(format!("block size {}", self.scrypt_block_size))
        })?;
        #[allow(clippy::cast_possible_truncation)]
        let cost_log2 = cost.trailing_zeros() as u8;

        let kek = derive_kek(passphrase, &self.scrypt_salt, cost_log2, block_size)?;
        let kek = kek.expose_secret();

        let aes_key = to_key(&unwrap_key(&self.primary_master_key, kek)?)?;
        let mac_key = to_key(&unwrap_key(&self.hmac_master_key, kek)?)?;

        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_key.as_slice());
        hmac::verify(&hmac_key, &self.version.to_be_bytes(), &self.version_mac).map_err(|_| {
            warn!("Masterkey version MAC mismatch");
            CryptoError::HmacVerificationFailed
        })?;

        Ok(MasterKey::new(*aes_key, *mac_key))
    }
}

fn to_key(bytes: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: bytes.len(),
    })?;
    Ok(Zeroizing::new(key))
}

/// scrypt(NFC(passphrase), salt) with p = 1.
fn derive_kek(
    passphrase: &str,
    salt: &[u8],
    cost_log2: u8,
    block_size: u32,
) -> Result<SecretBox<[u8; 32]>, CryptoError> {
    let normalized = Zeroizing::new(passphrase.nfc().collect::<String>());
    let params = scrypt::Params::new(cost_log2, block_size, SCRYPT_PARALLELIZATION, 32)
        .map_err(|e| {
            CryptoError::InvalidScryptParams(format!(
                "N=2^{cost_log2}, r={block_size}, p={SCRYPT_PARALLELIZATION}: {e}"
            ))
        })?;

    let mut kek = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(normalized.as_bytes(), salt, &params, &mut kek[..])
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(SecretBox::new(Box::new(*kek)))
}
