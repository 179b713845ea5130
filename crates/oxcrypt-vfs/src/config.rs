//! Configuration for features, the vault registry and vaults.
//!
//! Every struct deserializes with serde (missing fields take their defaults,
//! durations use humantime strings such as `"30s"`) and offers builder-style
//! setters for programmatic use.

use std::time::Duration;

use serde::Deserialize;

use crate::crypto::ScryptSettings;

/// Default name of the vault marker file.
pub const DEFAULT_MASTERKEY_FILENAME: &str = "masterkey.cryptomator";

/// Default name of the ciphertext data directory below a vault root.
pub const DEFAULT_DATA_DIR: &str = "d";

/// How long a directory known not to be a vault root stays cached.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// How an existence check treats an access-denied parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDeniedPolicy {
    /// Report the entry as existing, so callers never overwrite blindly.
    #[default]
    AssumeExists,
    /// Surface the `AccessDenied` error.
    Propagate,
}

/// Settings for a single vault.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Marker file whose presence makes a directory a vault root.
    pub masterkey_filename: String,
    pub data_dir: String,
    /// log2 of the scrypt cost used when creating vaults.
    pub scrypt_cost_log2: u8,
    pub scrypt_block_size: u32,
    /// Prompts per unlock before giving up on a wrong passphrase.
    pub max_unlock_attempts: u32,
    /// Cached directory-id lookups per vault.
    pub dir_id_cache_capacity: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        let scrypt = ScryptSettings::default();
        Self {
            masterkey_filename: DEFAULT_MASTERKEY_FILENAME.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            scrypt_cost_log2: scrypt.cost_log2,
            scrypt_block_size: scrypt.block_size,
            max_unlock_attempts: 3,
            dir_id_cache_capacity: 4096,
        }
    }
}

impl VaultConfig {
    #[must_use]
    pub fn masterkey_filename(mut self, name: impl Into<String>) -> Self {
        self.masterkey_filename = name.into();
        self
    }

    #[must_use]
    pub fn scrypt_cost_log2(mut self, cost_log2: u8) -> Self {
        self.scrypt_cost_log2 = cost_log2;
        self
    }

    #[must_use]
    pub fn max_unlock_attempts(mut self, attempts: u32) -> Self {
        self.max_unlock_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn dir_id_cache_capacity(mut self, capacity: u64) -> Self {
        self.dir_id_cache_capacity = capacity;
        self
    }

    pub fn scrypt(&self) -> ScryptSettings {
        ScryptSettings {
            cost_log2: self.scrypt_cost_log2,
            block_size: self.scrypt_block_size,
        }
    }
}

/// Settings for the vault registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// With the registry disabled every path is treated as plain.
    pub enabled: bool,
    /// TTL for "no vault here" probe results.
    #[serde(with = "humantime_serde")]
    pub negative_ttl: Duration,
    /// Upper bound on cached negative probe results.
    pub negative_cache_capacity: u64,
    pub vault: VaultConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            negative_cache_capacity: 10_000,
            vault: VaultConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Registry that never discovers vaults.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    #[must_use]
    pub fn vault(mut self, vault: VaultConfig) -> Self {
        self.vault = vault;
        self
    }
}

/// Settings for the composed default features.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub access_denied: AccessDeniedPolicy,
    /// Buffer size for streamed copies.
    pub copy_buffer_size: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            access_denied: AccessDeniedPolicy::AssumeExists,
            copy_buffer_size: 64 * 1024,
        }
    }
}

impl FeatureConfig {
    #[must_use]
    pub fn access_denied(mut self, policy: AccessDeniedPolicy) -> Self {
        self.access_denied = policy;
        self
    }

    #[must_use]
    pub fn copy_buffer_size(mut self, size: usize) -> Self {
        self.copy_buffer_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.negative_ttl, Duration::from_secs(30));
        assert_eq!(config.vault.masterkey_filename, "masterkey.cryptomator");
        assert_eq!(config.vault.scrypt_cost_log2, 15);
        assert_eq!(config.vault.max_unlock_attempts, 3);
        assert_eq!(
            FeatureConfig::default().access_denied,
            AccessDeniedPolicy::AssumeExists
        );
    }

    #[test]
    fn test_builder_pattern() {
        let config = RegistryConfig::default()
            .negative_ttl(Duration::from_millis(500))
            .vault(VaultConfig::default().scrypt_cost_log2(10).max_unlock_attempts(0));
        assert_eq!(config.negative_ttl, Duration::from_millis(500));
        assert_eq!(config.vault.scrypt().cost_log2, 10);
        assert_eq!(config.vault.max_unlock_attempts, 1);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{ "negative_ttl": "2m", "vault": { "max_unlock_attempts": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.negative_ttl, Duration::from_secs(120));
        assert_eq!(config.vault.max_unlock_attempts, 5);
        assert_eq!(config.vault.data_dir, "d");

        let features: FeatureConfig =
            serde_json::from_str(r#"{ "access_denied": "propagate" }"#).unwrap();
        assert_eq!(features.access_denied, AccessDeniedPolicy::Propagate);
    }
}
