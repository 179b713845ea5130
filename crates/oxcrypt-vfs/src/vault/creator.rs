//! Initializing a new vault on a plain backend.

use std::sync::Arc;

use tracing::{info, instrument};

use super::{Vault, VaultError, ensure_directory, write_fully};
use crate::crypto::{MasterKey, MasterKeyFile};
use crate::error::Result;
use crate::feature::FindFeature;
use crate::session::Session;

/// Write a masterkey file and the root data directory for `vault`.
///
/// Fails with [`VaultError::AlreadyExists`] when the marker file is present.
/// On success the vault is left unlocked with the new key.
#[instrument(level = "debug", skip(session, vault, passphrase), fields(root = %vault.root()))]
pub fn create(session: &Arc<Session>, vault: &Vault, passphrase: &str) -> Result<Arc<MasterKey>> {
    let marker = vault.masterkey_path();
    let find = session.raw::<dyn FindFeature>()?;
    if find.find(&marker)? {
        return Err(VaultError::AlreadyExists {
            root: vault.root().clone(),
        }
        .into());
    }

    ensure_directory(session, vault.root())?;
    let key = MasterKey::random();
    let file = MasterKeyFile::create(&key, passphrase, vault.config().scrypt()).map_err(|source| {
        VaultError::Crypto {
            root: vault.root().clone(),
            source,
        }
    })?;
    let json = file.to_json().map_err(|source| VaultError::Crypto {
        root: vault.root().clone(),
        source,
    })?;
    write_fully(session, &marker, &json)?;

    let root_data = vault.data_dir(&key, "")?;
    let mut pending: Vec<_> = root_data
        .ancestors()
        .take_while(|dir| dir.is_descendant_of(vault.root()))
        .collect();
    pending.reverse();
    for directory in pending.iter().chain(std::iter::once(&root_data)) {
        ensure_directory(session, directory)?;
    }

    let key = Arc::new(key);
    vault.set_unlocked(Arc::clone(&key));
    info!("Vault created");
    Ok(key)
}
