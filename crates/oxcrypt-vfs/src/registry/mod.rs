//! Vault discovery and lifecycle.
//!
//! The registry maps paths to the vault containing them. Vaults are found
//! lazily: a lookup probes the path and its ancestors for the masterkey
//! marker, nearest first, and remembers both hits and misses. Discovered
//! vaults stay registered per session until closed.
//!
//! Probes of one directory are serialized so concurrent lookups trigger a
//! single backend check. Negative results expire after
//! [`RegistryConfig::negative_ttl`].

pub mod features;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::callback::PasswordCallback;
use crate::config::RegistryConfig;
use crate::crypto::MasterKey;
use crate::error::{FeatureError, Result};
use crate::feature::FindFeature;
use crate::path::Path;
use crate::session::{Session, SessionId};
use crate::vault::{Vault, creator};

/// Whether a lookup may touch the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Probe the backend for markers and unlock what is found.
    Allowed,
    /// Answer from already registered vaults only. Never does I/O or prompts.
    CacheOnly,
}

type VaultKey = (SessionId, String);

pub struct VaultRegistry {
    config: RegistryConfig,
    prompt: Arc<dyn PasswordCallback>,
    vaults: DashMap<VaultKey, Arc<Vault>>,
    /// Per-directory gates serializing concurrent probes.
    probes: DashMap<VaultKey, Arc<Mutex<()>>>,
    /// Directories known not to be vault roots.
    misses: Cache<VaultKey, ()>,
}

impl fmt::Debug for VaultRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultRegistry")
            .field("enabled", &self.config.enabled)
            .field("vaults", &self.vaults.len())
            .finish_non_exhaustive()
    }
}

impl VaultRegistry {
    pub fn new(config: RegistryConfig, prompt: Arc<dyn PasswordCallback>) -> Self {
        let misses = Cache::builder()
            .max_capacity(config.negative_cache_capacity)
            .time_to_live(config.negative_ttl)
            .build();
        Self {
            config,
            prompt,
            vaults: DashMap::new(),
            probes: DashMap::new(),
            misses,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The vault containing `path`, if any. The vault may still be locked.
    ///
    /// Registered vaults win by longest root. With [`Discovery::Allowed`]
    /// unregistered ancestors are probed, nearest first.
    #[instrument(level = "trace", skip(self, session), fields(session = %session.id()))]
    pub fn lookup(
        &self,
        session: &Arc<Session>,
        path: &Path,
        discovery: Discovery,
    ) -> Result<Option<Arc<Vault>>> {
        if !self.config.enabled {
            return Ok(None);
        }
        if let Some(vault) = self.registered(session.id(), path) {
            return Ok(Some(vault));
        }
        if discovery == Discovery::CacheOnly {
            return Ok(None);
        }

        let own = path.is_directory().then(|| path.clone());
        for directory in own.into_iter().chain(path.ancestors()) {
            if let Some(vault) = self.probe(session, &directory)? {
                return Ok(Some(vault));
            }
        }
        Ok(None)
    }

    /// Like [`lookup`](Self::lookup), unlocking the vault when discovery is
    /// allowed and `path` lies inside it. The root itself is plain ciphertext
    /// and never prompts.
    pub fn find(
        &self,
        session: &Arc<Session>,
        path: &Path,
        discovery: Discovery,
    ) -> Result<Option<Arc<Vault>>> {
        let vault = self.lookup(session, path, discovery)?;
        if discovery == Discovery::Allowed
            && let Some(vault) = &vault
            && !vault.is_root(path)
        {
            self.unlock(session, vault)?;
        }
        Ok(vault)
    }

    pub fn unlock(&self, session: &Arc<Session>, vault: &Vault) -> Result<Arc<MasterKey>> {
        vault.unlock(session, self.prompt.as_ref())
    }

    fn registered(&self, session: SessionId, path: &Path) -> Option<Arc<Vault>> {
        self.vaults
            .iter()
            .filter(|entry| entry.key().0 == session && entry.value().contains(path))
            .max_by_key(|entry| entry.value().root().depth())
            .map(|entry| Arc::clone(entry.value()))
    }

    fn probe(&self, session: &Arc<Session>, directory: &Path) -> Result<Option<Arc<Vault>>> {
        let key = (session.id(), directory.as_str().to_string());
        if self.misses.contains_key(&key) {
            return Ok(None);
        }

        let gate = Arc::clone(&self.probes.entry(key.clone()).or_default());
        let result = {
            let _probing = gate.lock();
            if let Some(vault) = self.vaults.get(&key).map(|entry| Arc::clone(entry.value())) {
                Ok(Some(vault))
            } else if self.misses.contains_key(&key) {
                Ok(None)
            } else {
                self.probe_backend(session, directory, key.clone())
            }
        };
        drop(gate);
        self.probes.remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    fn probe_backend(
        &self,
        session: &Arc<Session>,
        directory: &Path,
        key: VaultKey,
    ) -> Result<Option<Arc<Vault>>> {
        let marker = directory.child_file(&self.config.vault.masterkey_filename);
        let find = session.raw::<dyn FindFeature>()?;
        match find.find(&marker) {
            Ok(true) => Ok(Some(self.register(session.id(), directory))),
            Ok(false) | Err(FeatureError::NotFound { .. }) => {
                trace!(directory = %directory, "No vault");
                self.misses.insert(key, ());
                Ok(None)
            }
            Err(FeatureError::AccessDenied { reason, .. }) => {
                debug!(directory = %directory, %reason, "Vault probe denied, treating as plain");
                self.misses.insert(key, ());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Register the vault rooted at `root`, returning the existing one if known.
    pub fn register(&self, session: SessionId, root: &Path) -> Arc<Vault> {
        let key = (session, root.as_str().to_string());
        self.misses.invalidate(&key);
        let entry = self.vaults.entry(key).or_insert_with(|| {
            info!(root = %root, %session, "Vault discovered");
            Arc::new(Vault::new(
                root.clone(),
                session,
                self.config.vault.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Initialize a new vault at `root` and register it unlocked.
    pub fn create_vault(
        &self,
        session: &Arc<Session>,
        root: &Path,
        passphrase: &str,
    ) -> Result<Arc<Vault>> {
        let vault = Arc::new(Vault::new(
            root.clone(),
            session.id(),
            self.config.vault.clone(),
        ));
        creator::create(session, &vault, passphrase)?;
        let key = (session.id(), root.as_str().to_string());
        self.misses.invalidate(&key);
        self.vaults.insert(key, Arc::clone(&vault));
        Ok(vault)
    }

    /// Lock and forget the vault rooted at `root`.
    pub fn close(&self, session: SessionId, root: &Path) {
        if let Some((_, vault)) = self.vaults.remove(&(session, root.as_str().to_string())) {
            vault.lock();
            info!(root = %root, "Vault closed");
        }
    }

    /// Close every vault whose root is `path` or lies below it.
    pub fn close_within(&self, session: SessionId, path: &Path) {
        let roots: Vec<Path> = self
            .vaults
            .iter()
            .filter(|entry| entry.key().0 == session && entry.value().root().is_within(path))
            .map(|entry| entry.value().root().clone())
            .collect();
        for root in roots {
            self.close(session, &root);
        }
    }

    /// Close every vault of `session`.
    pub fn clear_session(&self, session: SessionId) {
        self.vaults.retain(|key, vault| {
            if key.0 == session {
                vault.lock();
                false
            } else {
                true
            }
        });
        self.misses.invalidate_all();
    }

    /// Close every vault of every session.
    pub fn clear(&self) {
        for entry in &self.vaults {
            entry.value().lock();
        }
        self.vaults.clear();
        self.misses.invalidate_all();
    }

    /// Registered vaults of `session`.
    pub fn vaults(&self, session: SessionId) -> Vec<Arc<Vault>> {
        self.vaults
            .iter()
            .filter(|entry| entry.key().0 == session)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
