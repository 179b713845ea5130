//! Encrypted vaults on top of a plain backend.
//!
//! A vault is a directory holding a masterkey file and a `d/` data tree. Its
//! plaintext hierarchy is stored flattened: every directory has a random id,
//! its entries live below `d/<hash[..2]>/<hash[2..]>` with encrypted names,
//! and a subdirectory is represented by a `<name>.c9r/` node whose `dir.c9r`
//! file holds the child's id. The root directory has the empty id.
//!
//! [`Vault`] owns the unlock state and the directory-id cache. The
//! [`features`] module maps each capability onto ciphertext I/O.

pub mod creator;
pub mod features;
pub mod stream;

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use moka::sync::Cache;
use parking_lot::{Condvar, Mutex};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::callback::{Credentials, DisabledConnectionCallback, PasswordCallback, UnlockRequest};
use crate::config::VaultConfig;
use crate::crypto::content::ContentError;
use crate::crypto::names::{self, NameError};
use crate::crypto::{CryptoError, MasterKey, MasterKeyFile};
use crate::error::{FeatureError, Result};
use crate::feature::{DirectoryFeature, ReadFeature, WriteFeature};
use crate::path::{EntryType, Path};
use crate::session::{Session, SessionId};
use crate::status::TransferStatus;

/// File inside a directory node holding the directory's id.
pub const DIR_ID_FILE: &str = "dir.c9r";

/// Directory-id backup some implementations keep inside each data directory.
pub const DIR_ID_BACKUP_FILE: &str = "dirid.c9r";

/// Upper bound on the length of a stored directory id.
const MAX_DIR_ID_LENGTH: usize = 36;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("vault {root} is locked")]
    Locked { root: Path },

    #[error("incorrect passphrase for vault {root} after {attempts} attempt(s)")]
    IncorrectPassphrase { root: Path, attempts: u32 },

    #[error("vault {root}: {source}")]
    Crypto {
        root: Path,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Content(#[from] ContentError),

    /// **[INTEGRITY VIOLATION]** A `dir.c9r` file is empty, oversized or not UTF-8.
    #[error("[INTEGRITY VIOLATION] invalid directory id in {path}: {reason}")]
    InvalidDirId { path: Path, reason: String },

    #[error("a vault already exists at {root}")]
    AlreadyExists { root: Path },

    #[error("unlock of vault {root} failed: {reason}")]
    UnlockFailed { root: Path, reason: String },
}

impl From<NameError> for FeatureError {
    fn from(err: NameError) -> Self {
        FeatureError::Vault(VaultError::Name(err))
    }
}

impl From<ContentError> for FeatureError {
    fn from(err: ContentError) -> Self {
        FeatureError::Vault(VaultError::Content(err))
    }
}

enum UnlockState {
    Locked,
    /// An unlock is running; other callers wait on the flight.
    Unlocking(Arc<Flight>),
    Unlocked(Arc<MasterKey>),
}

/// Result of one unlock, shared by everyone who waited for it.
#[derive(Clone)]
enum Outcome {
    Unlocked(Arc<MasterKey>),
    Canceled,
    IncorrectPassphrase(u32),
    Failed(String),
}

impl Outcome {
    fn of(result: &Result<Arc<MasterKey>>) -> Self {
        match result {
            Ok(key) => Outcome::Unlocked(Arc::clone(key)),
            Err(FeatureError::VaultUnlockCancel { .. }) => Outcome::Canceled,
            Err(FeatureError::Vault(VaultError::IncorrectPassphrase { attempts, .. })) => {
                Outcome::IncorrectPassphrase(*attempts)
            }
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    fn into_result(self, root: &Path) -> Result<Arc<MasterKey>> {
        match self {
            Outcome::Unlocked(key) => Ok(key),
            Outcome::Canceled => Err(FeatureError::VaultUnlockCancel { root: root.clone() }),
            Outcome::IncorrectPassphrase(attempts) => Err(VaultError::IncorrectPassphrase {
                root: root.clone(),
                attempts,
            }
            .into()),
            Outcome::Failed(reason) => Err(VaultError::UnlockFailed {
                root: root.clone(),
                reason,
            }
            .into()),
        }
    }
}

#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
    /// Set when the vault is locked while the flight runs. The key it
    /// produces is handed to the waiters but not kept.
    aborted: AtomicBool,
}

impl Flight {
    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn complete(&self, result: Outcome) {
        *self.outcome.lock() = Some(result);
        self.done.notify_all();
    }
}

/// Publishes the leader's outcome, including when the leader unwinds.
struct LeaderGuard<'a> {
    vault: &'a Vault,
    flight: Arc<Flight>,
    outcome: Option<Outcome>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Outcome::Failed("unlock aborted".to_string()));
        *self.vault.state.lock() = match &outcome {
            Outcome::Unlocked(key) if !self.flight.is_aborted() => {
                UnlockState::Unlocked(Arc::clone(key))
            }
            _ => UnlockState::Locked,
        };
        self.flight.complete(outcome);
    }
}

/// One vault discovered on one session.
pub struct Vault {
    root: Path,
    session: SessionId,
    config: VaultConfig,
    state: Mutex<UnlockState>,
    /// Plaintext directory path to directory id.
    dir_ids: Cache<String, String>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("root", &self.root)
            .field("session", &self.session)
            .field("unlocked", &self.is_unlocked())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Vault {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && self.root.as_str() == other.root.as_str()
    }
}

impl Eq for Vault {}

impl Vault {
    /// A locked vault rooted at `root`.
    pub fn new(root: Path, session: SessionId, config: VaultConfig) -> Self {
        let dir_ids = Cache::builder()
            .max_capacity(config.dir_id_cache_capacity)
            .support_invalidation_closures()
            .build();
        Vault {
            root: root.with_kind(EntryType::DIRECTORY),
            session,
            config,
            state: Mutex::new(UnlockState::Locked),
            dir_ids,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn masterkey_path(&self) -> Path {
        self.root.child_file(&self.config.masterkey_filename)
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path.as_str() == self.root.as_str()
    }

    /// Whether `path` is the root or lies below it.
    pub fn contains(&self, path: &Path) -> bool {
        path.is_within(&self.root)
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(*self.state.lock(), UnlockState::Unlocked(_))
    }

    /// The master key, or [`VaultError::Locked`].
    pub fn key(&self) -> Result<Arc<MasterKey>> {
        match &*self.state.lock() {
            UnlockState::Unlocked(key) => Ok(Arc::clone(key)),
            _ => Err(VaultError::Locked {
                root: self.root.clone(),
            }
            .into()),
        }
    }

    /// Mark the vault unlocked with an already derived key.
    pub fn set_unlocked(&self, key: Arc<MasterKey>) {
        *self.state.lock() = UnlockState::Unlocked(key);
    }

    /// Drop the key and every cached directory id. An unlock still in
    /// progress finishes for its callers but leaves the vault locked.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        match &*state {
            UnlockState::Unlocked(_) => *state = UnlockState::Locked,
            UnlockState::Unlocking(flight) => flight.abort(),
            UnlockState::Locked => {}
        }
        drop(state);
        self.dir_ids.invalidate_all();
        debug!(root = %self.root, "Vault locked");
    }

    /// Unlock the vault, prompting through `prompt` as needed.
    ///
    /// Concurrent callers share one unlock: a single caller reads the
    /// masterkey file and prompts, the others block until it finishes and
    /// receive the same outcome. No lock is held while prompting.
    pub fn unlock(
        &self,
        session: &Arc<Session>,
        prompt: &dyn PasswordCallback,
    ) -> Result<Arc<MasterKey>> {
        let flight = {
            let mut state = self.state.lock();
            match &*state {
                UnlockState::Unlocked(key) => return Ok(Arc::clone(key)),
                UnlockState::Unlocking(flight) => {
                    let flight = Arc::clone(flight);
                    drop(state);
                    trace!(root = %self.root, "Waiting for unlock in progress");
                    return flight.wait().into_result(&self.root);
                }
                UnlockState::Locked => {
                    let flight = Arc::new(Flight::default());
                    *state = UnlockState::Unlocking(Arc::clone(&flight));
                    flight
                }
            }
        };

        let mut guard = LeaderGuard {
            vault: self,
            flight,
            outcome: None,
        };
        let result = self.run_unlock(session, prompt);
        guard.outcome = Some(Outcome::of(&result));
        drop(guard);
        result
    }

    #[instrument(level = "debug", skip(self, session, prompt), fields(root = %self.root))]
    fn run_unlock(
        &self,
        session: &Arc<Session>,
        prompt: &dyn PasswordCallback,
    ) -> Result<Arc<MasterKey>> {
        let bytes = read_fully(session, &self.masterkey_path())?;
        let file = MasterKeyFile::from_json(&bytes).map_err(|source| VaultError::Crypto {
            root: self.root.clone(),
            source,
        })?;

        let attempts = self.config.max_unlock_attempts.max(1);
        let mut previous_failed = false;
        for attempt in 1..=attempts {
            let request = UnlockRequest {
                vault_root: self.root.clone(),
                attempt,
                previous_failed,
            };
            let passphrase = match prompt.prompt(&request) {
                Credentials::Password(passphrase) => passphrase,
                Credentials::Cancel => {
                    debug!("Unlock canceled by user");
                    return Err(FeatureError::VaultUnlockCancel {
                        root: self.root.clone(),
                    });
                }
            };
            match file.unlock(passphrase.expose_secret()) {
                Ok(key) => {
                    info!(attempt, "Vault unlocked");
                    return Ok(Arc::new(key));
                }
                Err(e) if e.is_wrong_passphrase() => {
                    warn!(attempt, attempts, "Incorrect passphrase");
                    previous_failed = true;
                }
                Err(source) => {
                    return Err(VaultError::Crypto {
                        root: self.root.clone(),
                        source,
                    }
                    .into());
                }
            }
        }
        Err(VaultError::IncorrectPassphrase {
            root: self.root.clone(),
            attempts,
        }
        .into())
    }

    /// Ciphertext data directory of the directory with id `dir_id`.
    pub fn data_dir(&self, key: &MasterKey, dir_id: &str) -> Result<Path> {
        let hash = names::hash_dir_id(dir_id, key)?;
        let (prefix, rest) = hash.split_at(2);
        Ok(self
            .root
            .child_dir(&self.config.data_dir)
            .child_dir(prefix)
            .child_dir(rest))
    }

    /// Id of the plaintext directory `directory`, read from storage on a cache miss.
    pub fn dir_id(
        &self,
        session: &Arc<Session>,
        key: &MasterKey,
        directory: &Path,
    ) -> Result<String> {
        if self.is_root(directory) {
            return Ok(String::new());
        }
        if !directory.is_descendant_of(&self.root) {
            return Err(FeatureError::not_found(directory));
        }
        let cache_key = directory.as_str().to_string();
        if let Some(id) = self.dir_ids.get(&cache_key) {
            return Ok(id);
        }

        let directory_node = directory.clone().with_kind(EntryType::DIRECTORY);
        let node = self.ciphertext_node(session, key, &directory_node)?;
        let id_file = node.child_file(DIR_ID_FILE);
        let bytes = read_fully(session, &id_file)?;
        let id = String::from_utf8(bytes).map_err(|e| VaultError::InvalidDirId {
            path: id_file.clone(),
            reason: e.to_string(),
        })?;
        if id.is_empty() || id.len() > MAX_DIR_ID_LENGTH {
            return Err(VaultError::InvalidDirId {
                path: id_file,
                reason: format!("length {} out of range", id.len()),
            }
            .into());
        }
        trace!(directory = %directory, "Resolved directory id");
        self.dir_ids.insert(cache_key, id.clone());
        Ok(id)
    }

    /// Remember the id of a directory that was just created.
    pub fn cache_dir_id(&self, directory: &Path, dir_id: String) {
        self.dir_ids.insert(directory.as_str().to_string(), dir_id);
    }

    /// Ciphertext node of the plaintext `path`, keeping its entry type.
    pub fn ciphertext_node(
        &self,
        session: &Arc<Session>,
        key: &MasterKey,
        path: &Path,
    ) -> Result<Path> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(FeatureError::not_found(path));
        };
        let parent_id = self.dir_id(session, key, &parent)?;
        let encrypted = names::encrypt_name(name, &parent_id, key)?;
        Ok(self.data_dir(key, &parent_id)?.child(&encrypted, path.kind()))
    }

    /// Forget cached ids of `directory` and everything below it.
    pub fn invalidate_subtree(&self, directory: &Path) {
        let prefix = directory.as_str().to_string();
        let nested = format!("{prefix}/");
        if let Err(e) = self
            .dir_ids
            .invalidate_entries_if(move |path, _| *path == prefix || path.starts_with(&nested))
        {
            warn!(error = %e, "Directory id invalidation failed, dropping all cached ids");
            self.dir_ids.invalidate_all();
        }
    }
}

/// Read a whole file through the backend features.
pub(crate) fn read_fully(session: &Arc<Session>, file: &Path) -> Result<Vec<u8>> {
    let read = session.raw::<dyn ReadFeature>()?;
    let mut input = read.read(file, &TransferStatus::new(), &DisabledConnectionCallback)?;
    let mut bytes = Vec::new();
    input
        .read_to_end(&mut bytes)
        .map_err(|e| FeatureError::from_io(e, file))?;
    Ok(bytes)
}

/// Replace a file's content through the backend features.
pub(crate) fn write_fully(session: &Arc<Session>, file: &Path, bytes: &[u8]) -> Result<()> {
    let write = session.raw::<dyn WriteFeature>()?;
    let status = TransferStatus::new().length(bytes.len() as u64);
    let mut output = write.write(file, &status, &DisabledConnectionCallback)?;
    output
        .write_all(bytes)
        .map_err(|e| FeatureError::from_io(e, file))?;
    output.finish()?;
    Ok(())
}

/// Create `directory` through the backend features unless it exists.
pub(crate) fn ensure_directory(session: &Arc<Session>, directory: &Path) -> Result<()> {
    let mkdir = session.raw::<dyn DirectoryFeature>()?;
    match mkdir.mkdir(directory, &TransferStatus::new()) {
        Ok(_) | Err(FeatureError::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Flavor, MemoryBackend};
    use crate::callback::StaticPasswordCallback;
    use crate::config::{FeatureConfig, VaultConfig};
    use secrecy::SecretString;

    fn vault() -> Vault {
        Vault::new(
            Path::directory("/vaults/v"),
            SessionId::for_tests(1),
            VaultConfig::default(),
        )
    }

    #[test]
    fn test_locked_by_default() {
        let vault = vault();
        assert!(!vault.is_unlocked());
        assert!(matches!(
            vault.key(),
            Err(FeatureError::Vault(VaultError::Locked { .. }))
        ));
        vault.set_unlocked(Arc::new(MasterKey::random()));
        assert!(vault.is_unlocked());
        vault.lock();
        assert!(!vault.is_unlocked());
    }

    #[test]
    fn test_lock_during_unlock_discards_key() {
        let session = Session::new(
            Arc::new(MemoryBackend::new(Flavor::Posix)),
            FeatureConfig::default(),
        );
        let vault = Arc::new(Vault::new(
            Path::directory("/v"),
            session.id(),
            VaultConfig::default().scrypt_cost_log2(10),
        ));
        creator::create(&session, &vault, "pw").unwrap();
        vault.lock();

        let locker = Arc::clone(&vault);
        let prompt = move |_request: &UnlockRequest| {
            locker.lock();
            Credentials::Password(SecretString::from("pw"))
        };
        assert!(vault.unlock(&session, &prompt).is_ok());
        assert!(!vault.is_unlocked());

        // The next unlock starts over
        let static_prompt = StaticPasswordCallback::new("pw");
        vault.unlock(&session, &static_prompt).unwrap();
        assert!(vault.is_unlocked());
    }

    #[test]
    fn test_containment() {
        let vault = vault();
        assert!(vault.is_root(&Path::directory("/vaults/v/")));
        assert!(vault.contains(&Path::file("/vaults/v/a.txt")));
        assert!(!vault.contains(&Path::file("/vaults/vx/a.txt")));
        assert_eq!(vault.masterkey_path().to_string(), "/vaults/v/masterkey.cryptomator");
    }

    #[test]
    fn test_data_dir_layout() {
        let vault = vault();
        let key = MasterKey::random();
        let data = vault.data_dir(&key, "").unwrap();
        let rest = data.relative_to(vault.root()).unwrap();
        let parts: Vec<_> = rest.components().map(|c| c.as_str().to_string()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "d");
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 30);
    }

    #[test]
    fn test_invalidate_subtree() {
        let vault = vault();
        vault.cache_dir_id(&Path::directory("/vaults/v/a"), "id-a".into());
        vault.cache_dir_id(&Path::directory("/vaults/v/a/b"), "id-b".into());
        vault.cache_dir_id(&Path::directory("/vaults/v/ab"), "id-ab".into());
        vault.invalidate_subtree(&Path::directory("/vaults/v/a"));
        vault.dir_ids.run_pending_tasks();
        assert!(vault.dir_ids.get("vaults/v/a").is_none());
        assert!(vault.dir_ids.get("vaults/v/a/b").is_none());
        assert_eq!(vault.dir_ids.get("vaults/v/ab").as_deref(), Some("id-ab"));
    }

    #[test]
    fn test_vault_equality_is_root_and_session() {
        let a = vault();
        let b = vault();
        let c = Vault::new(
            Path::directory("/vaults/v"),
            SessionId::for_tests(2),
            VaultConfig::default(),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
