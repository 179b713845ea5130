//! Shared harness for the integration tests.
//!
//! Builds a vault-aware session over the in-memory backend with cheap scrypt
//! settings and a password prompt that counts how often it was asked.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use oxcrypt_vfs::backend::{Flavor, MemoryBackend};
use oxcrypt_vfs::callback::{
    Credentials, DisabledConnectionCallback, PasswordCallback, UnlockRequest,
};
use oxcrypt_vfs::config::{FeatureConfig, RegistryConfig, VaultConfig};
use oxcrypt_vfs::feature::{DirectoryFeature, ReadFeature, WriteFeature};
use oxcrypt_vfs::{Path, Session, TransferStatus, Vault, VaultRegistry};
use secrecy::SecretString;

/// Passphrase of every vault created by the harness.
pub const TEST_PASSWORD: &str = "test-password-12345";

static TRACING: Once = Once::new();

/// Route `tracing` output to the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Scrypt settings small enough for tests.
pub fn fast_vault_config() -> VaultConfig {
    VaultConfig::default().scrypt_cost_log2(10)
}

/// Prompt answering with a fixed passphrase (or cancelling) and counting calls.
pub struct CountingPrompt {
    answer: parking_lot::Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl CountingPrompt {
    pub fn new(passphrase: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: parking_lot::Mutex::new(Some(passphrase.to_string())),
            calls: AtomicUsize::new(0),
        })
    }

    /// Answer `Cancel` from now on.
    pub fn cancel(&self) {
        *self.answer.lock() = None;
    }

    pub fn answer(&self, passphrase: &str) {
        *self.answer.lock() = Some(passphrase.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PasswordCallback for CountingPrompt {
    fn prompt(&self, _request: &UnlockRequest) -> Credentials {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent callers pile up
        std::thread::sleep(std::time::Duration::from_millis(20));
        match self.answer.lock().clone() {
            Some(passphrase) => Credentials::Password(SecretString::from(passphrase)),
            None => Credentials::Cancel,
        }
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub registry: Arc<VaultRegistry>,
    pub session: Arc<Session>,
    pub prompt: Arc<CountingPrompt>,
}

impl Harness {
    pub fn new(flavor: Flavor) -> Self {
        Self::with_config(flavor, FeatureConfig::default())
    }

    pub fn with_config(flavor: Flavor, config: FeatureConfig) -> Self {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new(flavor));
        let prompt = CountingPrompt::new(TEST_PASSWORD);
        let registry = Arc::new(VaultRegistry::new(
            RegistryConfig::default().vault(fast_vault_config()),
            Arc::clone(&prompt) as Arc<dyn PasswordCallback>,
        ));
        let session = Session::with_registry(
            Arc::clone(&backend) as _,
            Arc::clone(&registry),
            config,
        );
        Self {
            backend,
            registry,
            session,
            prompt,
        }
    }

    /// A second session over the same storage and registry, with nothing
    /// discovered or unlocked yet.
    pub fn fresh_session(&self) -> Arc<Session> {
        Session::with_registry(
            Arc::clone(&self.backend) as _,
            Arc::clone(&self.registry),
            self.session.config().clone(),
        )
    }

    pub fn create_vault(&self, root: &str) -> Arc<Vault> {
        let root = Path::directory(root);
        for ancestor in root.ancestors().collect::<Vec<_>>().into_iter().rev() {
            if !ancestor.is_root() && !self.backend.exists(&ancestor) {
                self.mkdir(&ancestor);
            }
        }
        self.registry
            .create_vault(&self.session, &root, TEST_PASSWORD)
            .expect("create vault")
    }

    pub fn mkdir(&self, dir: &Path) -> Path {
        self.session
            .feature::<dyn DirectoryFeature>()
            .expect("directory feature")
            .mkdir(dir, &TransferStatus::new())
            .expect("mkdir")
    }

    pub fn write(&self, file: &Path, data: &[u8]) {
        write_with(&self.session, file, data);
    }

    pub fn read(&self, file: &Path) -> Vec<u8> {
        read_with(&self.session, file)
    }
}

/// Write `data` through the vault-aware feature of `session`.
pub fn write_with(session: &Arc<Session>, file: &Path, data: &[u8]) {
    let status = TransferStatus::new().length(data.len() as u64);
    let mut out = session
        .feature::<dyn WriteFeature>()
        .expect("write feature")
        .write(file, &status, &DisabledConnectionCallback)
        .expect("open for write");
    out.write_all(data).expect("write");
    out.finish().expect("finish");
}

/// Read `file` through the vault-aware feature of `session`.
pub fn read_with(session: &Arc<Session>, file: &Path) -> Vec<u8> {
    let mut input = session
        .feature::<dyn ReadFeature>()
        .expect("read feature")
        .read(file, &TransferStatus::new(), &DisabledConnectionCallback)
        .expect("open for read");
    let mut data = Vec::new();
    input.read_to_end(&mut data).expect("read");
    data
}

/// Deterministic test content of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
