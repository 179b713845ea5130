//! Sessions and capability lookup.
//!
//! A [`Backend`] supplies whatever native features a storage protocol has.
//! A [`Session`] binds a backend to an optional [`VaultRegistry`] and hands
//! out features by capability type:
//!
//! - [`Session::raw`] returns the backend feature, or a composed default when
//!   the backend has none (e.g. move as copy then delete).
//! - [`Session::feature`] wraps the raw feature in the registry decorator, so
//!   vault boundaries are handled transparently.
//!
//! Features are cheap to construct and are built per call.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::config::FeatureConfig;
use crate::error::{FeatureError, Result};
use crate::feature::default::{
    CopyDeleteMove, DefaultFind, DefaultTouch, InconclusiveAccessFind, Layer, StreamCopy,
};
use crate::feature::{
    CopyFeature, DeleteFeature, DirectoryFeature, FindFeature, ListFeature, MoveFeature,
    ReadFeature, TouchFeature, WriteFeature,
};
use crate::registry::VaultRegistry;
use crate::registry::features::{RegistryCopy, RegistryFeature, RegistryMove};
use crate::vault::Vault;
use crate::vault::features::{
    CryptoCopy, CryptoDelete, CryptoDirectory, CryptoFind, CryptoList, CryptoMove, CryptoRead,
    CryptoTouch, CryptoWrite,
};

/// Capability provider of one storage backend.
///
/// Read, write, list, delete and directory creation are expected from every
/// useful backend. The remaining capabilities fall back to composed defaults
/// when absent.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Human-readable protocol name used in error messages.
    fn name(&self) -> &str;

    fn read_feature(&self) -> Option<Arc<dyn ReadFeature>>;
    fn write_feature(&self) -> Option<Arc<dyn WriteFeature>>;
    fn list_feature(&self) -> Option<Arc<dyn ListFeature>>;
    fn delete_feature(&self) -> Option<Arc<dyn DeleteFeature>>;
    fn directory_feature(&self) -> Option<Arc<dyn DirectoryFeature>>;

    fn find_feature(&self) -> Option<Arc<dyn FindFeature>> {
        None
    }

    fn copy_feature(&self) -> Option<Arc<dyn CopyFeature>> {
        None
    }

    fn move_feature(&self) -> Option<Arc<dyn MoveFeature>> {
        None
    }

    fn touch_feature(&self) -> Option<Arc<dyn TouchFeature>> {
        None
    }
}

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u64) -> Self {
        SessionId(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

pub struct Session {
    id: SessionId,
    backend: Arc<dyn Backend>,
    registry: Option<Arc<VaultRegistry>>,
    config: FeatureConfig,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("vaults", &self.registry.is_some())
            .finish()
    }
}

impl Session {
    /// Session without vault support.
    pub fn new(backend: Arc<dyn Backend>, config: FeatureConfig) -> Arc<Self> {
        Arc::new(Session {
            id: SessionId::next(),
            backend,
            registry: None,
            config,
        })
    }

    /// Session whose features are routed through `registry`.
    pub fn with_registry(
        backend: Arc<dyn Backend>,
        registry: Arc<VaultRegistry>,
        config: FeatureConfig,
    ) -> Arc<Self> {
        Arc::new(Session {
            id: SessionId::next(),
            backend,
            registry: Some(registry),
            config,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn registry(&self) -> Option<&Arc<VaultRegistry>> {
        self.registry.as_ref()
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Backend feature for `C`, or its composed default.
    pub fn raw<C: Capability + ?Sized>(self: &Arc<Self>) -> Result<Arc<C>> {
        C::native(self.backend.as_ref())
            .or_else(|| C::fallback(self))
            .ok_or_else(|| FeatureError::Unsupported {
                capability: C::NAME,
                backend: self.backend.name().to_string(),
            })
    }

    /// Vault-aware feature for `C`.
    pub fn feature<C: Capability + ?Sized>(self: &Arc<Self>) -> Result<Arc<C>> {
        let proxy = self.raw::<C>()?;
        let decorated = match &self.registry {
            Some(registry) => C::registry(Arc::clone(registry), self, proxy),
            None => proxy,
        };
        Ok(C::finish(self, decorated))
    }

    /// Tear down: lock and forget every vault discovered through this session.
    pub fn close(&self) {
        if let Some(registry) = &self.registry {
            debug!(session = %self.id, "Closing session");
            registry.clear_session(self.id);
        }
    }
}

/// A capability kind, implemented for each `dyn …Feature` trait object.
pub trait Capability: Send + Sync + 'static {
    const NAME: &'static str;

    /// Whether an operation on a vault root itself bypasses the vault.
    ///
    /// Listing a root shows its decrypted content; everything else treats
    /// the root as the plain ciphertext container.
    const ROOT_IS_PLAIN: bool = true;

    fn native(backend: &dyn Backend) -> Option<Arc<Self>>;

    fn fallback(_session: &Arc<Session>) -> Option<Arc<Self>> {
        None
    }

    /// Feature operating inside `vault`, backed by `proxy` for ciphertext I/O.
    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self>;

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>)
    -> Arc<Self>;

    /// Last wrapping step applied by [`Session::feature`].
    fn finish(_session: &Arc<Session>, feature: Arc<Self>) -> Arc<Self> {
        feature
    }
}

impl Capability for dyn ReadFeature {
    const NAME: &'static str = "read";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.read_feature()
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoRead::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn WriteFeature {
    const NAME: &'static str = "write";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.write_feature()
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoWrite::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn ListFeature {
    const NAME: &'static str = "list";
    const ROOT_IS_PLAIN: bool = false;

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.list_feature()
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoList::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn DeleteFeature {
    const NAME: &'static str = "delete";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.delete_feature()
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoDelete::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn DirectoryFeature {
    const NAME: &'static str = "directory";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.directory_feature()
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoDirectory::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn FindFeature {
    const NAME: &'static str = "find";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.find_feature()
    }

    fn fallback(session: &Arc<Session>) -> Option<Arc<Self>> {
        Some(Arc::new(DefaultFind::new(Arc::clone(session))))
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoFind::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }

    fn finish(session: &Arc<Session>, feature: Arc<Self>) -> Arc<Self> {
        Arc::new(InconclusiveAccessFind::new(feature, session.config().access_denied))
    }
}

impl Capability for dyn CopyFeature {
    const NAME: &'static str = "copy";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.copy_feature()
    }

    fn fallback(session: &Arc<Session>) -> Option<Arc<Self>> {
        Some(Arc::new(StreamCopy::new(Arc::clone(session), Layer::Raw)))
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoCopy::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryCopy::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn MoveFeature {
    const NAME: &'static str = "move";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.move_feature()
    }

    fn fallback(session: &Arc<Session>) -> Option<Arc<Self>> {
        Some(Arc::new(CopyDeleteMove::new(Arc::clone(session))))
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoMove::new(vault, Arc::clone(session), proxy))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryMove::new(registry, Arc::clone(session), proxy))
    }
}

impl Capability for dyn TouchFeature {
    const NAME: &'static str = "touch";

    fn native(backend: &dyn Backend) -> Option<Arc<Self>> {
        backend.touch_feature()
    }

    fn fallback(session: &Arc<Session>) -> Option<Arc<Self>> {
        Some(Arc::new(DefaultTouch::new(Arc::clone(session))))
    }

    fn vault(vault: Arc<Vault>, session: &Arc<Session>, _proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(CryptoTouch::new(vault, Arc::clone(session)))
    }

    fn registry(registry: Arc<VaultRegistry>, session: &Arc<Session>, proxy: Arc<Self>) -> Arc<Self> {
        Arc::new(RegistryFeature::new(registry, Arc::clone(session), proxy))
    }
}
