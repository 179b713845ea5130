//! Registry-aware decorators.
//!
//! Each decorator resolves the vault containing its argument and dispatches
//! to the vault's feature, or to the plain `proxy` outside any vault. Move
//! and copy additionally handle crossing a vault boundary by streaming the
//! content through the decrypting and encrypting features.

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::{Discovery, VaultRegistry};
use crate::callback::{ConnectionCallback, DeleteCallback, ListProgressListener};
use crate::error::{FeatureError, Result};
use crate::feature::default::{Layer, StreamCopy};
use crate::feature::{
    AttributedList, CopyFeature, DeleteFeature, DirectoryFeature, FindFeature, ListFeature,
    MoveFeature, ReadFeature, TouchFeature, WriteFeature, WriteStream,
};
use crate::path::Path;
use crate::session::{Capability, Session};
use crate::status::TransferStatus;
use crate::vault::Vault;

/// Routes a single-path capability to the vault containing the path.
pub struct RegistryFeature<C: ?Sized> {
    registry: Arc<VaultRegistry>,
    session: Arc<Session>,
    proxy: Arc<C>,
}

impl<C: Capability + ?Sized> RegistryFeature<C> {
    pub fn new(registry: Arc<VaultRegistry>, session: Arc<Session>, proxy: Arc<C>) -> Self {
        Self {
            registry,
            session,
            proxy,
        }
    }

    /// Unlocked vault responsible for `file`, `None` when `file` is plain.
    fn vault_for(&self, file: &Path) -> Result<Option<Arc<Vault>>> {
        let Some(vault) = self.registry.lookup(&self.session, file, Discovery::Allowed)? else {
            return Ok(None);
        };
        if C::ROOT_IS_PLAIN && vault.is_root(file) {
            return Ok(None);
        }
        self.registry.unlock(&self.session, &vault)?;
        Ok(Some(vault))
    }

    fn resolve(&self, file: &Path) -> Result<Arc<C>> {
        Ok(match self.vault_for(file)? {
            Some(vault) => C::vault(vault, &self.session, Arc::clone(&self.proxy)),
            None => Arc::clone(&self.proxy),
        })
    }
}

impl<C: ?Sized + fmt::Debug> fmt::Debug for RegistryFeature<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryFeature")
            .field("session", &self.session.id())
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl FindFeature for RegistryFeature<dyn FindFeature> {
    fn find(&self, file: &Path) -> Result<bool> {
        self.resolve(file)?.find(file)
    }
}

impl ReadFeature for RegistryFeature<dyn ReadFeature> {
    fn read(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn io::Read + Send>> {
        connection_callback.check_cancelled()?;
        self.resolve(file)?.read(file, status, connection_callback)
    }
}

impl WriteFeature for RegistryFeature<dyn WriteFeature> {
    fn write(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn WriteStream>> {
        connection_callback.check_cancelled()?;
        self.resolve(file)?.write(file, status, connection_callback)
    }

    fn supports_append(&self) -> bool {
        self.proxy.supports_append()
    }
}

impl TouchFeature for RegistryFeature<dyn TouchFeature> {
    fn touch(&self, file: &Path, status: &TransferStatus) -> Result<Path> {
        self.resolve(file)?.touch(file, status)
    }
}

impl DirectoryFeature for RegistryFeature<dyn DirectoryFeature> {
    fn mkdir(&self, folder: &Path, status: &TransferStatus) -> Result<Path> {
        self.resolve(folder)?.mkdir(folder, status)
    }
}

impl ListFeature for RegistryFeature<dyn ListFeature> {
    fn list(
        &self,
        directory: &Path,
        listener: &dyn ListProgressListener,
    ) -> Result<AttributedList> {
        match self.vault_for(directory)? {
            Some(vault) => {
                let proxy = Arc::clone(&self.proxy);
                <dyn ListFeature as Capability>::vault(vault, &self.session, proxy)
                    .list(directory, listener)
            }
            None => {
                let finder = VaultFinderListener {
                    registry: &self.registry,
                    session: &self.session,
                    proxy: listener,
                };
                self.proxy.list(directory, &finder)
            }
        }
    }
}

impl DeleteFeature for RegistryFeature<dyn DeleteFeature> {
    fn delete(
        &self,
        files: &[Path],
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<()> {
        for file in files {
            connection_callback.check_cancelled()?;
            let feature = self.resolve(file)?;
            feature.delete(std::slice::from_ref(file), delete_callback, connection_callback)?;
            if file.is_directory() {
                // Deleting a vault root or a tree holding vaults ends them
                self.registry.close_within(self.session.id(), file);
            }
        }
        Ok(())
    }

    fn is_supported(&self, file: &Path) -> bool {
        match self.registry.lookup(&self.session, file, Discovery::CacheOnly) {
            Ok(Some(vault)) if vault.is_unlocked() && !vault.is_root(file) => {
                let proxy = Arc::clone(&self.proxy);
                <dyn DeleteFeature as Capability>::vault(vault, &self.session, proxy)
                    .is_supported(file)
            }
            _ => self.proxy.is_supported(file),
        }
    }
}

/// Registers every listed directory that holds a vault marker.
pub struct VaultFinderListener<'a> {
    registry: &'a VaultRegistry,
    session: &'a Arc<Session>,
    proxy: &'a dyn ListProgressListener,
}

impl ListProgressListener for VaultFinderListener<'_> {
    fn chunk(&self, directory: &Path, entries: &[Path]) -> Result<()> {
        let marker = self.registry.config().vault.masterkey_filename.as_str();
        if self.registry.is_enabled()
            && entries
                .iter()
                .any(|entry| entry.is_file() && entry.name() == Some(marker))
        {
            self.registry.register(self.session.id(), directory);
        }
        self.proxy.chunk(directory, entries)
    }
}

/// Cache-only vault pair for predicates. `None` when a lookup fails.
fn cached_pair(
    registry: &VaultRegistry,
    session: &Arc<Session>,
    source: &Path,
    target: &Path,
) -> Option<(Option<Arc<Vault>>, Option<Arc<Vault>>)> {
    let source = registry.lookup(session, source, Discovery::CacheOnly).ok()?;
    let target = registry.lookup(session, target, Discovery::CacheOnly).ok()?;
    Some((source, target))
}

/// Move that stays inside one vault, or copies and deletes across a boundary.
pub struct RegistryMove {
    registry: Arc<VaultRegistry>,
    session: Arc<Session>,
    proxy: Arc<dyn MoveFeature>,
}

impl RegistryMove {
    pub fn new(
        registry: Arc<VaultRegistry>,
        session: Arc<Session>,
        proxy: Arc<dyn MoveFeature>,
    ) -> Self {
        Self {
            registry,
            session,
            proxy,
        }
    }

    fn inner(&self, vault: Option<Arc<Vault>>) -> Arc<dyn MoveFeature> {
        match vault {
            Some(vault) => {
                <dyn MoveFeature as Capability>::vault(vault, &self.session, Arc::clone(&self.proxy))
            }
            None => Arc::clone(&self.proxy),
        }
    }
}

impl fmt::Debug for RegistryMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryMove")
            .field("session", &self.session.id())
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl MoveFeature for RegistryMove {
    #[instrument(level = "debug", skip(self, status, delete_callback, connection_callback))]
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        connection_callback.check_cancelled()?;
        let source_vault = self.registry.find(&self.session, source, Discovery::Allowed)?;
        if source_vault.as_ref().is_some_and(|vault| vault.is_root(source)) {
            // The whole vault moves as plain ciphertext
            let moved =
                self.proxy
                    .move_to(source, target, status, delete_callback, connection_callback)?;
            self.registry.close_within(self.session.id(), source);
            return Ok(moved);
        }

        let target_vault = self
            .registry
            .find(&self.session, target, Discovery::CacheOnly)?;
        if source_vault == target_vault {
            debug!(vault = ?source_vault.as_ref().map(|v| v.root().clone()), "Move within one domain");
            let moved = self.inner(source_vault).move_to(
                source,
                target,
                status,
                delete_callback,
                connection_callback,
            )?;
            if source.is_directory() {
                // Vaults nested below the source now live elsewhere
                self.registry.close_within(self.session.id(), source);
            }
            return Ok(moved);
        }

        debug!("Move crosses a vault boundary, copying");
        let copy = self.session.feature::<dyn CopyFeature>()?;
        let moved = copy.copy_to(source, target, status, connection_callback)?;
        let delete = self.session.feature::<dyn DeleteFeature>()?;
        delete
            .delete(std::slice::from_ref(source), delete_callback, connection_callback)
            .map_err(|cause| FeatureError::MoveIncomplete {
                from: source.clone(),
                to: target.clone(),
                cause: Box::new(cause),
            })?;
        if source.is_directory() {
            self.registry.close_within(self.session.id(), source);
        }
        Ok(moved)
    }

    fn is_supported(&self, source: &Path, target: &Path) -> bool {
        match cached_pair(&self.registry, &self.session, source, target) {
            Some((Some(vault), _)) if vault.is_root(source) => self.proxy.is_supported(source, target),
            Some((s, t)) if s == t => match s {
                Some(vault) if vault.is_unlocked() && !vault.is_root(source) => {
                    self.inner(Some(vault)).is_supported(source, target)
                }
                _ => self.proxy.is_supported(source, target),
            },
            Some(_) => self
                .session
                .feature::<dyn CopyFeature>()
                .is_ok_and(|copy| copy.is_supported(source, target)),
            None => self.proxy.is_supported(source, target),
        }
    }

    fn is_recursive(&self, source: &Path, target: &Path) -> bool {
        match cached_pair(&self.registry, &self.session, source, target) {
            Some((Some(vault), _)) if vault.is_root(source) => self.proxy.is_recursive(source, target),
            Some((s, t)) if s == t => match s {
                Some(vault) if vault.is_unlocked() && !vault.is_root(source) => {
                    self.inner(Some(vault)).is_recursive(source, target)
                }
                _ => self.proxy.is_recursive(source, target),
            },
            Some(_) => self
                .session
                .feature::<dyn CopyFeature>()
                .is_ok_and(|copy| copy.is_recursive(source, target)),
            None => self.proxy.is_recursive(source, target),
        }
    }

    fn with_delete(&self, delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature {
        self.proxy.with_delete(delete);
        self
    }
}

/// Copy inside one domain through the matching feature, or streamed across
/// a vault boundary.
pub struct RegistryCopy {
    registry: Arc<VaultRegistry>,
    session: Arc<Session>,
    proxy: Arc<dyn CopyFeature>,
}

impl RegistryCopy {
    pub fn new(
        registry: Arc<VaultRegistry>,
        session: Arc<Session>,
        proxy: Arc<dyn CopyFeature>,
    ) -> Self {
        Self {
            registry,
            session,
            proxy,
        }
    }

    fn inner(&self, vault: Option<Arc<Vault>>) -> Arc<dyn CopyFeature> {
        match vault {
            Some(vault) => {
                <dyn CopyFeature as Capability>::vault(vault, &self.session, Arc::clone(&self.proxy))
            }
            None => Arc::clone(&self.proxy),
        }
    }
}

impl fmt::Debug for RegistryCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCopy")
            .field("session", &self.session.id())
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl CopyFeature for RegistryCopy {
    #[instrument(level = "debug", skip(self, status, connection_callback))]
    fn copy_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        connection_callback.check_cancelled()?;
        let source_vault = self.registry.find(&self.session, source, Discovery::Allowed)?;
        if source_vault.as_ref().is_some_and(|vault| vault.is_root(source)) {
            return self.proxy.copy_to(source, target, status, connection_callback);
        }
        let target_vault = self.registry.find(&self.session, target, Discovery::Allowed)?;
        if source_vault == target_vault {
            return self
                .inner(source_vault)
                .copy_to(source, target, status, connection_callback);
        }
        debug!("Copy crosses a vault boundary, streaming");
        StreamCopy::new(Arc::clone(&self.session), Layer::Decorated).copy_to(
            source,
            target,
            status,
            connection_callback,
        )
    }

    fn is_supported(&self, source: &Path, target: &Path) -> bool {
        match cached_pair(&self.registry, &self.session, source, target) {
            Some((s, t)) if s == t => match s {
                Some(vault) if vault.is_unlocked() && !vault.is_root(source) => {
                    self.inner(Some(vault)).is_supported(source, target)
                }
                _ => self.proxy.is_supported(source, target),
            },
            // Streaming works between any two domains
            Some(_) => true,
            None => self.proxy.is_supported(source, target),
        }
    }

    fn is_recursive(&self, source: &Path, target: &Path) -> bool {
        match cached_pair(&self.registry, &self.session, source, target) {
            Some((s, t)) if s == t => match s {
                Some(vault) if vault.is_unlocked() && !vault.is_root(source) => {
                    self.inner(Some(vault)).is_recursive(source, target)
                }
                _ => self.proxy.is_recursive(source, target),
            },
            Some(_) => true,
            None => self.proxy.is_recursive(source, target),
        }
    }
}
