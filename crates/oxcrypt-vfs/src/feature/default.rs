//! Composed defaults for capabilities a backend does not implement natively.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::{
    CopyFeature, DeleteFeature, DirectoryFeature, FindFeature, ListFeature, MoveFeature,
    ReadFeature, TouchFeature, WriteFeature,
};
use crate::callback::{
    ConnectionCallback, DeleteCallback, DisabledConnectionCallback, DisabledListProgressListener,
};
use crate::config::AccessDeniedPolicy;
use crate::error::{FeatureError, Result};
use crate::path::Path;
use crate::session::Session;
use crate::status::TransferStatus;

/// Existence check by listing the parent directory.
pub struct DefaultFind {
    session: Arc<Session>,
}

impl DefaultFind {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

impl fmt::Debug for DefaultFind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultFind").field("session", &self.session.id()).finish()
    }
}

impl FindFeature for DefaultFind {
    fn find(&self, file: &Path) -> Result<bool> {
        let Some(parent) = file.parent() else {
            return Ok(true);
        };
        let list = self.session.raw::<dyn ListFeature>()?;
        match list.list(&parent, &DisabledListProgressListener) {
            Ok(entries) => Ok(entries.contains(file)),
            Err(FeatureError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Resolves an access-denied existence check according to policy.
///
/// With [`AccessDeniedPolicy::AssumeExists`] an unreadable parent makes the
/// entry count as present, so callers never overwrite it blindly.
pub struct InconclusiveAccessFind {
    inner: Arc<dyn FindFeature>,
    policy: AccessDeniedPolicy,
}

impl InconclusiveAccessFind {
    pub fn new(inner: Arc<dyn FindFeature>, policy: AccessDeniedPolicy) -> Self {
        Self { inner, policy }
    }
}

impl fmt::Debug for InconclusiveAccessFind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InconclusiveAccessFind")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish()
    }
}

impl FindFeature for InconclusiveAccessFind {
    fn find(&self, file: &Path) -> Result<bool> {
        match self.inner.find(file) {
            Err(FeatureError::AccessDenied { path, reason })
                if self.policy == AccessDeniedPolicy::AssumeExists =>
            {
                warn!(file = %file, denied = %path, %reason, "Existence check inconclusive, assuming present");
                Ok(true)
            }
            other => other,
        }
    }
}

/// Which features a [`StreamCopy`] reads and writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Backend features only: bytes are copied as stored.
    Raw,
    /// Vault-aware features: bytes are decrypted and re-encrypted as needed.
    Decorated,
}

/// Copy by streaming content from a read into a write.
///
/// Directories are recreated at the target and copied entry by entry.
pub struct StreamCopy {
    session: Arc<Session>,
    layer: Layer,
}

impl StreamCopy {
    pub fn new(session: Arc<Session>, layer: Layer) -> Self {
        Self { session, layer }
    }

    fn read(&self) -> Result<Arc<dyn ReadFeature>> {
        match self.layer {
            Layer::Raw => self.session.raw::<dyn ReadFeature>(),
            Layer::Decorated => self.session.feature::<dyn ReadFeature>(),
        }
    }

    fn write(&self) -> Result<Arc<dyn WriteFeature>> {
        match self.layer {
            Layer::Raw => self.session.raw::<dyn WriteFeature>(),
            Layer::Decorated => self.session.feature::<dyn WriteFeature>(),
        }
    }

    fn list(&self) -> Result<Arc<dyn ListFeature>> {
        match self.layer {
            Layer::Raw => self.session.raw::<dyn ListFeature>(),
            Layer::Decorated => self.session.feature::<dyn ListFeature>(),
        }
    }

    fn directory(&self) -> Result<Arc<dyn DirectoryFeature>> {
        match self.layer {
            Layer::Raw => self.session.raw::<dyn DirectoryFeature>(),
            Layer::Decorated => self.session.feature::<dyn DirectoryFeature>(),
        }
    }

    fn copy_file(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        let mut input = self.read()?.read(source, &TransferStatus::new(), callback)?;
        let mut output = self.write()?.write(target, status, callback)?;

        let mut buffer = vec![0u8; self.session.config().copy_buffer_size];
        loop {
            callback.check_cancelled()?;
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FeatureError::from_io(e, source)),
            };
            output
                .write_all(&buffer[..n])
                .map_err(|e| FeatureError::from_io(e, target))?;
        }
        output.flush().map_err(|e| FeatureError::from_io(e, target))?;
        let attributes = output.finish()?;
        Ok(target.clone().with_attributes(attributes))
    }

    fn copy_directory(
        &self,
        source: &Path,
        target: &Path,
        callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        match self.directory()?.mkdir(target, &TransferStatus::new()) {
            Ok(_) | Err(FeatureError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
        let entries = self.list()?.list(source, &DisabledListProgressListener)?;
        for entry in &entries {
            callback.check_cancelled()?;
            let Some(name) = entry.name() else { continue };
            let child = target.child(name, entry.kind());
            self.copy_to(entry, &child, &TransferStatus::new(), callback)?;
        }
        Ok(target.clone())
    }
}

impl fmt::Debug for StreamCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCopy")
            .field("session", &self.session.id())
            .field("layer", &self.layer)
            .finish()
    }
}

impl CopyFeature for StreamCopy {
    #[instrument(level = "debug", skip(self, status, connection_callback), fields(layer = ?self.layer))]
    fn copy_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        if source.is_directory() {
            self.copy_directory(source, target, connection_callback)
        } else {
            self.copy_file(source, target, status, connection_callback)
        }
    }

    fn is_recursive(&self, _source: &Path, _target: &Path) -> bool {
        true
    }
}

/// Move emulated by a copy followed by deleting the source.
///
/// Not atomic. When the delete fails the target is left in place and
/// [`FeatureError::MoveIncomplete`] is returned.
pub struct CopyDeleteMove {
    session: Arc<Session>,
    delete: RwLock<Option<Arc<dyn DeleteFeature>>>,
}

impl CopyDeleteMove {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            delete: RwLock::new(None),
        }
    }

    fn delete_feature(&self) -> Result<Arc<dyn DeleteFeature>> {
        match self.delete.read().as_ref() {
            Some(delete) => Ok(Arc::clone(delete)),
            None => self.session.raw::<dyn DeleteFeature>(),
        }
    }
}

impl fmt::Debug for CopyDeleteMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyDeleteMove")
            .field("session", &self.session.id())
            .field("delete", &*self.delete.read())
            .finish()
    }
}

impl MoveFeature for CopyDeleteMove {
    #[instrument(level = "debug", skip(self, status, delete_callback, connection_callback))]
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        let copy = self.session.raw::<dyn CopyFeature>()?;
        let moved = copy.copy_to(source, target, status, connection_callback)?;
        debug!("Copied, removing source");
        self.delete_feature()?
            .delete(std::slice::from_ref(source), delete_callback, connection_callback)
            .map_err(|cause| FeatureError::MoveIncomplete {
                from: source.clone(),
                to: target.clone(),
                cause: Box::new(cause),
            })?;
        Ok(moved)
    }

    fn is_recursive(&self, source: &Path, target: &Path) -> bool {
        self.session
            .raw::<dyn CopyFeature>()
            .is_ok_and(|copy| copy.is_recursive(source, target))
    }

    fn is_supported(&self, source: &Path, target: &Path) -> bool {
        self.session
            .raw::<dyn CopyFeature>()
            .is_ok_and(|copy| copy.is_supported(source, target))
    }

    fn with_delete(&self, delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature {
        *self.delete.write() = Some(delete);
        self
    }
}

/// Create an empty file by writing nothing.
pub struct DefaultTouch {
    session: Arc<Session>,
}

impl DefaultTouch {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

impl fmt::Debug for DefaultTouch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTouch").field("session", &self.session.id()).finish()
    }
}

impl TouchFeature for DefaultTouch {
    fn touch(&self, file: &Path, status: &TransferStatus) -> Result<Path> {
        let write = self.session.raw::<dyn WriteFeature>()?;
        let status = status.clone().length(0).append(false);
        let stream = write.write(file, &status, &DisabledConnectionCallback)?;
        let attributes = stream.finish()?;
        Ok(file.clone().with_attributes(attributes))
    }
}

