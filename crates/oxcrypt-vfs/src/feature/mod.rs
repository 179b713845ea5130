//! Capability interfaces.
//!
//! Every file operation is a separate object-safe trait so backends, vaults
//! and registry decorators can each supply their own implementation and be
//! composed by wrapping. Implementations are shared as `Arc<dyn …Feature>`.

pub mod default;

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::callback::{ConnectionCallback, DeleteCallback, ListProgressListener};
use crate::error::Result;
use crate::path::{Path, PathAttributes};
use crate::status::TransferStatus;

/// Rename `source` to `target`.
pub trait MoveFeature: Send + Sync + fmt::Debug {
    /// Returns the path of the moved entry.
    ///
    /// Fails with `TransferFailure` when the target parent cannot hold
    /// entries and with `NotFound` when the source vanished. Moves emulated
    /// by copy and delete are not atomic and must not be retried blindly.
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path>;

    /// Side-effect free. Containers such as bucket roots are never valid sources.
    fn is_supported(&self, _source: &Path, _target: &Path) -> bool {
        true
    }

    /// Whether the move has to descend into a directory tree.
    fn is_recursive(&self, _source: &Path, _target: &Path) -> bool {
        false
    }

    /// Use `delete` to remove sources after an emulated move.
    ///
    /// Returns `self`. Decorators forward to the feature they wrap first.
    fn with_delete(&self, delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature;
}

pub trait CopyFeature: Send + Sync + fmt::Debug {
    fn copy_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path>;

    fn is_supported(&self, _source: &Path, _target: &Path) -> bool {
        true
    }

    fn is_recursive(&self, _source: &Path, _target: &Path) -> bool {
        false
    }
}

/// Remove entries. Directories are removed with their contents.
pub trait DeleteFeature: Send + Sync + fmt::Debug {
    fn delete(
        &self,
        files: &[Path],
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<()>;

    fn is_supported(&self, _file: &Path) -> bool {
        true
    }
}

/// Existence check.
pub trait FindFeature: Send + Sync + fmt::Debug {
    fn find(&self, file: &Path) -> Result<bool>;
}

pub trait ReadFeature: Send + Sync + fmt::Debug {
    /// Open `file` for reading from `status.offset`.
    fn read(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn io::Read + Send>>;
}

/// Output stream returned by [`WriteFeature::write`].
///
/// Bytes are only guaranteed to be stored once [`finish`](Self::finish)
/// returns successfully.
pub trait WriteStream: io::Write + Send {
    fn finish(self: Box<Self>) -> Result<PathAttributes>;
}

pub trait WriteFeature: Send + Sync + fmt::Debug {
    /// Open `file` for writing. The length in `status` may be unknown.
    fn write(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn WriteStream>>;

    /// Whether `status.append` is honoured.
    fn supports_append(&self) -> bool {
        false
    }
}

pub trait ListFeature: Send + Sync + fmt::Debug {
    /// List `directory`, reporting entries to `listener` as they arrive.
    ///
    /// An error returned by the listener aborts the listing.
    fn list(&self, directory: &Path, listener: &dyn ListProgressListener) -> Result<AttributedList>;
}

/// Create an empty file.
pub trait TouchFeature: Send + Sync + fmt::Debug {
    fn touch(&self, file: &Path, status: &TransferStatus) -> Result<Path>;
}

pub trait DirectoryFeature: Send + Sync + fmt::Debug {
    /// Create `folder`. The parent must exist.
    fn mkdir(&self, folder: &Path, status: &TransferStatus) -> Result<Path>;
}

/// Result of a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributedList(Vec<Path>);

impl AttributedList {
    pub fn new(entries: Vec<Path>) -> Self {
        Self(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Path> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Path] {
        &self.0
    }

    /// Entry with the given final component.
    pub fn find_name(&self, name: &str) -> Option<&Path> {
        self.0.iter().find(|entry| entry.name() == Some(name))
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.0.contains(file)
    }

    pub fn into_vec(self) -> Vec<Path> {
        self.0
    }
}

impl FromIterator<Path> for AttributedList {
    fn from_iter<I: IntoIterator<Item = Path>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AttributedList {
    type Item = Path;
    type IntoIter = std::vec::IntoIter<Path>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a AttributedList {
    type Item = &'a Path;
    type IntoIter = std::slice::Iter<'a, Path>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
