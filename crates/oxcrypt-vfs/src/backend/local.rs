//! Local filesystem backend rooted at a base directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::callback::{ConnectionCallback, DeleteCallback, ListProgressListener};
use crate::error::{FeatureError, Result};
use crate::feature::{
    AttributedList, DeleteFeature, DirectoryFeature, FindFeature, ListFeature, MoveFeature,
    ReadFeature, WriteFeature, WriteStream,
};
use crate::path::{EntryType, Path, PathAttributes};
use crate::session::Backend;
use crate::status::TransferStatus;

/// Serves backend paths from a directory on the local disk.
///
/// Has no native copy or touch; sessions compose those from read and write.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base: Arc<PathBuf>,
}

impl LocalBackend {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Arc::new(base.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        path.as_relative_path().to_path(self.base.as_path())
    }
}

fn attributes(metadata: &fs::Metadata) -> PathAttributes {
    let mut attributes = PathAttributes::default();
    if metadata.is_file() {
        attributes = attributes.with_size(metadata.len());
    }
    if let Ok(modified) = metadata.modified() {
        attributes = attributes.with_modified(modified);
    }
    attributes
}

fn kind(metadata: &fs::Metadata) -> EntryType {
    if metadata.is_dir() {
        EntryType::DIRECTORY
    } else if metadata.file_type().is_symlink() {
        EntryType::FILE | EntryType::SYMLINK
    } else {
        EntryType::FILE
    }
}

impl ReadFeature for LocalBackend {
    fn read(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn io::Read + Send>> {
        connection_callback.check_cancelled()?;
        let mut handle = File::open(self.resolve(file)).map_err(|e| FeatureError::from_io(e, file))?;
        if status.offset > 0 {
            handle
                .seek(SeekFrom::Start(status.offset))
                .map_err(|e| FeatureError::from_io(e, file))?;
        }
        Ok(Box::new(io::BufReader::new(handle)))
    }
}

struct LocalWriter {
    handle: File,
    file: Path,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.flush()
    }
}

impl WriteStream for LocalWriter {
    fn finish(self: Box<Self>) -> Result<PathAttributes> {
        let LocalWriter { handle, file } = *self;
        handle.sync_all().map_err(|e| FeatureError::from_io(e, &file))?;
        let metadata = handle.metadata().map_err(|e| FeatureError::from_io(e, &file))?;
        Ok(attributes(&metadata))
    }
}

impl WriteFeature for LocalBackend {
    fn write(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn WriteStream>> {
        connection_callback.check_cancelled()?;
        let mut options = OpenOptions::new();
        options.create(true);
        if status.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let handle = options
            .open(self.resolve(file))
            .map_err(|e| FeatureError::from_io(e, file))?;
        Ok(Box::new(LocalWriter {
            handle,
            file: file.clone(),
        }))
    }

    fn supports_append(&self) -> bool {
        true
    }
}

impl ListFeature for LocalBackend {
    #[instrument(level = "trace", skip(self, listener))]
    fn list(
        &self,
        directory: &Path,
        listener: &dyn ListProgressListener,
    ) -> Result<AttributedList> {
        let entries = fs::read_dir(self.resolve(directory))
            .map_err(|e| FeatureError::from_io(e, directory))?;
        let mut listed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FeatureError::from_io(e, directory))?;
            let Ok(name) = entry.file_name().into_string() else {
                debug!(directory = %directory, "Skipping entry with non UTF-8 name");
                continue;
            };
            let metadata = entry
                .metadata()
                .map_err(|e| FeatureError::from_io(e, directory))?;
            listed.push(directory.child(&name, kind(&metadata)).with_attributes(attributes(&metadata)));
        }
        listener.chunk(directory, &listed)?;
        Ok(AttributedList::new(listed))
    }
}

impl FindFeature for LocalBackend {
    fn find(&self, file: &Path) -> Result<bool> {
        match fs::symlink_metadata(self.resolve(file)) {
            Ok(metadata) => Ok(metadata.is_dir() == file.is_directory()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FeatureError::from_io(e, file)),
        }
    }
}

impl DeleteFeature for LocalBackend {
    fn delete(
        &self,
        files: &[Path],
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<()> {
        for file in files {
            connection_callback.check_cancelled()?;
            if file.is_root() {
                return Err(FeatureError::AccessDenied {
                    path: file.clone(),
                    reason: "cannot delete the base directory".to_string(),
                });
            }
            let local = self.resolve(file);
            let metadata = fs::symlink_metadata(&local).map_err(|e| FeatureError::from_io(e, file))?;
            if metadata.is_dir() {
                fs::remove_dir_all(&local)
            } else {
                fs::remove_file(&local)
            }
            .map_err(|e| FeatureError::from_io(e, file))?;
            delete_callback.deleted(file);
        }
        Ok(())
    }
}

impl DirectoryFeature for LocalBackend {
    fn mkdir(&self, folder: &Path, _status: &TransferStatus) -> Result<Path> {
        fs::create_dir(self.resolve(folder)).map_err(|e| FeatureError::from_io(e, folder))?;
        Ok(folder.clone().with_kind(EntryType::DIRECTORY))
    }
}

impl MoveFeature for LocalBackend {
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        _status: &TransferStatus,
        _delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        connection_callback.check_cancelled()?;
        fs::rename(self.resolve(source), self.resolve(target))
            .map_err(|e| FeatureError::from_io(e, source))?;
        Ok(target.clone().with_kind(source.kind()))
    }

    fn with_delete(&self, _delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature {
        self
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn read_feature(&self) -> Option<Arc<dyn ReadFeature>> {
        Some(Arc::new(self.clone()))
    }

    fn write_feature(&self) -> Option<Arc<dyn WriteFeature>> {
        Some(Arc::new(self.clone()))
    }

    fn list_feature(&self) -> Option<Arc<dyn ListFeature>> {
        Some(Arc::new(self.clone()))
    }

    fn delete_feature(&self) -> Option<Arc<dyn DeleteFeature>> {
        Some(Arc::new(self.clone()))
    }

    fn directory_feature(&self) -> Option<Arc<dyn DirectoryFeature>> {
        Some(Arc::new(self.clone()))
    }

    fn find_feature(&self) -> Option<Arc<dyn FindFeature>> {
        Some(Arc::new(self.clone()))
    }

    fn move_feature(&self) -> Option<Arc<dyn MoveFeature>> {
        Some(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{
        DisabledConnectionCallback, DisabledDeleteCallback, DisabledListProgressListener,
    };
    use std::io::Read;
    use tempfile::TempDir;

    fn backend() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        (dir, backend)
    }

    fn write(backend: &LocalBackend, file: &Path, data: &[u8], append: bool) -> PathAttributes {
        let status = TransferStatus::new().append(append);
        let mut out = WriteFeature::write(backend, file, &status, &DisabledConnectionCallback).unwrap();
        out.write_all(data).unwrap();
        out.finish().unwrap()
    }

    #[test]
    fn test_write_append_and_read_from_offset() {
        let (_dir, backend) = backend();
        let file = Path::file("/a.txt");
        assert_eq!(write(&backend, &file, b"hello ", false).size, Some(6));
        assert_eq!(write(&backend, &file, b"world", true).size, Some(11));

        let mut input = backend
            .read(&file, &TransferStatus::new().offset(6), &DisabledConnectionCallback)
            .unwrap();
        let mut out = String::new();
        input.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
    }

    #[test]
    fn test_list_find_and_kinds() {
        let (_dir, backend) = backend();
        backend.mkdir(&Path::directory("/docs"), &TransferStatus::new()).unwrap();
        write(&backend, &Path::file("/docs/a.txt"), b"abc", false);

        let entries = backend
            .list(&Path::root(), &DisabledListProgressListener)
            .unwrap();
        assert!(entries.find_name("docs").unwrap().is_directory());

        let docs = backend
            .list(&Path::directory("/docs"), &DisabledListProgressListener)
            .unwrap();
        assert_eq!(docs.find_name("a.txt").unwrap().attributes().size, Some(3));

        assert!(backend.find(&Path::file("/docs/a.txt")).unwrap());
        assert!(!backend.find(&Path::directory("/docs/a.txt")).unwrap());
        assert!(!backend.find(&Path::file("/missing.txt")).unwrap());
    }

    #[test]
    fn test_parent_segments_stay_inside_base() {
        let outer = TempDir::new().unwrap();
        let base = outer.path().join("base");
        fs::create_dir(&base).unwrap();
        let backend = LocalBackend::new(&base);

        write(&backend, &Path::file("/../escaped.txt"), b"x", false);
        assert!(base.join("escaped.txt").is_file());
        assert!(!outer.path().join("escaped.txt").exists());
        assert_eq!(backend.resolve(&Path::directory("/../..")), base);
    }

    #[test]
    fn test_missing_entries_map_to_not_found() {
        let (_dir, backend) = backend();
        let err = backend
            .list(&Path::directory("/nope"), &DisabledListProgressListener)
            .unwrap_err();
        assert!(matches!(err, FeatureError::NotFound { .. }));

        let err = backend
            .mkdir(&Path::directory("/nope/deeper"), &TransferStatus::new())
            .unwrap_err();
        assert!(matches!(err, FeatureError::NotFound { .. }));
    }

    #[test]
    fn test_delete_tree_and_rename() {
        let (dir, backend) = backend();
        backend.mkdir(&Path::directory("/t"), &TransferStatus::new()).unwrap();
        write(&backend, &Path::file("/t/a.txt"), b"a", false);

        backend
            .move_to(
                &Path::directory("/t"),
                &Path::directory("/u"),
                &TransferStatus::new(),
                &DisabledDeleteCallback,
                &DisabledConnectionCallback,
            )
            .unwrap();
        assert!(dir.path().join("u/a.txt").exists());

        backend
            .delete(
                &[Path::directory("/u")],
                &DisabledDeleteCallback,
                &DisabledConnectionCallback,
            )
            .unwrap();
        assert!(!dir.path().join("u").exists());

        let err = backend
            .delete(&[Path::root()], &DisabledDeleteCallback, &DisabledConnectionCallback)
            .unwrap_err();
        assert!(matches!(err, FeatureError::AccessDenied { .. }));
    }
}
