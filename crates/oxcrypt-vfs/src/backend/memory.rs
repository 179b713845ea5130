//! In-memory backend.
//!
//! Models three storage flavors so the composed defaults and vault
//! decorators can be exercised without a network:
//!
//! - [`Flavor::Posix`]: native rename and server-side copy.
//! - [`Flavor::ObjectStore`]: top-level directories are buckets, move is a
//!   copy followed by a delete that callers may replace via `with_delete`.
//! - [`Flavor::Basic`]: only read, write, list, delete and mkdir.
//!
//! Every operation is journaled, and single operations can be made to fail
//! or be denied to simulate flaky or restricted storage.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::callback::{ConnectionCallback, DeleteCallback, ListProgressListener};
use crate::error::{FeatureError, Result};
use crate::feature::{
    AttributedList, CopyFeature, DeleteFeature, DirectoryFeature, ListFeature, MoveFeature,
    ReadFeature, WriteFeature, WriteStream,
};
use crate::path::{EntryType, Path, PathAttributes};
use crate::session::Backend;
use crate::status::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Posix,
    ObjectStore,
    Basic,
}

/// Operation kinds recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    List,
    Delete,
    Mkdir,
    Move,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    /// Absolute path the operation targeted.
    pub path: String,
}

struct Node {
    kind: EntryType,
    data: Vec<u8>,
    modified: SystemTime,
}

impl Node {
    fn directory(kind: EntryType) -> Self {
        Node {
            kind,
            data: Vec::new(),
            modified: SystemTime::now(),
        }
    }

    fn is_directory(&self) -> bool {
        self.kind.contains(EntryType::DIRECTORY)
    }
}

struct State {
    nodes: BTreeMap<String, Node>,
    journal: Vec<Op>,
    faults: Vec<(OpKind, String)>,
    denied: HashSet<String>,
}

impl State {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::directory(EntryType::DIRECTORY | EntryType::VOLUME),
        );
        State {
            nodes,
            journal: Vec::new(),
            faults: Vec::new(),
            denied: HashSet::new(),
        }
    }

    /// Journal the operation, then apply injected faults and denials.
    fn enter(&mut self, kind: OpKind, path: &Path) -> Result<()> {
        trace!(?kind, path = %path, "Memory backend operation");
        self.journal.push(Op {
            kind,
            path: path.to_string(),
        });
        if let Some(index) = self
            .faults
            .iter()
            .position(|(k, p)| *k == kind && p == path.as_str())
        {
            self.faults.remove(index);
            return Err(FeatureError::transfer(path, "injected fault"));
        }
        if self
            .denied
            .iter()
            .any(|denied| within(path.as_str(), denied))
        {
            return Err(FeatureError::AccessDenied {
                path: path.clone(),
                reason: "permission denied".to_string(),
            });
        }
        Ok(())
    }

    fn require_directory(&self, directory: &Path) -> Result<()> {
        match self.nodes.get(directory.as_str()) {
            Some(node) if node.is_directory() => Ok(()),
            _ => Err(FeatureError::not_found(directory)),
        }
    }

    fn require_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) => self.require_directory(&parent),
            None => Err(FeatureError::AccessDenied {
                path: path.clone(),
                reason: "cannot replace the root".to_string(),
            }),
        }
    }

    /// Keys of `path` and everything below it.
    fn subtree(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|key| within(key, path))
            .cloned()
            .collect()
    }

    fn remove_subtree(&mut self, path: &str) {
        for key in self.subtree(path) {
            self.nodes.remove(&key);
        }
    }

    fn copy_subtree(&mut self, from: &str, to: &str) {
        let copies: Vec<(String, Node)> = self
            .subtree(from)
            .into_iter()
            .filter_map(|key| {
                let node = self.nodes.get(&key)?;
                let rebased = format!("{to}{}", &key[from.len()..]);
                Some((
                    rebased,
                    Node {
                        kind: node.kind,
                        data: node.data.clone(),
                        modified: SystemTime::now(),
                    },
                ))
            })
            .collect();
        for (key, node) in copies {
            self.nodes.insert(key, node);
        }
    }
}

/// Whether `path` equals `ancestor` or lies below it.
fn within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Clone)]
struct Store {
    flavor: Flavor,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

impl Store {
    fn copy(&self, source: &Path, target: &Path) -> Result<Path> {
        let mut state = self.state.lock();
        state.enter(OpKind::Copy, source)?;
        let Some(node) = state.nodes.get(source.as_str()) else {
            return Err(FeatureError::not_found(source));
        };
        let kind = node.kind;
        state.require_parent(target)?;
        state.remove_subtree(target.as_str());
        state.copy_subtree(source.as_str(), target.as_str());
        let size = state.nodes.get(target.as_str()).map_or(0, |n| n.data.len() as u64);
        Ok(target
            .clone()
            .with_kind(kind)
            .with_attributes(PathAttributes::default().with_size(size)))
    }

    fn delete_one(&self, file: &Path, callback: &dyn DeleteCallback) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(OpKind::Delete, file)?;
        if file.is_root() {
            return Err(FeatureError::AccessDenied {
                path: file.clone(),
                reason: "cannot delete the root".to_string(),
            });
        }
        if !state.nodes.contains_key(file.as_str()) {
            return Err(FeatureError::not_found(file));
        }
        state.remove_subtree(file.as_str());
        drop(state);
        callback.deleted(file);
        Ok(())
    }
}

impl ReadFeature for Store {
    fn read(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn io::Read + Send>> {
        connection_callback.check_cancelled()?;
        let mut state = self.state.lock();
        state.enter(OpKind::Read, file)?;
        match state.nodes.get(file.as_str()) {
            Some(node) if !node.is_directory() => {
                let start = usize::try_from(status.offset)
                    .unwrap_or(usize::MAX)
                    .min(node.data.len());
                Ok(Box::new(Cursor::new(node.data[start..].to_vec())))
            }
            Some(_) => Err(FeatureError::transfer(file, "is a directory")),
            None => Err(FeatureError::not_found(file)),
        }
    }
}

/// Buffered upload, stored when finished.
struct MemoryWriter {
    state: Arc<Mutex<State>>,
    file: Path,
    buffer: Vec<u8>,
    modified: Option<SystemTime>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteStream for MemoryWriter {
    fn finish(self: Box<Self>) -> Result<PathAttributes> {
        let MemoryWriter {
            state,
            file,
            buffer,
            modified,
        } = *self;
        let mut state = state.lock();
        state.require_parent(&file)?;
        let modified = modified.unwrap_or_else(SystemTime::now);
        let size = buffer.len() as u64;
        state.nodes.insert(
            file.as_str().to_string(),
            Node {
                kind: EntryType::FILE,
                data: buffer,
                modified,
            },
        );
        Ok(PathAttributes::default()
            .with_size(size)
            .with_modified(modified))
    }
}

impl WriteFeature for Store {
    fn write(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn WriteStream>> {
        connection_callback.check_cancelled()?;
        let mut state = self.state.lock();
        state.enter(OpKind::Write, file)?;
        state.require_parent(file)?;
        let existing = state.nodes.get(file.as_str());
        if existing.is_some_and(Node::is_directory) {
            return Err(FeatureError::AlreadyExists { path: file.clone() });
        }
        let buffer = match existing {
            Some(node) if status.append => node.data.clone(),
            _ => Vec::new(),
        };
        Ok(Box::new(MemoryWriter {
            state: Arc::clone(&self.state),
            file: file.clone(),
            buffer,
            modified: status.modified,
        }))
    }

    fn supports_append(&self) -> bool {
        true
    }
}

impl ListFeature for Store {
    fn list(
        &self,
        directory: &Path,
        listener: &dyn ListProgressListener,
    ) -> Result<AttributedList> {
        let entries: Vec<Path> = {
            let mut state = self.state.lock();
            state.enter(OpKind::List, directory)?;
            state.require_directory(directory)?;
            state
                .nodes
                .iter()
                .filter(|(key, _)| {
                    !key.is_empty()
                        && Path::file(key.as_str())
                            .parent()
                            .is_some_and(|parent| parent.as_str() == directory.as_str())
                })
                .map(|(key, node)| {
                    let mut attributes = PathAttributes::default().with_modified(node.modified);
                    if !node.is_directory() {
                        attributes = attributes.with_size(node.data.len() as u64);
                    }
                    Path::new(key, node.kind).with_attributes(attributes)
                })
                .collect()
        };
        listener.chunk(directory, &entries)?;
        Ok(AttributedList::new(entries))
    }
}

impl DeleteFeature for Store {
    fn delete(
        &self,
        files: &[Path],
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<()> {
        for file in files {
            connection_callback.check_cancelled()?;
            self.delete_one(file, delete_callback)?;
        }
        Ok(())
    }
}

impl DirectoryFeature for Store {
    fn mkdir(&self, folder: &Path, _status: &TransferStatus) -> Result<Path> {
        let mut state = self.state.lock();
        state.enter(OpKind::Mkdir, folder)?;
        state.require_parent(folder)?;
        if state.nodes.contains_key(folder.as_str()) {
            return Err(FeatureError::AlreadyExists {
                path: folder.clone(),
            });
        }
        let kind = if self.flavor == Flavor::ObjectStore && folder.depth() == 1 {
            EntryType::DIRECTORY | EntryType::VOLUME
        } else {
            EntryType::DIRECTORY
        };
        state
            .nodes
            .insert(folder.as_str().to_string(), Node::directory(kind));
        Ok(folder.clone().with_kind(kind))
    }
}

impl CopyFeature for Store {
    fn copy_to(
        &self,
        source: &Path,
        target: &Path,
        _status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        connection_callback.check_cancelled()?;
        self.copy(source, target)
    }

    fn is_recursive(&self, _source: &Path, _target: &Path) -> bool {
        true
    }
}

/// Native rename.
impl MoveFeature for Store {
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        _status: &TransferStatus,
        _delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        connection_callback.check_cancelled()?;
        let mut state = self.state.lock();
        state.enter(OpKind::Move, source)?;
        let Some(kind) = state.nodes.get(source.as_str()).map(|n| n.kind) else {
            return Err(FeatureError::not_found(source));
        };
        state.require_parent(target)?;
        state.remove_subtree(target.as_str());
        state.copy_subtree(source.as_str(), target.as_str());
        state.remove_subtree(source.as_str());
        Ok(target.clone().with_kind(kind))
    }

    fn with_delete(&self, _delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature {
        self
    }
}

/// Bucket-style move: server-side copy, then delete.
struct ObjectStoreMove {
    store: Store,
    delete: RwLock<Option<Arc<dyn DeleteFeature>>>,
}

impl fmt::Debug for ObjectStoreMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreMove")
            .field("delete", &*self.delete.read())
            .finish()
    }
}

impl MoveFeature for ObjectStoreMove {
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        _status: &TransferStatus,
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        connection_callback.check_cancelled()?;
        self.store.state.lock().enter(OpKind::Move, source)?;
        if target.parent().is_none_or(|parent| parent.is_root()) {
            return Err(FeatureError::transfer(
                target,
                "objects cannot be placed outside a bucket",
            ));
        }
        let moved = self.store.copy(source, target)?;
        let delete: Arc<dyn DeleteFeature> = match self.delete.read().as_ref() {
            Some(delete) => Arc::clone(delete),
            None => Arc::new(self.store.clone()),
        };
        delete
            .delete(std::slice::from_ref(source), delete_callback, connection_callback)
            .map_err(|cause| FeatureError::MoveIncomplete {
                from: source.clone(),
                to: target.clone(),
                cause: Box::new(cause),
            })?;
        Ok(moved)
    }

    fn is_supported(&self, source: &Path, _target: &Path) -> bool {
        !source.is_volume() && source.depth() > 1
    }

    fn is_recursive(&self, _source: &Path, _target: &Path) -> bool {
        true
    }

    fn with_delete(&self, delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature {
        *self.delete.write() = Some(delete);
        self
    }
}

/// In-memory storage with a journal of every backend operation.
pub struct MemoryBackend {
    name: String,
    store: Store,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("name", &self.name)
            .field("flavor", &self.store.flavor)
            .finish()
    }
}

impl MemoryBackend {
    pub fn new(flavor: Flavor) -> Self {
        let name = match flavor {
            Flavor::Posix => "memory",
            Flavor::ObjectStore => "memory-objects",
            Flavor::Basic => "memory-basic",
        };
        Self {
            name: name.to_string(),
            store: Store {
                flavor,
                state: Arc::new(Mutex::new(State::new())),
            },
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.store.flavor
    }

    /// All journaled operations, oldest first.
    pub fn journal(&self) -> Vec<Op> {
        self.store.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.store.state.lock().journal.clear();
    }

    /// Journaled operations of `kind`.
    pub fn count(&self, kind: OpKind) -> usize {
        self.store
            .state
            .lock()
            .journal
            .iter()
            .filter(|op| op.kind == kind)
            .count()
    }

    /// Fail the next operation of `kind` on `path` with a transfer error.
    pub fn fail_next(&self, kind: OpKind, path: &Path) {
        self.store
            .state
            .lock()
            .faults
            .push((kind, path.as_str().to_string()));
    }

    /// Deny every operation on `path` and below.
    pub fn deny(&self, path: &Path) {
        self.store
            .state
            .lock()
            .denied
            .insert(path.as_str().to_string());
    }

    pub fn allow(&self, path: &Path) {
        self.store.state.lock().denied.remove(path.as_str());
    }

    /// Store `data` at `file`, creating missing parent directories.
    pub fn put_file(&self, file: &Path, data: &[u8]) {
        let mut state = self.store.state.lock();
        for ancestor in file.ancestors().filter(|a| !a.is_root()) {
            state
                .nodes
                .entry(ancestor.as_str().to_string())
                .or_insert_with(|| Node::directory(EntryType::DIRECTORY));
        }
        state.nodes.insert(
            file.as_str().to_string(),
            Node {
                kind: EntryType::FILE,
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
    }

    /// Raw stored bytes of `file`.
    pub fn content(&self, file: &Path) -> Option<Vec<u8>> {
        self.store
            .state
            .lock()
            .nodes
            .get(file.as_str())
            .filter(|node| !node.is_directory())
            .map(|node| node.data.clone())
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.store.state.lock().nodes.contains_key(path.as_str())
    }

    /// Every stored path below `path`, excluding `path` itself.
    pub fn paths_below(&self, path: &Path) -> Vec<String> {
        let state = self.store.state.lock();
        state
            .subtree(path.as_str())
            .into_iter()
            .filter(|key| key != path.as_str())
            .collect()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_feature(&self) -> Option<Arc<dyn ReadFeature>> {
        Some(Arc::new(self.store.clone()))
    }

    fn write_feature(&self) -> Option<Arc<dyn WriteFeature>> {
        Some(Arc::new(self.store.clone()))
    }

    fn list_feature(&self) -> Option<Arc<dyn ListFeature>> {
        Some(Arc::new(self.store.clone()))
    }

    fn delete_feature(&self) -> Option<Arc<dyn DeleteFeature>> {
        Some(Arc::new(self.store.clone()))
    }

    fn directory_feature(&self) -> Option<Arc<dyn DirectoryFeature>> {
        Some(Arc::new(self.store.clone()))
    }

    fn copy_feature(&self) -> Option<Arc<dyn CopyFeature>> {
        match self.store.flavor {
            Flavor::Posix | Flavor::ObjectStore => Some(Arc::new(self.store.clone())),
            Flavor::Basic => None,
        }
    }

    fn move_feature(&self) -> Option<Arc<dyn MoveFeature>> {
        match self.store.flavor {
            Flavor::Posix => Some(Arc::new(self.store.clone())),
            Flavor::ObjectStore => Some(Arc::new(ObjectStoreMove {
                store: self.store.clone(),
                delete: RwLock::new(None),
            })),
            Flavor::Basic => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{
        DisabledConnectionCallback, DisabledDeleteCallback, DisabledListProgressListener,
    };
    use std::io::Read;

    fn read_all(backend: &MemoryBackend, file: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        backend
            .read_feature()
            .unwrap()
            .read(file, &TransferStatus::new(), &DisabledConnectionCallback)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_write_requires_parent() {
        let backend = MemoryBackend::new(Flavor::Posix);
        let write = backend.write_feature().unwrap();
        let err = write
            .write(
                &Path::file("/missing/a.txt"),
                &TransferStatus::new(),
                &DisabledConnectionCallback,
            )
            .err()
            .unwrap();
        assert!(matches!(err, FeatureError::NotFound { .. }));
    }

    #[test]
    fn test_write_lands_on_finish_and_appends() {
        let backend = MemoryBackend::new(Flavor::Posix);
        let write = backend.write_feature().unwrap();
        let file = Path::file("/a.txt");

        let mut stream = write
            .write(&file, &TransferStatus::new(), &DisabledConnectionCallback)
            .unwrap();
        stream.write_all(b"hello").unwrap();
        assert!(!backend.exists(&file));
        assert_eq!(stream.finish().unwrap().size, Some(5));

        let mut stream = write
            .write(&file, &TransferStatus::new().append(true), &DisabledConnectionCallback)
            .unwrap();
        stream.write_all(b" world").unwrap();
        stream.finish().unwrap();
        assert_eq!(read_all(&backend, &file), b"hello world");
    }

    #[test]
    fn test_list_direct_children_only() {
        let backend = MemoryBackend::new(Flavor::Posix);
        backend.put_file(&Path::file("/dir/a.txt"), b"a");
        backend.put_file(&Path::file("/dir/sub/b.txt"), b"bb");

        let list = backend
            .list_feature()
            .unwrap()
            .list(&Path::directory("/dir"), &DisabledListProgressListener)
            .unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&Path::file("/dir/a.txt")));
        assert!(list.contains(&Path::directory("/dir/sub")));
        assert_eq!(list.find_name("a.txt").unwrap().attributes().size, Some(1));
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let backend = MemoryBackend::new(Flavor::Posix);
        let file = Path::file("/a.txt");
        backend.put_file(&file, b"x");
        backend.fail_next(OpKind::Read, &file);

        let read = backend.read_feature().unwrap();
        let err = read
            .read(&file, &TransferStatus::new(), &DisabledConnectionCallback)
            .err()
            .unwrap();
        assert!(err.is_retryable());
        assert_eq!(read_all(&backend, &file), b"x");
    }

    #[test]
    fn test_denied_subtree() {
        let backend = MemoryBackend::new(Flavor::Posix);
        backend.put_file(&Path::file("/secret/a.txt"), b"x");
        backend.deny(&Path::directory("/secret"));

        let err = backend
            .list_feature()
            .unwrap()
            .list(&Path::directory("/secret"), &DisabledListProgressListener)
            .unwrap_err();
        assert!(matches!(err, FeatureError::AccessDenied { .. }));
    }

    #[test]
    fn test_object_store_buckets() {
        let backend = MemoryBackend::new(Flavor::ObjectStore);
        let mkdir = backend.directory_feature().unwrap();
        let bucket = mkdir
            .mkdir(&Path::directory("/bucket"), &TransferStatus::new())
            .unwrap();
        assert!(bucket.is_volume());

        let mv = backend.move_feature().unwrap();
        assert!(!mv.is_supported(&bucket, &Path::directory("/other")));

        backend.put_file(&Path::file("/bucket/a.txt"), b"x");
        let err = mv
            .move_to(
                &Path::file("/bucket/a.txt"),
                &Path::file("/a.txt"),
                &TransferStatus::new(),
                &DisabledDeleteCallback,
                &DisabledConnectionCallback,
            )
            .unwrap_err();
        assert!(matches!(err, FeatureError::TransferFailure { .. }));
        assert!(backend.exists(&Path::file("/bucket/a.txt")));
    }

    #[test]
    fn test_posix_move_renames_subtree() {
        let backend = MemoryBackend::new(Flavor::Posix);
        backend.put_file(&Path::file("/a/x/1.txt"), b"1");
        let mv = backend.move_feature().unwrap();
        mv.move_to(
            &Path::directory("/a"),
            &Path::directory("/b"),
            &TransferStatus::new(),
            &DisabledDeleteCallback,
            &DisabledConnectionCallback,
        )
        .unwrap();
        assert!(!backend.exists(&Path::directory("/a")));
        assert_eq!(backend.content(&Path::file("/b/x/1.txt")).unwrap(), b"1");
        assert_eq!(backend.count(OpKind::Move), 1);
    }
}
