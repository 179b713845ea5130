//! Protocol-independent paths.
//!
//! A [`Path`] names a location on any backend with `/` as the separator and
//! carries its entry type plus an attribute bag filled in by listings. Paths
//! are normalized on construction so two spellings of the same location
//! compare equal regardless of which session or feature produced them.

use relative_path::{Component, RelativePath, RelativePathBuf};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::BitOr;
use std::time::SystemTime;

/// Entry type flags.
///
/// Backends combine flags, e.g. a bucket root is `DIRECTORY | VOLUME`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryType(u8);

impl EntryType {
    pub const FILE: EntryType = EntryType(0b0001);
    pub const DIRECTORY: EntryType = EntryType(0b0010);
    pub const SYMLINK: EntryType = EntryType(0b0100);
    /// Top-level container such as a storage bucket.
    pub const VOLUME: EntryType = EntryType(0b1000);

    #[inline]
    pub fn contains(self, other: EntryType) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for EntryType {
    type Output = EntryType;

    fn bitor(self, rhs: EntryType) -> EntryType {
        EntryType(self.0 | rhs.0)
    }
}

impl fmt::Debug for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (flag, name) in [
            (EntryType::FILE, "FILE"),
            (EntryType::DIRECTORY, "DIRECTORY"),
            (EntryType::SYMLINK, "SYMLINK"),
            (EntryType::VOLUME, "VOLUME"),
        ] {
            if self.contains(flag) {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            write!(f, "EntryType(empty)")
        } else {
            write!(f, "{}", parts.join(" | "))
        }
    }
}

/// Mutable attribute bag attached to a path.
///
/// Attributes never take part in equality or hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathAttributes {
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
}

impl PathAttributes {
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// An absolute location on a backend.
///
/// # Examples
///
/// ```
/// use oxcrypt_vfs::path::Path;
///
/// let file = Path::file("/vault/./docs/../a.txt");
/// assert_eq!(file.to_string(), "/vault/a.txt");
/// assert_eq!(file.name(), Some("a.txt"));
/// assert!(file.is_within(&Path::directory("/vault")));
/// ```
#[derive(Clone)]
pub struct Path {
    inner: RelativePathBuf,
    kind: EntryType,
    attributes: PathAttributes,
}

impl Path {
    /// Create a path, normalizing `.`/`..` segments and redundant separators.
    /// `..` never climbs above the root.
    pub fn new(path: impl AsRef<str>, kind: EntryType) -> Self {
        let trimmed = path.as_ref().trim_start_matches('/');
        Path {
            inner: normalize(RelativePath::new(trimmed)),
            kind,
            attributes: PathAttributes::default(),
        }
    }

    pub fn file(path: impl AsRef<str>) -> Self {
        Self::new(path, EntryType::FILE)
    }

    pub fn directory(path: impl AsRef<str>) -> Self {
        Self::new(path, EntryType::DIRECTORY)
    }

    /// The backend root `/`.
    pub fn root() -> Self {
        Self::new("", EntryType::DIRECTORY | EntryType::VOLUME)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.inner.as_str().is_empty()
    }

    /// Path without the leading separator, `""` for the root.
    #[inline]
    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }

    #[inline]
    pub fn as_relative_path(&self) -> &RelativePath {
        &self.inner
    }

    /// Absolute string form with a leading `/`.
    pub fn absolute(&self) -> String {
        format!("/{}", self.inner)
    }

    #[inline]
    pub fn kind(&self) -> EntryType {
        self.kind
    }

    #[inline]
    pub fn is_file(&self) -> bool {
        self.kind.contains(EntryType::FILE)
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.kind.contains(EntryType::DIRECTORY)
    }

    #[inline]
    pub fn is_volume(&self) -> bool {
        self.kind.contains(EntryType::VOLUME)
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.file_name()
    }

    /// Parent directory, `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }
        let parent = self
            .inner
            .parent()
            .map_or_else(RelativePathBuf::new, RelativePath::to_relative_path_buf);
        let kind = if parent.as_str().is_empty() {
            EntryType::DIRECTORY | EntryType::VOLUME
        } else {
            EntryType::DIRECTORY
        };
        Some(Path {
            inner: parent,
            kind,
            attributes: PathAttributes::default(),
        })
    }

    pub fn child(&self, name: &str, kind: EntryType) -> Path {
        Path {
            inner: normalize(&self.inner.join(name)),
            kind,
            attributes: PathAttributes::default(),
        }
    }

    pub fn child_file(&self, name: &str) -> Path {
        self.child(name, EntryType::FILE)
    }

    pub fn child_dir(&self, name: &str) -> Path {
        self.child(name, EntryType::DIRECTORY)
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        self.inner.components().count()
    }

    /// Whether `self` equals `ancestor` or lies below it.
    pub fn is_within(&self, ancestor: &Path) -> bool {
        self.relative_to(ancestor).is_some()
    }

    /// Whether `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Path) -> bool {
        self.relative_to(ancestor).is_some_and(|rest| !rest.as_str().is_empty())
    }

    /// Components of `self` below `base`, or `None` if `self` is not within `base`.
    pub fn relative_to(&self, base: &Path) -> Option<RelativePathBuf> {
        let mut own = self.inner.components();
        for expected in base.inner.components() {
            if own.next()? != expected {
                return None;
            }
        }
        let mut rest = RelativePathBuf::new();
        for component in own {
            rest.push(component.as_str());
        }
        Some(rest)
    }

    /// Replace the `from` prefix with `to`, keeping the entry type.
    pub fn rebase(&self, from: &Path, to: &Path) -> Option<Path> {
        let rest = self.relative_to(from)?;
        Some(Path {
            inner: normalize(&to.inner.join(rest.as_str())),
            kind: self.kind,
            attributes: self.attributes.clone(),
        })
    }

    /// Ancestors from the parent up to and including the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> {
        std::iter::successors(self.parent(), Path::parent)
    }

    #[inline]
    pub fn attributes(&self) -> &PathAttributes {
        &self.attributes
    }

    #[inline]
    pub fn attributes_mut(&mut self) -> &mut PathAttributes {
        &mut self.attributes
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: PathAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: EntryType) -> Self {
        self.kind = kind;
        self
    }

    /// Container-level flag used for equality: file vs directory.
    fn container_flag(&self) -> bool {
        self.is_directory()
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner && self.container_flag() == other.container_flag()
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
        self.container_flag().hash(state);
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.inner)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("path", &self.absolute())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Resolve `.` and `..` lexically, dropping `..` at the root.
fn normalize(path: &RelativePath) -> RelativePathBuf {
    let mut out = RelativePathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}
