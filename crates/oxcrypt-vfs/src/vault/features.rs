//! Capabilities inside an unlocked vault.
//!
//! Each feature takes plaintext paths, maps them onto ciphertext nodes and
//! performs the ciphertext I/O through the `proxy` it wraps. Auxiliary I/O
//! (directory ids, data directories) goes through the session's backend
//! features.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::stream::{DecryptingReader, EncryptingWriter, read_header};
use super::{DIR_ID_BACKUP_FILE, DIR_ID_FILE, Vault, VaultError, ensure_directory, write_fully};
use crate::callback::{
    ConnectionCallback, DeleteCallback, DisabledConnectionCallback, DisabledDeleteCallback,
    DisabledListProgressListener, ListProgressListener,
};
use crate::crypto::MasterKey;
use crate::crypto::content::{
    ContentContext, ContentError, FileHeader, chunk_ciphertext_offset, chunk_position, ciphertext_size,
    plaintext_size,
};
use crate::crypto::names::{ENCRYPTED_SUFFIX, decrypt_name, encrypt_name};
use crate::error::{FeatureError, Result};
use crate::feature::{
    AttributedList, CopyFeature, DeleteFeature, DirectoryFeature, FindFeature, ListFeature,
    MoveFeature, ReadFeature, TouchFeature, WriteFeature, WriteStream,
};
use crate::path::{EntryType, Path};
use crate::session::Session;
use crate::status::TransferStatus;

/// Fields shared by every vault feature.
macro_rules! vault_feature {
    ($(#[$meta:meta])* $name:ident, $proxy:ty) => {
        $(#[$meta])*
        pub struct $name {
            vault: Arc<Vault>,
            session: Arc<Session>,
            proxy: Arc<$proxy>,
        }

        impl $name {
            pub fn new(vault: Arc<Vault>, session: Arc<Session>, proxy: Arc<$proxy>) -> Self {
                Self { vault, session, proxy }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("vault", &self.vault.root())
                    .field("proxy", &self.proxy)
                    .finish()
            }
        }
    };
}

vault_feature!(
    /// Decrypting read with chunk-aligned random access.
    CryptoRead,
    dyn ReadFeature
);
vault_feature!(
    /// Encrypting write. Appending to ciphertext is not supported.
    CryptoWrite,
    dyn WriteFeature
);
vault_feature!(CryptoList, dyn ListFeature);
vault_feature!(CryptoFind, dyn FindFeature);
vault_feature!(
    /// Creates the directory node, its id file and its data directory.
    CryptoDirectory,
    dyn DirectoryFeature
);
vault_feature!(CryptoDelete, dyn DeleteFeature);
vault_feature!(
    /// Rename inside one vault by moving the ciphertext node.
    CryptoMove,
    dyn MoveFeature
);
vault_feature!(CryptoCopy, dyn CopyFeature);

fn header_error(file: &Path, err: ContentError) -> FeatureError {
    VaultError::Content(err.with_context(ContentContext::new().with_path(file.to_string()))).into()
}

impl ReadFeature for CryptoRead {
    #[instrument(level = "debug", skip(self, status, connection_callback), fields(offset = status.offset))]
    fn read(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn io::Read + Send>> {
        let key = self.vault.key()?;
        let node = self.vault.ciphertext_node(&self.session, &key, file)?;
        let (chunk, skip) = chunk_position(status.offset);

        let mut input = self.proxy.read(&node, &TransferStatus::new(), connection_callback)?;
        let header_bytes = read_header(input.as_mut(), file)?;
        let header = FileHeader::decrypt(&header_bytes, &key).map_err(|e| header_error(file, e))?;

        if chunk > 0 {
            // Reopen at the chunk holding the offset
            let seek = TransferStatus::new().offset(chunk_ciphertext_offset(chunk));
            input = self.proxy.read(&node, &seek, connection_callback)?;
        }
        Ok(Box::new(DecryptingReader::new(
            input,
            header,
            file.clone(),
            chunk,
            skip,
        )))
    }
}

impl WriteFeature for CryptoWrite {
    #[instrument(level = "debug", skip(self, status, connection_callback))]
    fn write(
        &self,
        file: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Box<dyn WriteStream>> {
        if status.is_resume() {
            return Err(FeatureError::Unsupported {
                capability: "append",
                backend: format!("vault {}", self.vault.root()),
            });
        }
        let key = self.vault.key()?;
        let node = self.vault.ciphertext_node(&self.session, &key, file)?;

        let mut raw = TransferStatus::new().exists(status.exists);
        if let Some(length) = status.length {
            raw = raw.length(ciphertext_size(length));
        }
        if let Some(modified) = status.modified {
            raw = raw.modified(modified);
        }

        let mut output = self.proxy.write(&node, &raw, connection_callback)?;
        let header = FileHeader::random();
        let header_bytes = header.encrypt(&key).map_err(|e| header_error(file, e))?;
        output
            .write_all(&header_bytes)
            .map_err(|e| FeatureError::from_io(e, file))?;
        Ok(Box::new(EncryptingWriter::new(output, header, file.clone())))
    }
}

impl CryptoList {
    fn decrypt_entries(&self, key: &MasterKey, directory: &Path) -> Result<Vec<Path>> {
        let dir_id = self.vault.dir_id(&self.session, key, directory)?;
        let data_dir = self.vault.data_dir(key, &dir_id)?;
        let entries = self.proxy.list(&data_dir, &DisabledListProgressListener)?;

        let mut plain = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(name) = entry.name() else { continue };
            if !name.ends_with(ENCRYPTED_SUFFIX) || name == DIR_ID_BACKUP_FILE {
                continue;
            }
            match decrypt_name(name, &dir_id, key) {
                Ok(clear) => {
                    let mut attributes = entry.attributes().clone();
                    if entry.is_file() {
                        attributes.size = attributes.size.and_then(plaintext_size);
                    }
                    let kind = if entry.is_directory() {
                        EntryType::DIRECTORY
                    } else {
                        EntryType::FILE
                    };
                    plain.push(directory.child(&clear, kind).with_attributes(attributes));
                }
                Err(e) => warn!(directory = %directory, error = %e, "Skipping undecryptable entry"),
            }
        }
        Ok(plain)
    }
}

impl ListFeature for CryptoList {
    #[instrument(level = "debug", skip(self, listener))]
    fn list(&self, directory: &Path, listener: &dyn ListProgressListener) -> Result<AttributedList> {
        let key = self.vault.key()?;
        let entries = self.decrypt_entries(&key, directory)?;
        listener.chunk(directory, &entries)?;
        Ok(AttributedList::new(entries))
    }
}

impl FindFeature for CryptoFind {
    fn find(&self, file: &Path) -> Result<bool> {
        if self.vault.is_root(file) {
            return self.proxy.find(file);
        }
        let key = self.vault.key()?;
        match self.vault.ciphertext_node(&self.session, &key, file) {
            Ok(node) => self.proxy.find(&node),
            // Missing parent directory
            Err(FeatureError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl DirectoryFeature for CryptoDirectory {
    #[instrument(level = "debug", skip(self, status))]
    fn mkdir(&self, folder: &Path, status: &TransferStatus) -> Result<Path> {
        let key = self.vault.key()?;
        let folder = folder.clone().with_kind(EntryType::DIRECTORY);
        let node = self.vault.ciphertext_node(&self.session, &key, &folder)?;

        let dir_id = Uuid::new_v4().to_string();
        self.proxy.mkdir(&node, status)?;
        write_fully(&self.session, &node.child_file(DIR_ID_FILE), dir_id.as_bytes())?;

        let data_dir = self.vault.data_dir(&key, &dir_id)?;
        if let Some(prefix) = data_dir.parent() {
            ensure_directory(&self.session, &prefix)?;
        }
        ensure_directory(&self.session, &data_dir)?;

        self.vault.cache_dir_id(&folder, dir_id);
        debug!(folder = %folder, "Created vault directory");
        Ok(folder)
    }
}

/// Empty encrypted file: a header and one empty chunk.
pub struct CryptoTouch {
    vault: Arc<Vault>,
    session: Arc<Session>,
}

impl CryptoTouch {
    pub fn new(vault: Arc<Vault>, session: Arc<Session>) -> Self {
        Self { vault, session }
    }
}

impl fmt::Debug for CryptoTouch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoTouch")
            .field("vault", &self.vault.root())
            .finish()
    }
}

impl TouchFeature for CryptoTouch {
    fn touch(&self, file: &Path, status: &TransferStatus) -> Result<Path> {
        let proxy = self.session.raw::<dyn WriteFeature>()?;
        let write = CryptoWrite::new(Arc::clone(&self.vault), Arc::clone(&self.session), proxy);
        let status = status.clone().length(0).append(false).offset(0);
        let stream = write.write(file, &status, &DisabledConnectionCallback)?;
        let attributes = stream.finish()?;
        Ok(file.clone().with_attributes(attributes))
    }
}

impl CryptoDelete {
    fn delete_one(
        &self,
        key: &MasterKey,
        file: &Path,
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<()> {
        connection_callback.check_cancelled()?;
        if self.vault.is_root(file) {
            return self
                .proxy
                .delete(std::slice::from_ref(file), delete_callback, connection_callback);
        }
        let node = self.vault.ciphertext_node(&self.session, key, file)?;
        if file.is_directory() {
            let lister = CryptoList::new(
                Arc::clone(&self.vault),
                Arc::clone(&self.session),
                self.session.raw::<dyn ListFeature>()?,
            );
            for child in lister.decrypt_entries(key, file)? {
                self.delete_one(key, &child, delete_callback, connection_callback)?;
            }
            let dir_id = self.vault.dir_id(&self.session, key, file)?;
            let data_dir = self.vault.data_dir(key, &dir_id)?;
            self.proxy
                .delete(&[data_dir, node], &DisabledDeleteCallback, connection_callback)?;
            self.vault.invalidate_subtree(file);
        } else {
            self.proxy
                .delete(&[node], &DisabledDeleteCallback, connection_callback)?;
        }
        delete_callback.deleted(file);
        Ok(())
    }
}

impl DeleteFeature for CryptoDelete {
    #[instrument(level = "debug", skip_all, fields(count = files.len()))]
    fn delete(
        &self,
        files: &[Path],
        delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<()> {
        let key = self.vault.key()?;
        for file in files {
            self.delete_one(&key, file, delete_callback, connection_callback)?;
        }
        Ok(())
    }

    fn is_supported(&self, file: &Path) -> bool {
        self.proxy.is_supported(file)
    }
}

impl MoveFeature for CryptoMove {
    #[instrument(level = "debug", skip(self, status, _delete_callback, connection_callback))]
    fn move_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        _delete_callback: &dyn DeleteCallback,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        let key = self.vault.key()?;
        let target = target.clone().with_kind(source.kind());
        let from = self.vault.ciphertext_node(&self.session, &key, source)?;
        let to = self.vault.ciphertext_node(&self.session, &key, &target)?;

        // Ciphertext paths never reach the caller's delete callback
        self.proxy
            .move_to(&from, &to, status, &DisabledDeleteCallback, connection_callback)?;
        if source.is_directory() {
            self.vault.invalidate_subtree(source);
            self.vault.invalidate_subtree(&target);
        }
        Ok(target)
    }

    fn is_supported(&self, source: &Path, _target: &Path) -> bool {
        !self.vault.is_root(source)
    }

    fn is_recursive(&self, source: &Path, target: &Path) -> bool {
        source.is_directory() && self.proxy.is_recursive(source, target)
    }

    fn with_delete(&self, delete: Arc<dyn DeleteFeature>) -> &dyn MoveFeature {
        self.proxy.with_delete(delete);
        self
    }
}

impl CryptoCopy {
    fn copy_directory(
        &self,
        source: &Path,
        target: &Path,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        let directory = CryptoDirectory::new(
            Arc::clone(&self.vault),
            Arc::clone(&self.session),
            self.session.raw::<dyn DirectoryFeature>()?,
        );
        let target = directory.mkdir(target, &TransferStatus::new())?;

        let key = self.vault.key()?;
        let lister = CryptoList::new(
            Arc::clone(&self.vault),
            Arc::clone(&self.session),
            self.session.raw::<dyn ListFeature>()?,
        );
        for child in lister.decrypt_entries(&key, source)? {
            connection_callback.check_cancelled()?;
            let Some(name) = child.name() else { continue };
            let child_target = target.child(name, child.kind());
            self.copy_to(&child, &child_target, &TransferStatus::new(), connection_callback)?;
        }
        Ok(target)
    }
}

impl CopyFeature for CryptoCopy {
    /// Files are copied as ciphertext under a re-encrypted name. Directories
    /// get a fresh id and are copied entry by entry.
    #[instrument(level = "debug", skip(self, status, connection_callback))]
    fn copy_to(
        &self,
        source: &Path,
        target: &Path,
        status: &TransferStatus,
        connection_callback: &dyn ConnectionCallback,
    ) -> Result<Path> {
        if source.is_directory() {
            return self.copy_directory(source, target, connection_callback);
        }
        let key = self.vault.key()?;
        let target = target.clone().with_kind(EntryType::FILE);
        let from = self.vault.ciphertext_node(&self.session, &key, source)?;
        let to = self.vault.ciphertext_node(&self.session, &key, &target)?;

        let mut raw = TransferStatus::new().exists(status.exists);
        if let Some(length) = status.length {
            raw = raw.length(ciphertext_size(length));
        }
        let copied = self.proxy.copy_to(&from, &to, &raw, connection_callback)?;
        let mut attributes = copied.attributes().clone();
        attributes.size = attributes.size.and_then(plaintext_size);
        Ok(target.with_attributes(attributes))
    }

    fn is_supported(&self, source: &Path, target: &Path) -> bool {
        !self.vault.is_root(source) && self.proxy.is_supported(source, target)
    }

    fn is_recursive(&self, source: &Path, _target: &Path) -> bool {
        source.is_directory()
    }
}
