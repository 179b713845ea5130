//! Chunked encryption adapters over backend streams.

use std::io::{self, Read, Write};

use tracing::trace;
use zeroize::Zeroizing;

use crate::crypto::content::{
    CHUNK_CIPHERTEXT_SIZE, CHUNK_PLAINTEXT_SIZE, ContentContext, ContentError, FileHeader,
    HEADER_SIZE, plaintext_size,
};
use crate::error::{FeatureError, Result};
use crate::feature::WriteStream;
use crate::path::{Path, PathAttributes};

use super::VaultError;

/// Read until `buf` is full or the input ends. Returns the bytes read.
pub(crate) fn read_full(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read the encrypted file header at the start of `input`.
pub(crate) fn read_header(input: &mut dyn Read, file: &Path) -> Result<[u8; HEADER_SIZE]> {
    let mut header = [0u8; HEADER_SIZE];
    let n = read_full(input, &mut header).map_err(|e| FeatureError::from_io(e, file))?;
    if n < HEADER_SIZE {
        return Err(VaultError::Content(ContentError::InvalidHeader {
            reason: format!("file truncated to {n} bytes"),
            context: ContentContext::new().with_path(file.to_string()),
        })
        .into());
    }
    Ok(header)
}

fn content_error(file: &Path, err: ContentError) -> io::Error {
    let err = err.with_context(ContentContext::new().with_path(file.to_string()));
    FeatureError::from(VaultError::Content(err)).into_io()
}

/// Decrypts a ciphertext body chunk by chunk.
///
/// `inner` must be positioned at the start of chunk `first_chunk`; the first
/// `skip` plaintext bytes of that chunk are discarded.
pub struct DecryptingReader {
    inner: Box<dyn Read + Send>,
    header: FileHeader,
    file: Path,
    chunk_number: u64,
    skip: usize,
    plaintext: Zeroizing<Vec<u8>>,
    position: usize,
    eof: bool,
}

impl DecryptingReader {
    pub fn new(
        inner: Box<dyn Read + Send>,
        header: FileHeader,
        file: Path,
        first_chunk: u64,
        skip: usize,
    ) -> Self {
        Self {
            inner,
            header,
            file,
            chunk_number: first_chunk,
            skip,
            plaintext: Zeroizing::new(Vec::new()),
            position: 0,
            eof: false,
        }
    }

    /// Decrypt the next chunk. Returns `false` once the input is exhausted.
    fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = vec![0u8; CHUNK_CIPHERTEXT_SIZE];
        let n = read_full(self.inner.as_mut(), &mut chunk)?;
        if n < CHUNK_CIPHERTEXT_SIZE {
            self.eof = true;
        }
        if n == 0 {
            return Ok(false);
        }
        chunk.truncate(n);

        let plaintext = self
            .header
            .decrypt_chunk(self.chunk_number, &chunk)
            .map_err(|e| content_error(&self.file, e))?;
        trace!(chunk = self.chunk_number, len = plaintext.len(), "Decrypted chunk");
        self.chunk_number += 1;
        self.plaintext = Zeroizing::new(plaintext);
        self.position = self.skip.min(self.plaintext.len());
        self.skip = 0;
        Ok(true)
    }
}

impl Read for DecryptingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let available = &self.plaintext[self.position..];
            if !available.is_empty() {
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.position += n;
                return Ok(n);
            }
            if !self.fill()? {
                return Ok(0);
            }
        }
    }
}

/// Encrypts written plaintext into chunks on a backend write stream.
///
/// The header must already have been written to `inner`.
pub struct EncryptingWriter {
    inner: Box<dyn WriteStream>,
    header: FileHeader,
    file: Path,
    chunk_number: u64,
    buffer: Zeroizing<Vec<u8>>,
}

impl EncryptingWriter {
    pub fn new(inner: Box<dyn WriteStream>, header: FileHeader, file: Path) -> Self {
        Self {
            inner,
            header,
            file,
            chunk_number: 0,
            buffer: Zeroizing::new(Vec::with_capacity(CHUNK_PLAINTEXT_SIZE)),
        }
    }

    fn emit(&mut self, len: usize) -> io::Result<()> {
        let plaintext: Zeroizing<Vec<u8>> = Zeroizing::new(self.buffer.drain(..len).collect());
        let chunk = self
            .header
            .encrypt_chunk(self.chunk_number, &plaintext)
            .map_err(|e| content_error(&self.file, e))?;
        self.inner.write_all(&chunk)?;
        self.chunk_number += 1;
        Ok(())
    }
}

impl Write for EncryptingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= CHUNK_PLAINTEXT_SIZE {
            self.emit(CHUNK_PLAINTEXT_SIZE)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteStream for EncryptingWriter {
    fn finish(self: Box<Self>) -> Result<PathAttributes> {
        let mut this = *self;
        // An empty file still carries one empty chunk
        if !this.buffer.is_empty() || this.chunk_number == 0 {
            let len = this.buffer.len();
            this.emit(len).map_err(|e| FeatureError::from_io(e, &this.file))?;
        }
        let mut attributes = this.inner.finish()?;
        attributes.size = attributes.size.and_then(plaintext_size);
        Ok(attributes)
    }
}
