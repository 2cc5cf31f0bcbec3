//! Archive sources: named, independently openable byte streams.
//!
//! A source knows its path, its declared [`ContainerType`] and how to open a
//! fresh forward-only stream.  Opening performs no reads; the first byte is
//! pulled only when the extractor starts decoding.  Streams are not reusable,
//! so every extraction attempt calls [`ArchiveSource::open`] again.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{CodecError, ContainerType};

/// Read buffer placed in front of on-disk sources.
const FILE_BUF: usize = 64 * 1024;

pub trait ArchiveSource: Send + Sync {
    /// Identifier used in logs, reports and sink callbacks.
    fn path(&self) -> &str;
    fn container_type(&self) -> ContainerType;
    /// Open a fresh stream positioned at the first byte.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

impl<T: ArchiveSource + ?Sized> ArchiveSource for Box<T> {
    fn path(&self) -> &str { (**self).path() }
    fn container_type(&self) -> ContainerType { (**self).container_type() }
    fn open(&self) -> io::Result<Box<dyn Read + Send>> { (**self).open() }
}

impl<T: ArchiveSource + ?Sized> ArchiveSource for Arc<T> {
    fn path(&self) -> &str { (**self).path() }
    fn container_type(&self) -> ContainerType { (**self).container_type() }
    fn open(&self) -> io::Result<Box<dyn Read + Send>> { (**self).open() }
}

impl<T: ArchiveSource + ?Sized> ArchiveSource for &T {
    fn path(&self) -> &str { (**self).path() }
    fn container_type(&self) -> ContainerType { (**self).container_type() }
    fn open(&self) -> io::Result<Box<dyn Read + Send>> { (**self).open() }
}

// ── FileSource ───────────────────────────────────────────────────────────────

/// A source backed by a file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    file:      PathBuf,
    display:   String,
    container: ContainerType,
}

impl FileSource {
    /// Infer the container type from the file extension.
    ///
    /// An unknown extension is an error; there is no fallback to plain tar.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CodecError> {
        let file = path.into();
        let container = ContainerType::from_path(&file)?;
        Ok(Self::with_type(file, container))
    }

    pub fn with_type(path: impl Into<PathBuf>, container: ContainerType) -> Self {
        let file = path.into();
        let display = file.display().to_string();
        Self { file, display, container }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl ArchiveSource for FileSource {
    fn path(&self) -> &str {
        &self.display
    }

    fn container_type(&self) -> ContainerType {
        self.container
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let f = File::open(&self.file)?;
        Ok(Box::new(BufReader::with_capacity(FILE_BUF, f)))
    }
}

// ── BufferSource ─────────────────────────────────────────────────────────────

/// A source over bytes already in memory.  Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct BufferSource {
    path:      String,
    container: ContainerType,
    data:      Arc<[u8]>,
}

impl BufferSource {
    pub fn new(path: impl Into<String>, container: ContainerType, data: impl Into<Arc<[u8]>>) -> Self {
        Self { path: path.into(), container, data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ArchiveSource for BufferSource {
    fn path(&self) -> &str {
        &self.path
    }

    fn container_type(&self) -> ContainerType {
        self.container
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(Arc::clone(&self.data))))
    }
}
