//! Tar demultiplexer: a decoded byte stream in, a lazy sequence of entries out.
//!
//! Entries are yielded in stream order.  Each [`TarEntry`] reads only its own
//! body; reading past the declared size returns EOF.  Body bytes the caller
//! leaves unread are skipped when the next entry is requested, so a sink may
//! ignore a body entirely.  The sequence ends at the end-of-archive marker
//! (or at a clean end of input between entries).

use std::borrow::Cow;
use std::io::{self, Read};

use serde::Serialize;

use crate::error::ExtractError;

const TAR_BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    /// Any other type flag (fifo, device node, …).
    Other(u8),
}

impl From<tar::EntryType> for EntryKind {
    fn from(t: tar::EntryType) -> Self {
        match t {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink   => EntryKind::Symlink,
            tar::EntryType::Link      => EntryKind::Hardlink,
            other                     => EntryKind::Other(other.as_byte()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryHeader {
    /// Path as recorded in the archive, long-name extensions applied.
    pub name:      String,
    pub size:      u64,
    pub mode:      u32,
    pub kind:      EntryKind,
    /// Target of a symlink or hardlink.
    pub link_name: Option<String>,
    pub mtime:     u64,
}

impl EntryHeader {
    fn from_entry<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<Self> {
        let header = entry.header();
        Ok(Self {
            name:      lossy(entry.path_bytes()),
            size:      entry.size(),
            mode:      header.mode()?,
            kind:      header.entry_type().into(),
            link_name: entry.link_name_bytes().map(lossy),
            mtime:     header.mtime().unwrap_or(0),
        })
    }
}

fn lossy(bytes: Cow<'_, [u8]>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// One archive member: parsed header plus a reader bounded to its body.
pub struct TarEntry<'a, R: 'a + Read> {
    header: EntryHeader,
    offset: u64,
    body:   tar::Entry<'a, R>,
}

impl<'a, R: Read> TarEntry<'a, R> {
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    /// Byte offset of this entry's header in the decoded stream.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read and discard whatever is left of the body.
    pub fn drain(&mut self) -> Result<u64, ExtractError> {
        io::copy(&mut self.body, &mut io::sink()).map_err(|e| ExtractError::Parse {
            offset:  self.offset,
            message: format!("entry '{}' body truncated: {e}", self.header.name),
        })
    }
}

impl<'a, R: Read> Read for TarEntry<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

pub struct TarDemux<'a, R: 'a + Read> {
    entries: tar::Entries<'a, R>,
    /// Where the next header is expected.
    next_offset: u64,
    failed: bool,
}

impl<'a, R: Read> TarDemux<'a, R> {
    pub fn new(archive: &'a mut tar::Archive<R>) -> Result<Self, ExtractError> {
        let entries = archive.entries().map_err(|e| ExtractError::Parse {
            offset:  0,
            message: e.to_string(),
        })?;
        Ok(Self { entries, next_offset: 0, failed: false })
    }

    pub fn next_entry(&mut self) -> Option<Result<TarEntry<'a, R>, ExtractError>> {
        if self.failed {
            return None;
        }
        let entry = match self.entries.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(self.fail(self.next_offset, e))),
        };

        let offset = entry.raw_header_position();
        let padded = (entry.size() + TAR_BLOCK_SIZE - 1) / TAR_BLOCK_SIZE * TAR_BLOCK_SIZE;
        self.next_offset = entry.raw_file_position() + padded;

        match EntryHeader::from_entry(&entry) {
            Ok(header) => Some(Ok(TarEntry { header, offset, body: entry })),
            Err(e) => Some(Err(self.fail(offset, e))),
        }
    }

    fn fail(&mut self, offset: u64, e: io::Error) -> ExtractError {
        self.failed = true;
        ExtractError::Parse { offset, message: e.to_string() }
    }
}

impl<'a, R: Read> Iterator for TarDemux<'a, R> {
    type Item = Result<TarEntry<'a, R>, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}
