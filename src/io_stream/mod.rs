//! Streaming lzop writer and reader.
//!
//! # Writer
//! [`LzopWriter`] writes the file header as soon as it is created, then
//! buffers input until a full block (256 KiB by default) is available and
//! emits it compressed, or raw when LZO1X-1 does not shrink it.
//! [`LzopWriter::finish`] flushes the final partial block and writes the
//! zero-length terminator.  An empty input still yields a valid container.
//! Dropping the writer without `finish` writes nothing more, so an aborted
//! stream never looks complete.
//!
//! # Reader
//! [`LzopReader`] parses the header lazily on the first `read`, so
//! constructing one performs no I/O.  It holds exactly one decoded block and
//! hands it out across as many `read` calls as the caller needs; a new block
//! is decoded only once the current one is exhausted.  Reading stops at the
//! terminator even when the underlying transport carries more bytes.  The
//! first decode error is sticky: later reads fail again rather than hand out
//! unverified data.

use std::io::{self, Read, Write};

use rust_lzo::LZOContext;
use tracing::{trace, warn};

use crate::block::{decode_block, encode_block, BLOCK_SIZE, MAX_BLOCK_SIZE};
use crate::header::{FormatError, LzopHeader};

/// Default LZO1X-1 level recorded in the header.
pub const DEFAULT_LEVEL: u8 = 5;
/// Regular file, rw-r--r--.
pub const DEFAULT_MODE: u32 = 0o100644;

// ── Options ──────────────────────────────────────────────────────────────────

/// Settings for [`LzopWriter`].
#[derive(Debug, Clone)]
pub struct LzopOptions {
    /// Uncompressed bytes per block, clamped to `1..=MAX_BLOCK_SIZE`.
    pub block_size: usize,
    pub level:      u8,
    /// Original file name recorded in the header (at most 255 bytes kept).
    pub name:       String,
    pub mode:       u32,
    /// Seconds since the epoch.
    pub mtime:      u64,
}

impl Default for LzopOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            level:      DEFAULT_LEVEL,
            name:       String::new(),
            mode:       DEFAULT_MODE,
            mtime:      0,
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct LzopWriter<W: Write> {
    inner:         Option<W>,
    flags:         u32,
    block_size:    usize,
    pending:       Vec<u8>,
    scratch:       Vec<u8>,
    ctx:           LZOContext,
    pub blocks_written: u64,
    pub bytes_in:       u64,
    pub bytes_out:      u64,
}

impl<W: Write> LzopWriter<W> {
    pub fn new(writer: W) -> io::Result<Self> {
        Self::with_options(writer, LzopOptions::default())
    }

    pub fn with_options(mut writer: W, options: LzopOptions) -> io::Result<Self> {
        let header = LzopHeader::new(options.level, options.mode, options.mtime, options.name.as_bytes());
        let mut head = Vec::new();
        header.write(&mut head)?;
        writer.write_all(&head)?;

        let block_size = options.block_size.clamp(1, MAX_BLOCK_SIZE);
        Ok(Self {
            inner:          Some(writer),
            flags:          header.flags,
            block_size,
            pending:        Vec::with_capacity(block_size),
            scratch:        Vec::new(),
            ctx:            LZOContext::new(),
            blocks_written: 0,
            bytes_in:       0,
            bytes_out:      head.len() as u64,
        })
    }

    fn emit_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let writer = self.inner.as_mut().ok_or_else(finished)?;
        let n = encode_block(writer, self.flags, &self.pending, &mut self.ctx, &mut self.scratch)?;
        trace!(raw = self.pending.len(), stored = n, "lzop block written");
        self.bytes_out += n as u64;
        self.blocks_written += 1;
        self.pending.clear();
        Ok(())
    }

    fn finish_inner(&mut self) -> io::Result<()> {
        self.emit_pending()?;
        let writer = self.inner.as_mut().ok_or_else(finished)?;
        writer.write_all(&0u32.to_be_bytes())?;
        writer.flush()?;
        self.bytes_out += 4;
        Ok(())
    }

    /// Flush the last block, write the terminator and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.finish_inner()?;
        self.inner.take().ok_or_else(finished)
    }
}

impl<W: Write> Write for LzopWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.is_none() {
            return Err(finished());
        }
        let room = self.block_size - self.pending.len();
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        self.bytes_in += n as u64;
        if self.pending.len() == self.block_size {
            self.emit_pending()?;
        }
        Ok(n)
    }

    /// Passes through to the inner writer.  A partial block stays buffered so
    /// that block boundaries do not depend on flush timing.
    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// A writer dropped without [`LzopWriter::finish`] leaves the stream
/// unterminated, so readers report it as truncated instead of accepting a
/// short file.
impl<W: Write> Drop for LzopWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!(bytes_in = self.bytes_in, "lzop writer dropped before finish; stream left unterminated");
        }
    }
}

fn finished() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "lzop writer already finished")
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct LzopReader<R: Read> {
    inner:    R,
    header:   Option<LzopHeader>,
    block:    Vec<u8>,
    pos:      usize,
    payload:  Vec<u8>,
    done:     bool,
    /// First decode error, replayed by every later `read`.
    failed:   Option<(io::ErrorKind, String)>,
    pub blocks_read: u64,
}

impl<R: Read> LzopReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner:       reader,
            header:      None,
            block:       Vec::new(),
            pos:         0,
            payload:     Vec::new(),
            done:        false,
            failed:      None,
            blocks_read: 0,
        }
    }

    /// Parse the file header if that has not happened yet.
    pub fn read_header(&mut self) -> Result<&LzopHeader, FormatError> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                let header = LzopHeader::read(&mut self.inner)?;
                trace!(method = header.method, flags = header.flags, "lzop header");
                header
            }
        };
        Ok(&*self.header.insert(header))
    }

    pub fn header(&self) -> Option<&LzopHeader> {
        self.header.as_ref()
    }

    /// True once the terminating block has been consumed.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Return the transport, positioned just after the terminator when the
    /// stream was read to the end.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Decode blocks until one with data arrives or the terminator is seen.
    /// On error the partially decoded block is discarded.
    fn refill(&mut self) -> Result<(), FormatError> {
        let flags = self.read_header()?.flags;
        while self.pos == self.block.len() && !self.done {
            match decode_block(&mut self.inner, flags, &mut self.block, &mut self.payload) {
                Ok(true) => self.blocks_read += 1,
                Ok(false) => self.done = true,
                Err(e) => {
                    self.block.clear();
                    self.pos = 0;
                    return Err(e);
                }
            }
            self.pos = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for LzopReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some((kind, msg)) = &self.failed {
            return Err(io::Error::new(*kind, msg.clone()));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.block.len() {
            if self.done {
                return Ok(0);
            }
            if let Err(e) = self.refill() {
                let e = io::Error::from(e);
                self.failed = Some((e.kind(), e.to_string()));
                return Err(e);
            }
            if self.done {
                return Ok(0);
            }
        }
        let available = &self.block[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
