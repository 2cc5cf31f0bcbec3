//! Bounded in-memory pipe between a decoding producer and a tar consumer.
//!
//! The pipe holds at most `slots` chunks of at most `chunk_size` bytes, so a
//! producer can never run more than `slots * chunk_size` bytes ahead of its
//! consumer.  [`PipeWriter::write`] blocks while the pipe is full and
//! [`PipeReader::read`] blocks while it is empty.
//!
//! Dropping the reader closes the pipe: any blocked or later write fails
//! immediately with [`io::ErrorKind::BrokenPipe`].  Dropping the writer ends
//! the stream; the reader sees EOF after the buffered chunks.  A producer that
//! fails can forward its error with [`PipeWriter::fail`] so the reader gets
//! an error instead of a clean EOF.  A failed pipe stays failed: every read
//! after the first error fails the same way.

use std::io::{self, Read, Write};

use crossbeam_channel::{bounded, Receiver, Sender};

pub const DEFAULT_SLOTS:      usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

enum Message {
    Data(Vec<u8>),
    Failed(io::Error),
}

pub struct PipeWriter {
    tx:         Sender<Message>,
    chunk_size: usize,
    pub bytes_written: u64,
}

pub struct PipeReader {
    rx:      Receiver<Message>,
    current: Vec<u8>,
    pos:     usize,
    done:    bool,
    failed:  Option<(io::ErrorKind, String)>,
    pub bytes_read: u64,
}

/// Create a connected writer/reader pair.  Zero values are raised to one.
pub fn pipe(slots: usize, chunk_size: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(slots.max(1));
    (
        PipeWriter { tx, chunk_size: chunk_size.max(1), bytes_written: 0 },
        PipeReader { rx, current: Vec::new(), pos: 0, done: false, failed: None, bytes_read: 0 },
    )
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

impl PipeWriter {
    /// End the stream with an error delivered to the reader after any data
    /// already queued.
    pub fn fail(self, error: io::Error) {
        // A reader that is already gone does not need the error.
        let _ = self.tx.send(Message::Failed(error));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.chunk_size);
        self.tx.send(Message::Data(buf[..n].to_vec())).map_err(|_| closed())?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.current.len() {
            if let Some((kind, message)) = &self.failed {
                return Err(io::Error::new(*kind, message.clone()));
            }
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Message::Data(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Message::Failed(e)) => {
                    self.done = true;
                    self.failed = Some((e.kind(), e.to_string()));
                    return Err(e);
                }
                // every writer dropped
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        self.bytes_read += n as u64;
        Ok(n)
    }
}
