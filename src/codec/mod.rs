//! Codec registry: container types and the streaming transforms behind them.
//!
//! # Identity rules
//! Every archive source declares a [`ContainerType`].  The set is closed: a
//! name or file extension that does not map to one of its variants is an
//! error, never a silent fallback to plain tar.  A [`CodecRegistry`] maps each
//! type to the [`Codec`] that undoes it; looking up a type the registry does
//! not carry fails eagerly with [`CodecError::UnavailableCodec`], before any
//! source is opened.
//!
//! # Streaming
//! Codecs are pure transforms: bytes in, bytes out, with all state local to a
//! single call.  They never buffer a whole stream.  Read errors (corrupt
//! input) and write errors (the consumer went away) are reported separately
//! so callers can tell a broken archive from a cancelled extraction.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::header::FormatError;
use crate::io_stream::{LzopOptions, LzopReader, LzopWriter};

/// Copy buffer size used by [`pump`].
const PUMP_BUF: usize = 64 * 1024;

// ── ContainerType ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    /// Uncompressed tar.
    Plain,
    /// lzop block container (LZO1X).
    Lzop,
    /// LZ4 frame format.
    Lz4,
    Zstd,
    Brotli,
    /// Legacy `.lzma` (LZMA-alone) streams.
    Lzma,
}

impl ContainerType {
    pub const ALL: [ContainerType; 6] = [
        ContainerType::Plain,
        ContainerType::Lzop,
        ContainerType::Lz4,
        ContainerType::Zstd,
        ContainerType::Brotli,
        ContainerType::Lzma,
    ];

    /// Human-readable name, also accepted by [`ContainerType::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            ContainerType::Plain  => "plain",
            ContainerType::Lzop   => "lzop",
            ContainerType::Lz4    => "lz4",
            ContainerType::Zstd   => "zstd",
            ContainerType::Brotli => "brotli",
            ContainerType::Lzma   => "lzma",
        }
    }

    /// Canonical file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            ContainerType::Plain  => "tar",
            ContainerType::Lzop   => "lzo",
            ContainerType::Lz4    => "lz4",
            ContainerType::Zstd   => "zst",
            ContainerType::Brotli => "br",
            ContainerType::Lzma   => "lzma",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "tar" | "none" => Some(ContainerType::Plain),
            "lzop" | "lzo"           => Some(ContainerType::Lzop),
            "lz4"                    => Some(ContainerType::Lz4),
            "zstd" | "zst"           => Some(ContainerType::Zstd),
            "brotli" | "br"          => Some(ContainerType::Brotli),
            "lzma"                   => Some(ContainerType::Lzma),
            _                        => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.extension().eq_ignore_ascii_case(ext))
    }

    /// Infer the container from the last extension of `path`
    /// (`base_0001.tar.lzo` → lzop).
    pub fn from_path(path: &Path) -> Result<Self, CodecError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| CodecError::UnknownContainer {
            name: path.display().to_string(),
        })
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("lzop format error: {0}")]
    Format(#[from] FormatError),
    /// No codec is registered for a known container type.
    #[error("No codec registered for container type '{container}'")]
    UnavailableCodec { container: ContainerType },
    /// A name or extension that maps to no container type at all.
    #[error("Unknown container type for '{name}'")]
    UnknownContainer { name: String },
    /// Failure writing decoded output.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the output side was closed by the consumer.
    pub fn is_closed_pipe(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }

    /// Classify an error raised while reading encoded input.
    fn from_read(e: io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<FormatError>()) {
            return CodecError::Decompression(e.to_string());
        }
        match e.into_inner().map(|inner| inner.downcast::<FormatError>()) {
            Some(Ok(format)) => CodecError::Format(*format),
            Some(Err(other)) => CodecError::Decompression(other.to_string()),
            None => CodecError::Decompression("decoder failed".into()),
        }
    }
}

/// Copy `src` into `dst`, attributing read failures to the decoder and write
/// failures to the output.  Returns the number of bytes copied.
pub fn pump<R: Read + ?Sized, W: Write + ?Sized>(src: &mut R, dst: &mut W) -> Result<u64, CodecError> {
    let mut buf = vec![0u8; PUMP_BUF];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::from_read(e)),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    dst.flush()?;
    Ok(total)
}

/// Same as [`pump`] but for the compression direction, where read errors come
/// from the plain input.
fn pump_plain(src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
    let mut buf = vec![0u8; PUMP_BUF];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        };
        dst.write_all(&buf[..n]).map_err(|e| CodecError::Compression(e.to_string()))?;
        total += n as u64;
    }
    Ok(total)
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn container_type(&self) -> ContainerType;
    /// Encode all of `src` into `dst`.  Returns plain bytes consumed.
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError>;
    /// Decode `src` into `dst` up to the logical end of the container.
    /// Returns plain bytes produced.
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct PlainCodec;
impl Codec for PlainCodec {
    fn container_type(&self) -> ContainerType { ContainerType::Plain }
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        pump_plain(src, dst)
    }
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        pump(src, dst)
    }
}

#[derive(Default)]
pub struct LzopCodec {
    pub options: LzopOptions,
}
impl Codec for LzopCodec {
    fn container_type(&self) -> ContainerType { ContainerType::Lzop }
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut w = LzopWriter::with_options(dst, self.options.clone())
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        let n = pump_plain(src, &mut w)?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(n)
    }
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut r = LzopReader::new(src);
        r.read_header()?;
        pump(&mut r, dst)
    }
}

pub struct ZstdCodec {
    pub level: i32,
}
impl Default for ZstdCodec {
    fn default() -> Self { Self { level: 3 } }
}
impl Codec for ZstdCodec {
    fn container_type(&self) -> ContainerType { ContainerType::Zstd }
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut enc = zstd::stream::write::Encoder::new(dst, self.level)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        let n = pump_plain(src, &mut enc)?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(n)
    }
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut dec = zstd::stream::read::Decoder::new(src)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        pump(&mut dec, dst)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn container_type(&self) -> ContainerType { ContainerType::Lz4 }
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut enc = lz4_flex::frame::FrameEncoder::new(dst);
        let n = pump_plain(src, &mut enc)?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(n)
    }
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut dec = lz4_flex::frame::FrameDecoder::new(src);
        pump(&mut dec, dst)
    }
}

pub struct BrotliCodec {
    pub quality: u32,
}
impl Default for BrotliCodec {
    fn default() -> Self { Self { quality: 6 } }
}
impl Codec for BrotliCodec {
    fn container_type(&self) -> ContainerType { ContainerType::Brotli }
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut params = brotli::enc::BrotliEncoderParams::default();
        params.quality = self.quality.min(11) as i32;
        params.lgwin = 22;
        let mut counted = Counted { inner: src, count: 0 };
        let mut out = dst;
        brotli::BrotliCompress(&mut counted, &mut out, &params)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        out.flush().map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(counted.count)
    }
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut dec = brotli::Decompressor::new(src, 4096);
        pump(&mut dec, dst)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn container_type(&self) -> ContainerType { ContainerType::Lzma }
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut counted = Counted { inner: src, count: 0 };
        let mut out = dst;
        lzma_rs::lzma_compress(&mut BufReader::new(&mut counted), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(counted.count)
    }
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, CodecError> {
        let mut counted = Counted { inner: dst, count: 0 };
        lzma_rs::lzma_decompress(&mut BufReader::new(src), &mut counted).map_err(|e| match e {
            lzma_rs::error::Error::IoError(io) if io.kind() == io::ErrorKind::BrokenPipe => CodecError::Io(io),
            other => CodecError::Decompression(other.to_string()),
        })?;
        Ok(counted.count)
    }
}

/// Byte counter for codecs whose APIs do not report totals.
struct Counted<T> {
    inner: T,
    count: u64,
}

impl<T: Read> Read for Counted<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<T: Write> Write for Counted<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Lookup table from container type to codec.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<ContainerType, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with no codecs, not even plain tar.
    pub fn empty() -> Self {
        Self { codecs: HashMap::new() }
    }

    /// Register `codec` under its own container type, replacing any previous
    /// codec for that type.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> &mut Self {
        self.codecs.insert(codec.container_type(), codec);
        self
    }

    pub fn with(mut self, codec: Arc<dyn Codec>) -> Self {
        self.register(codec);
        self
    }

    /// Resolve a container type to its codec.
    ///
    /// Returns `Err(CodecError::UnavailableCodec)` if nothing is registered
    /// for it.  The caller must not fall back to any other codec.
    pub fn lookup(&self, container: ContainerType) -> Result<Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(&container)
            .cloned()
            .ok_or(CodecError::UnavailableCodec { container })
    }

    pub fn contains(&self, container: ContainerType) -> bool {
        self.codecs.contains_key(&container)
    }

    pub fn container_types(&self) -> Vec<ContainerType> {
        let mut types: Vec<_> = self.codecs.keys().copied().collect();
        types.sort_by_key(|t| t.name());
        types
    }
}

impl Default for CodecRegistry {
    /// Every built-in codec with default settings.
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(PlainCodec))
            .with(Arc::new(LzopCodec::default()))
            .with(Arc::new(Lz4Codec))
            .with(Arc::new(ZstdCodec::default()))
            .with(Arc::new(BrotliCodec::default()))
            .with(Arc::new(LzmaCodec))
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.container_types()).finish()
    }
}
