//! lzop file header.
//!
//! # Layout
//! Every integer is big-endian.  Fields marked *(≥ 0x0940)* are present only
//! when the header's `version` is at least 0x0940; every header this crate
//! writes uses version 0x1030, so they are always written.
//!
//! ```text
//! magic        9 B   89 4C 5A 4F 00 0D 0A 1A 0A
//! version      u16
//! lib_version  u16
//! needed       u16   (≥ 0x0940) version needed to extract
//! method       u8    1 = LZO1X-1, 2 = LZO1X-1(15), 3 = LZO1X-999
//! level        u8    (≥ 0x0940)
//! flags        u32
//! filter       u32   only if flags & F_H_FILTER
//! mode         u32
//! mtime_low    u32
//! mtime_high   u32   (≥ 0x0940)
//! name_len     u8
//! name         name_len B
//! checksum     u32   Adler-32 over version..name (CRC-32 if F_H_CRC32)
//! extra        only if flags & F_H_EXTRA_FIELD: u32 len, len B, u32 checksum
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAGIC: [u8; 9] = [0x89, b'L', b'Z', b'O', 0x00, 0x0D, 0x0A, 0x1A, 0x0A];

/// Version written into new headers (lzop 1.03).
pub const VERSION: u16 = 0x1030;
/// LZO library version advertised in new headers.
pub const LIB_VERSION: u16 = 0x2080;
/// Oldest header layout that carries `needed`, `level` and `mtime_high`.
pub const VERSION_NEEDED: u16 = 0x0940;
/// Oldest header version this crate will read.
const MIN_VERSION: u16 = 0x0900;
/// Newest `needed` value this crate understands.
const MAX_VERSION_NEEDED: u16 = 0x1040;

// ── Methods ──────────────────────────────────────────────────────────────────

pub const M_LZO1X_1:    u8 = 1;
pub const M_LZO1X_1_15: u8 = 2;
pub const M_LZO1X_999:  u8 = 3;

// ── Flags ────────────────────────────────────────────────────────────────────

pub const F_ADLER32_D:     u32 = 0x0000_0001;
pub const F_ADLER32_C:     u32 = 0x0000_0002;
pub const F_STDIN:         u32 = 0x0000_0004;
pub const F_STDOUT:        u32 = 0x0000_0008;
pub const F_NAME_DEFAULT:  u32 = 0x0000_0010;
pub const F_DOSISH:        u32 = 0x0000_0020;
pub const F_H_EXTRA_FIELD: u32 = 0x0000_0040;
pub const F_H_GMTDIFF:     u32 = 0x0000_0080;
pub const F_CRC32_D:       u32 = 0x0000_0100;
pub const F_CRC32_C:       u32 = 0x0000_0200;
pub const F_MULTIPART:     u32 = 0x0000_0400;
pub const F_H_FILTER:      u32 = 0x0000_0800;
pub const F_H_CRC32:       u32 = 0x0000_1000;
pub const F_H_PATH:        u32 = 0x0000_2000;

// ── Error type ───────────────────────────────────────────────────────────────

/// Malformed or unsupported lzop container data.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("not an lzop stream: magic header missing")]
    InvalidMagic,
    #[error("unsupported lzop version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("unsupported lzop method {0}")]
    UnsupportedMethod(u8),
    #[error("lzop filter {0} is not supported")]
    UnsupportedFilter(u32),
    #[error("header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderChecksum { stored: u32, computed: u32 },
    #[error("block of {len} bytes exceeds the {max} byte limit")]
    BlockTooLarge { len: u32, max: u32 },
    #[error("stored length {src_len} exceeds uncompressed length {dst_len}")]
    StoredLargerThanRaw { src_len: u32, dst_len: u32 },
    #[error("block decompressed to {actual} bytes, header declared {declared}")]
    SizeMismatch { declared: u32, actual: usize },
    #[error("{kind} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BlockChecksum { kind: &'static str, stored: u32, computed: u32 },
    #[error("LZO decompression failed: {0}")]
    Decompress(String),
    #[error("LZO compression failed: {0}")]
    Compress(String),
    #[error("lzop stream ended before the terminating block")]
    Truncated,
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FormatError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::Truncated
        } else {
            FormatError::Io(e)
        }
    }
}

impl From<FormatError> for io::Error {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

// ── Checksums ────────────────────────────────────────────────────────────────

/// Checksum selected by the header flags for header and block fields.
pub(crate) fn adler32(data: &[u8]) -> u32 {
    adler::adler32_slice(data)
}

pub(crate) fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LzopHeader {
    pub version:        u16,
    pub lib_version:    u16,
    pub version_needed: u16,
    pub method:         u8,
    pub level:          u8,
    pub flags:          u32,
    pub filter:         u32,
    pub mode:           u32,
    /// Seconds since the epoch; `mtime_high` occupies the upper 32 bits.
    pub mtime:          u64,
    pub name:           Vec<u8>,
}

impl LzopHeader {
    /// Header for a new stream, using LZO1X-1 with Adler-32 block checksums.
    pub fn new(level: u8, mode: u32, mtime: u64, name: &[u8]) -> Self {
        let name = &name[..name.len().min(u8::MAX as usize)];
        Self {
            version:        VERSION,
            lib_version:    LIB_VERSION,
            version_needed: VERSION_NEEDED,
            method:         M_LZO1X_1,
            level,
            flags:          F_ADLER32_D | F_ADLER32_C,
            filter:         0,
            mode,
            mtime,
            name:           name.to_vec(),
        }
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn method_name(&self) -> &'static str {
        match self.method {
            M_LZO1X_1    => "LZO1X-1",
            M_LZO1X_1_15 => "LZO1X-1(15)",
            M_LZO1X_999  => "LZO1X-999",
            _            => "unknown",
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let mut body = Vec::with_capacity(34 + self.name.len());
        body.write_u16::<BigEndian>(self.version)?;
        body.write_u16::<BigEndian>(self.lib_version)?;
        if self.version >= VERSION_NEEDED {
            body.write_u16::<BigEndian>(self.version_needed)?;
        }
        body.write_u8(self.method)?;
        if self.version >= VERSION_NEEDED {
            body.write_u8(self.level)?;
        }
        body.write_u32::<BigEndian>(self.flags)?;
        if self.flags & F_H_FILTER != 0 {
            body.write_u32::<BigEndian>(self.filter)?;
        }
        body.write_u32::<BigEndian>(self.mode)?;
        body.write_u32::<BigEndian>(self.mtime as u32)?;
        if self.version >= VERSION_NEEDED {
            body.write_u32::<BigEndian>((self.mtime >> 32) as u32)?;
        }
        let name_len = self.name.len().min(u8::MAX as usize);
        body.write_u8(name_len as u8)?;
        body.write_all(&self.name[..name_len])?;

        let checksum = self.header_checksum(&body);
        writer.write_all(&MAGIC)?;
        writer.write_all(&body)?;
        writer.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    /// Read and validate a header, including the leading magic.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, FormatError> {
        let mut magic = [0u8; 9];
        reader.read_exact(&mut magic).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FormatError::InvalidMagic,
            _ => FormatError::Io(e),
        })?;
        if magic != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let mut r = Recorder { inner: &mut reader, seen: Vec::with_capacity(64) };
        let version = r.read_u16::<BigEndian>()?;
        if version < MIN_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let lib_version = r.read_u16::<BigEndian>()?;
        let version_needed = if version >= VERSION_NEEDED {
            let needed = r.read_u16::<BigEndian>()?;
            if needed > MAX_VERSION_NEEDED || needed < MIN_VERSION {
                return Err(FormatError::UnsupportedVersion(needed));
            }
            needed
        } else {
            0
        };
        let method = r.read_u8()?;
        if !matches!(method, M_LZO1X_1 | M_LZO1X_1_15 | M_LZO1X_999) {
            return Err(FormatError::UnsupportedMethod(method));
        }
        let level = if version >= VERSION_NEEDED { r.read_u8()? } else { 0 };
        let flags = r.read_u32::<BigEndian>()?;
        let filter = if flags & F_H_FILTER != 0 { r.read_u32::<BigEndian>()? } else { 0 };
        let mode = r.read_u32::<BigEndian>()?;
        let mtime_low = r.read_u32::<BigEndian>()?;
        let mtime_high = if version >= VERSION_NEEDED { r.read_u32::<BigEndian>()? } else { 0 };
        let name_len = r.read_u8()? as usize;
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let seen = r.seen;

        let header = Self {
            version,
            lib_version,
            version_needed,
            method,
            level,
            flags,
            filter,
            mode,
            mtime: (mtime_high as u64) << 32 | mtime_low as u64,
            name,
        };

        let stored = reader.read_u32::<BigEndian>()?;
        let computed = header.header_checksum(&seen);
        if stored != computed {
            return Err(FormatError::HeaderChecksum { stored, computed });
        }

        // Filters rewrite the decompressed bytes; none are implemented here.
        if filter != 0 {
            return Err(FormatError::UnsupportedFilter(filter));
        }

        // Extra field contents are not interpreted, only skipped.
        if flags & F_H_EXTRA_FIELD != 0 {
            let len = reader.read_u32::<BigEndian>()? as u64;
            io::copy(&mut (&mut reader).take(len), &mut io::sink())?;
            reader.read_u32::<BigEndian>()?;
        }

        Ok(header)
    }

    fn header_checksum(&self, body: &[u8]) -> u32 {
        if self.flags & F_H_CRC32 != 0 { crc32(body) } else { adler32(body) }
    }

    /// Bytes added in front of every block's payload for this header's flags.
    pub fn block_overhead(&self) -> usize {
        let mut n = 8;
        for flag in [F_ADLER32_D, F_CRC32_D, F_ADLER32_C, F_CRC32_C] {
            if self.flags & flag != 0 {
                n += 4;
            }
        }
        n
    }
}

/// Copies every byte read into `seen` so the header checksum can be computed
/// over exactly what was on the wire.
struct Recorder<'a, R: Read> {
    inner: &'a mut R,
    seen:  Vec<u8>,
}

impl<R: Read> Read for Recorder<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_roundtrip() {
        let header = LzopHeader::new(5, 0o100644, 0x1_2345_6789, b"base.tar");
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(&buf[..9], &MAGIC);

        let parsed = LzopHeader::read(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.name_lossy(), "base.tar");
    }

    #[test]
    fn leading_garbage_is_rejected() {
        let mut buf = b"junk".to_vec();
        LzopHeader::new(5, 0, 0, b"").write(&mut buf).unwrap();
        assert!(matches!(LzopHeader::read(Cursor::new(&buf)), Err(FormatError::InvalidMagic)));
    }

    #[test]
    fn short_input_is_not_lzop() {
        assert!(matches!(LzopHeader::read(Cursor::new(&[0x89, b'L'])), Err(FormatError::InvalidMagic)));
    }

    #[test]
    fn corrupted_header_fails_checksum() {
        let mut buf = Vec::new();
        LzopHeader::new(5, 0o644, 0, b"x").write(&mut buf).unwrap();
        // flip a bit in the mode field
        buf[9 + 2 + 2 + 2 + 1 + 1 + 4] ^= 0x01;
        assert!(matches!(
            LzopHeader::read(Cursor::new(&buf)),
            Err(FormatError::HeaderChecksum { .. })
        ));
    }

    #[test]
    fn crc32_header_checksum_is_honoured() {
        let mut header = LzopHeader::new(1, 0, 0, b"crc");
        header.flags |= F_H_CRC32;
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(LzopHeader::read(Cursor::new(&buf)).unwrap().flags & F_H_CRC32, F_H_CRC32);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut header = LzopHeader::new(1, 0, 0, b"");
        header.method = 0x40;
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert!(matches!(
            LzopHeader::read(Cursor::new(&buf)),
            Err(FormatError::UnsupportedMethod(0x40))
        ));
    }

    #[test]
    fn block_overhead_counts_checksums() {
        assert_eq!(LzopHeader::new(1, 0, 0, b"").block_overhead(), 16);
    }
}
