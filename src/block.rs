//! lzop block framing.
//!
//! ```text
//! dst_len  u32   uncompressed length, 0 ends the stream
//! src_len  u32   stored length, equal to dst_len when stored raw
//! d_adler  u32   if F_ADLER32_D
//! d_crc    u32   if F_CRC32_D
//! c_adler  u32   if F_ADLER32_C and src_len < dst_len
//! c_crc    u32   if F_CRC32_C   and src_len < dst_len
//! payload  src_len bytes
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rust_lzo::{LZOContext, LZOError};
use std::io::{Read, Write};

use crate::header::{
    adler32, crc32, FormatError, F_ADLER32_C, F_ADLER32_D, F_CRC32_C, F_CRC32_D,
};

/// Default uncompressed block size, matching lzop.
pub const BLOCK_SIZE: usize = 256 * 1024;
/// Largest block lzop will produce or accept.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Worst-case LZO1X output size for `len` input bytes.
pub fn compress_bound(len: usize) -> usize {
    len + len / 16 + 64 + 3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub dst_len:   u32,
    pub src_len:   u32,
    pub d_adler32: Option<u32>,
    pub d_crc32:   Option<u32>,
    pub c_adler32: Option<u32>,
    pub c_crc32:   Option<u32>,
}

impl BlockHeader {
    pub fn is_terminator(&self) -> bool {
        self.dst_len == 0
    }

    pub fn is_stored(&self) -> bool {
        self.src_len == self.dst_len
    }

    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u32::<BigEndian>(self.dst_len)?;
        if self.is_terminator() {
            return Ok(());
        }
        writer.write_u32::<BigEndian>(self.src_len)?;
        for sum in [self.d_adler32, self.d_crc32, self.c_adler32, self.c_crc32].into_iter().flatten() {
            writer.write_u32::<BigEndian>(sum)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R, flags: u32) -> Result<Self, FormatError> {
        let dst_len = reader.read_u32::<BigEndian>()?;
        if dst_len == 0 {
            return Ok(Self::terminator());
        }
        if dst_len as usize > MAX_BLOCK_SIZE {
            return Err(FormatError::BlockTooLarge { len: dst_len, max: MAX_BLOCK_SIZE as u32 });
        }
        let src_len = reader.read_u32::<BigEndian>()?;
        if src_len > dst_len {
            return Err(FormatError::StoredLargerThanRaw { src_len, dst_len });
        }
        let compressed = src_len < dst_len;

        let mut field = |flag: u32, present: bool| -> Result<Option<u32>, FormatError> {
            if present && flags & flag != 0 {
                Ok(Some(reader.read_u32::<BigEndian>()?))
            } else {
                Ok(None)
            }
        };
        let d_adler32 = field(F_ADLER32_D, true)?;
        let d_crc32   = field(F_CRC32_D, true)?;
        let c_adler32 = field(F_ADLER32_C, compressed)?;
        let c_crc32   = field(F_CRC32_C, compressed)?;

        Ok(Self { dst_len, src_len, d_adler32, d_crc32, c_adler32, c_crc32 })
    }

    pub fn terminator() -> Self {
        Self { dst_len: 0, src_len: 0, d_adler32: None, d_crc32: None, c_adler32: None, c_crc32: None }
    }

    fn verify(&self, kind: &'static str, stored: Option<u32>, data: &[u8], f: fn(&[u8]) -> u32) -> Result<(), FormatError> {
        if let Some(stored) = stored {
            let computed = f(data);
            if stored != computed {
                return Err(FormatError::BlockChecksum { kind, stored, computed });
            }
        }
        Ok(())
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Compress `data` as one block and write it.  Blocks that do not shrink are
/// stored raw.  `scratch` is reused across calls to avoid reallocating.
///
/// Returns the number of bytes written.
pub fn encode_block<W: Write>(
    mut writer: W,
    flags:      u32,
    data:       &[u8],
    ctx:        &mut LZOContext,
    scratch:    &mut Vec<u8>,
) -> Result<usize, FormatError> {
    debug_assert!(!data.is_empty() && data.len() <= MAX_BLOCK_SIZE);

    let bound = compress_bound(data.len());
    if scratch.len() < bound {
        scratch.resize(bound, 0);
    }
    let (packed, err) = ctx.compress_to_slice(data, &mut scratch[..bound]);
    if !matches!(err, LZOError::OK) {
        return Err(FormatError::Compress(describe(&err).into()));
    }
    let payload: &[u8] = if packed.len() < data.len() { packed } else { data };
    let stored = payload.len() == data.len();

    let has = |flag: u32| flags & flag != 0;
    let header = BlockHeader {
        dst_len:   data.len() as u32,
        src_len:   payload.len() as u32,
        d_adler32: has(F_ADLER32_D).then(|| adler32(data)),
        d_crc32:   has(F_CRC32_D).then(|| crc32(data)),
        c_adler32: (has(F_ADLER32_C) && !stored).then(|| adler32(payload)),
        c_crc32:   (has(F_CRC32_C) && !stored).then(|| crc32(payload)),
    };
    header.write(&mut writer)?;
    writer.write_all(payload)?;

    let sums = [header.d_adler32, header.d_crc32, header.c_adler32, header.c_crc32];
    Ok(8 + 4 * sums.iter().flatten().count() + payload.len())
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Read the next block into `out`, replacing its contents.  `payload` is a
/// reusable buffer for the stored bytes.
///
/// Returns `false` once the terminating block has been read.
pub fn decode_block<R: Read>(
    mut reader: R,
    flags:      u32,
    out:        &mut Vec<u8>,
    payload:    &mut Vec<u8>,
) -> Result<bool, FormatError> {
    let header = BlockHeader::read(&mut reader, flags)?;
    out.clear();
    if header.is_terminator() {
        return Ok(false);
    }

    let dst_len = header.dst_len as usize;
    if header.is_stored() {
        out.resize(dst_len, 0);
        reader.read_exact(&mut out[..])?;
    } else {
        payload.resize(header.src_len as usize, 0);
        reader.read_exact(&mut payload[..])?;
        header.verify("compressed adler32", header.c_adler32, &payload[..], adler32)?;
        header.verify("compressed crc32", header.c_crc32, &payload[..], crc32)?;

        out.resize(dst_len, 0);
        let (unpacked, err) = LZOContext::decompress_to_slice(&payload[..], &mut out[..]);
        if !matches!(err, LZOError::OK) {
            return Err(FormatError::Decompress(describe(&err).into()));
        }
        let actual = unpacked.len();
        if actual != dst_len {
            return Err(FormatError::SizeMismatch { declared: header.dst_len, actual });
        }
    }

    header.verify("uncompressed adler32", header.d_adler32, &out[..], adler32)?;
    header.verify("uncompressed crc32", header.d_crc32, &out[..], crc32)?;
    Ok(true)
}

fn describe(err: &LZOError) -> &'static str {
    match err {
        LZOError::OK => "ok",
        LZOError::OUT_OF_MEMORY => "out of memory",
        LZOError::NOT_COMPRESSIBLE => "not compressible",
        LZOError::INPUT_OVERRUN => "input overrun",
        LZOError::OUTPUT_OVERRUN => "output overrun",
        LZOError::LOOKBEHIND_OVERRUN => "lookbehind overrun",
        LZOError::EOF_NOT_FOUND => "end of stream marker not found",
        LZOError::INPUT_NOT_CONSUMED => "input not fully consumed",
        _ => "corrupt data",
    }
}
