//! Little-endian wire primitives and base64 framing.
//!
//! Every deserializer runs against a bounded window and fails with
//! [`CodecError::Truncated`] rather than reading past it; length prefixes
//! are additionally capped per call site and fail with
//! [`CodecError::TooLarge`]. The request page is guest memory: nothing here
//! may panic on hostile bytes.

use core::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use xenvars_efi::guid::GUID_SIZE;
use xenvars_efi::time::EFI_TIME_SIZE;
use xenvars_efi::{EfiTime, Guid};

/// Snapshot magic, the bytes `VARS` read as a little-endian `u32`.
pub const SNAPSHOT_MAGIC: u32 = 0x5352_4156;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Reserved trailing bytes after each serialized variable record.
pub const VAR_PADDING: usize = 8;

/// Codec failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CodecError {
    /// A field would cross the end of the window.
    Truncated,
    /// A length prefix exceeds its per-field maximum.
    TooLarge,
    /// A byte outside the base64 alphabet (whitespace excepted).
    BadEncoding,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => f.write_str("input truncated"),
            CodecError::TooLarge => f.write_str("length exceeds field maximum"),
            CodecError::BadEncoding => f.write_str("invalid base64"),
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A bounds-checked little-endian reader over a byte window.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u16(&mut self) -> CodecResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> CodecResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> CodecResult<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn guid(&mut self) -> CodecResult<Guid> {
        let b = self.bytes(GUID_SIZE)?;
        let mut raw = [0u8; GUID_SIZE];
        raw.copy_from_slice(b);
        Ok(Guid::from_bytes(raw))
    }

    pub fn time(&mut self) -> CodecResult<EfiTime> {
        let b = self.bytes(EFI_TIME_SIZE)?;
        let mut raw = [0u8; EFI_TIME_SIZE];
        raw.copy_from_slice(b);
        Ok(EfiTime::from_bytes(raw))
    }

    /// A `u64` byte count followed by that many raw bytes, capped at `max`.
    pub fn blob(&mut self, max: usize) -> CodecResult<&'a [u8]> {
        let len = self.u64()?;
        if len > max as u64 {
            return Err(CodecError::TooLarge);
        }
        self.bytes(len as usize)
    }

    pub fn skip(&mut self, n: usize) -> CodecResult<()> {
        self.bytes(n).map(|_| ())
    }

    /// Everything left in the window.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// A bounds-checked writer over a caller-owned window, used to build the
/// in-place response.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> CodecResult<()> {
        if data.len() > self.buf.len() - self.pos {
            return Err(CodecError::Truncated);
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> CodecResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> CodecResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_guid(&mut self, g: Guid) -> CodecResult<()> {
        self.put_bytes(&g.to_bytes())
    }

    /// A `u64` byte count followed by the raw bytes.
    pub fn put_blob(&mut self, data: &[u8]) -> CodecResult<()> {
        self.put_u64(data.len() as u64)?;
        self.put_bytes(data)
    }
}

/// Standard-alphabet base64 with `=` padding.
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes base64, tolerating ASCII whitespace anywhere in the input.
/// Any other non-alphabet byte is an error.
pub fn base64_decode(text: &str) -> CodecResult<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| CodecError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_primitives() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        raw.extend_from_slice(&42u64.to_le_bytes());
        raw.extend_from_slice(&xenvars_efi::guid::EFI_GLOBAL_VARIABLE.to_bytes());

        let mut r = Reader::new(&raw);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), 42);
        assert_eq!(r.guid().unwrap(), xenvars_efi::guid::EFI_GLOBAL_VARIABLE);
        assert!(r.is_empty());
        assert_eq!(r.u32(), Err(CodecError::Truncated));
    }

    #[test]
    fn blob_bounds() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&4u64.to_le_bytes());
        raw.extend_from_slice(b"data");

        let mut r = Reader::new(&raw);
        assert_eq!(r.blob(16).unwrap(), b"data");

        let mut r = Reader::new(&raw);
        assert_eq!(r.blob(3), Err(CodecError::TooLarge));

        // Length prefix larger than the window.
        let mut short = 100u64.to_le_bytes().to_vec();
        short.push(0);
        let mut r = Reader::new(&short);
        assert_eq!(r.blob(1024), Err(CodecError::Truncated));
    }

    #[test]
    fn writer_bounds() {
        let mut page = [0u8; 16];
        let mut w = Writer::new(&mut page);
        w.put_u64(7).unwrap();
        w.put_u32(9).unwrap();
        assert_eq!(w.len(), 12);
        assert_eq!(w.put_u64(1), Err(CodecError::Truncated));
        assert_eq!(&page[..8], &7u64.to_le_bytes());
    }

    #[test]
    fn base64_round_trip() {
        for len in [0usize, 1, 2, 3, 57, 1024] {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let text = base64_encode(&data);
            assert_eq!(text.len(), data.len().div_ceil(3) * 4);
            assert_eq!(base64_decode(&text).unwrap(), data);
        }
    }

    #[test]
    fn base64_whitespace_tolerated() {
        let text = "aGVs\nbG8g  d29y\tbGQ=\r\n";
        assert_eq!(base64_decode(text).unwrap(), b"hello world");
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(base64_decode("not*base64!").is_err());
    }

    #[test]
    fn snapshot_magic_spells_vars() {
        assert_eq!(&SNAPSHOT_MAGIC.to_le_bytes(), b"VARS");
    }
}
