//! Framing policies wrapped around each encoded payload.
//!
//! A frame is `[header][payload][trailer]`. The encode and pipeline adapters
//! reserve the header and trailer regions in their output staging, let the
//! codec or hardware fill the payload, then call [`Framing::seal`]. The decode
//! adapter hands each received frame to [`Framing::unseal`] before decoding.

use serde::Deserialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::StreamError;

/// How payloads are delimited and protected on the wire.
pub trait Framing: Send + Sync {
    fn name(&self) -> &'static str;

    fn header_len(&self) -> usize {
        0
    }

    fn trailer_len(&self) -> usize {
        0
    }

    /// Fill `header` and `trailer` around a payload already in place.
    fn seal(&self, header: &mut [u8], payload: &[u8], trailer: &mut [u8]) -> Result<(), StreamError>;

    /// Check a received frame.
    fn unseal(&self, header: &[u8], payload: &[u8], trailer: &[u8]) -> Result<(), StreamError>;
}

/// Which framing policy an adapter is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingKind {
    #[default]
    Unframed,
    ChecksumTrailer,
    GzipExtra,
}

impl FramingKind {
    pub fn build(self) -> Box<dyn Framing> {
        match self {
            FramingKind::Unframed => Box::new(Unframed),
            FramingKind::ChecksumTrailer => Box::new(ChecksumTrailer),
            FramingKind::GzipExtra => Box::new(GzipExtra),
        }
    }

    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "unframed" | "plain" | "none" => Ok(FramingKind::Unframed),
            "checksum" | "checksum-trailer" => Ok(FramingKind::ChecksumTrailer),
            "gzip-extra" | "gzip" => Ok(FramingKind::GzipExtra),
            other => anyhow::bail!(
                "unknown framing '{}'. Valid options: unframed, checksum, gzip-extra",
                other
            ),
        }
    }
}

// ── Unframed ───────────────────────────────────────────────────────────────

/// Payload bytes are written as-is; the engine block header is the only
/// delimiter.
pub struct Unframed;

impl Framing for Unframed {
    fn name(&self) -> &'static str {
        "unframed"
    }

    fn seal(&self, _header: &mut [u8], _payload: &[u8], _trailer: &mut [u8]) -> Result<(), StreamError> {
        Ok(())
    }

    fn unseal(&self, _header: &[u8], _payload: &[u8], _trailer: &[u8]) -> Result<(), StreamError> {
        Ok(())
    }
}

// ── Checksum trailer ───────────────────────────────────────────────────────

/// Size of the xxhash3-64 trailer.
pub const CHECKSUM_TRAILER_SIZE: usize = 8;

/// Each payload is followed by the little-endian xxhash3-64 of its bytes.
pub struct ChecksumTrailer;

impl Framing for ChecksumTrailer {
    fn name(&self) -> &'static str {
        "checksum-trailer"
    }

    fn trailer_len(&self) -> usize {
        CHECKSUM_TRAILER_SIZE
    }

    fn seal(&self, _header: &mut [u8], payload: &[u8], trailer: &mut [u8]) -> Result<(), StreamError> {
        trailer.copy_from_slice(&xxh3_64(payload).to_le_bytes());
        Ok(())
    }

    fn unseal(&self, _header: &[u8], payload: &[u8], trailer: &[u8]) -> Result<(), StreamError> {
        let stored = u64::from_le_bytes(
            trailer
                .try_into()
                .map_err(|_| StreamError::corrupt("checksum trailer truncated"))?,
        );
        let computed = xxh3_64(payload);
        if stored != computed {
            return Err(StreamError::Corrupt(format!(
                "checksum mismatch: expected {:016x}, got {:016x}",
                stored, computed
            )));
        }
        Ok(())
    }
}

// ── Gzip member with length extra field ────────────────────────────────────

/// Size of the synthesized gzip member header.
pub const GZIP_EXTRA_HEADER_SIZE: usize = 20;

/// Fixed part of the header: magic, CM=deflate, FLG=FEXTRA, MTIME=0, XFL=0,
/// OS=unix, XLEN=8, subfield 'E' 'F' of length 4. Bytes 16..20 carry the
/// member length.
const GZIP_EXTRA_PREFIX: [u8; 16] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x08, 0x00, b'E', b'F', 0x04, 0x00,
];

/// The 20-byte gzip member header used for hardware output.
///
/// A stock gzip decoder skips the extra field and inflates the payload, so
/// the output stays a valid multi-member gzip stream, while a block-aware
/// reader can jump from member to member using the length field alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total member length: this header plus the payload that follows.
    pub block_len: u32,
}

impl FrameHeader {
    pub fn new(block_len: u32) -> Self {
        Self { block_len }
    }

    /// Serialize to exactly `GZIP_EXTRA_HEADER_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; GZIP_EXTRA_HEADER_SIZE] {
        let mut buf = [0u8; GZIP_EXTRA_HEADER_SIZE];
        buf[..16].copy_from_slice(&GZIP_EXTRA_PREFIX);
        buf[16..20].copy_from_slice(&self.block_len.to_le_bytes());
        buf
    }

    /// Parse a header, checking every fixed byte.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, StreamError> {
        if buf.len() < GZIP_EXTRA_HEADER_SIZE {
            return Err(StreamError::corrupt("gzip member header truncated"));
        }
        if buf[..16] != GZIP_EXTRA_PREFIX {
            return Err(StreamError::corrupt("not a gzip member with an EF length field"));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[16..20]);
        Ok(Self {
            block_len: u32::from_le_bytes(len),
        })
    }
}

/// Prefixes each payload with a [`FrameHeader`] recording the member length.
pub struct GzipExtra;

impl Framing for GzipExtra {
    fn name(&self) -> &'static str {
        "gzip-extra"
    }

    fn header_len(&self) -> usize {
        GZIP_EXTRA_HEADER_SIZE
    }

    fn seal(&self, header: &mut [u8], payload: &[u8], _trailer: &mut [u8]) -> Result<(), StreamError> {
        let total = GZIP_EXTRA_HEADER_SIZE + payload.len();
        let block_len = u32::try_from(total).map_err(|_| StreamError::Overflow {
            needed: total,
            available: u32::MAX as usize,
        })?;
        header.copy_from_slice(&FrameHeader::new(block_len).to_bytes());
        Ok(())
    }

    fn unseal(&self, header: &[u8], payload: &[u8], _trailer: &[u8]) -> Result<(), StreamError> {
        let parsed = FrameHeader::from_bytes(header)?;
        let total = GZIP_EXTRA_HEADER_SIZE + payload.len();
        if parsed.block_len as usize != total {
            return Err(StreamError::Corrupt(format!(
                "member length field says {} but frame spans {} bytes",
                parsed.block_len, total
            )));
        }
        Ok(())
    }
}
