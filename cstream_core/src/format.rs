/// Version byte written at offset 0 of every engine block.
pub const BLOCK_VERSION: u8 = 1;

/// Fixed size of an engine block header in bytes.
///   version:u8 + codec_id:u8 + flags:u8 + type_size:u8
///   + raw_len:u32 + split_len:u32 + block_len:u32
///   = 1 + 1 + 1 + 1 + 4 + 4 + 4 = 16
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of one entry in the split length table that follows the header.
pub const SPLIT_ENTRY_SIZE: usize = 4;

/// High bit of a split table entry: the split is stored verbatim.
pub const SPLIT_STORED: u32 = 1 << 31;

// ── Flags ──────────────────────────────────────────────────────────────────

/// Splits were byte-shuffled with `type_size` before compression.
pub const FLAG_SHUFFLE: u8 = 1 << 0;

// ── Codec IDs ──────────────────────────────────────────────────────────────

pub const CODEC_PASSTHROUGH: u8 = 0;
pub const CODEC_LZ4: u8 = 1;
pub const CODEC_ZLIB: u8 = 4;
pub const CODEC_ZSTD: u8 = 5;

/// Compressor names accepted by name lookups, in table order. Only some of
/// them have a bundled implementation; the rest are recognised so callers get
/// an "unsupported" error instead of "unknown".
pub const COMPRESSOR_NAMES: [&str; 6] = ["blosclz", "lz4", "lz4hc", "snappy", "zlib", "zstd"];

// ── Block header ───────────────────────────────────────────────────────────

/// Decoded representation of the 16-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub codec_id: u8,
    pub flags: u8,
    pub type_size: u8,
    /// Uncompressed bytes carried by the block.
    pub raw_len: u32,
    /// Raw bytes per split (the last split may be smaller).
    pub split_len: u32,
    /// Total encoded size including this header and the split table.
    pub block_len: u32,
}

impl BlockHeader {
    /// Serialize to exactly `BLOCK_HEADER_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0] = BLOCK_VERSION;
        buf[1] = self.codec_id;
        buf[2] = self.flags;
        buf[3] = self.type_size;
        buf[4..8].copy_from_slice(&self.raw_len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.split_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_len.to_le_bytes());
        buf
    }

    /// Parse the header at the front of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than `BLOCK_HEADER_SIZE` bytes are
    /// available; the caller should stage more input and try again.
    pub fn peek(buf: &[u8]) -> anyhow::Result<Option<Self>> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Ok(None);
        }
        if buf[0] != BLOCK_VERSION {
            anyhow::bail!("unsupported block version {} (only version 1 is supported)", buf[0]);
        }
        let header = Self {
            codec_id: buf[1],
            flags: buf[2],
            type_size: buf[3],
            raw_len: u32::from_le_bytes(buf[4..8].try_into()?),
            split_len: u32::from_le_bytes(buf[8..12].try_into()?),
            block_len: u32::from_le_bytes(buf[12..16].try_into()?),
        };
        if header.raw_len > 0 && header.split_len == 0 {
            anyhow::bail!("block carries {} raw bytes but split length is zero", header.raw_len);
        }
        if (header.block_len as usize) < BLOCK_HEADER_SIZE + header.table_len() {
            anyhow::bail!(
                "block length {} is smaller than its own header and split table",
                header.block_len
            );
        }
        Ok(Some(header))
    }

    /// Number of splits the raw bytes were divided into.
    pub fn split_count(&self) -> usize {
        if self.raw_len == 0 {
            0
        } else {
            (self.raw_len as usize).div_ceil(self.split_len as usize)
        }
    }

    /// Size of the split length table in bytes.
    pub fn table_len(&self) -> usize {
        self.split_count() * SPLIT_ENTRY_SIZE
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes_roundtrip() {
        let header = BlockHeader {
            codec_id: CODEC_ZSTD,
            flags: FLAG_SHUFFLE,
            type_size: 4,
            raw_len: 100_000,
            split_len: 32_768,
            block_len: 40_000,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], BLOCK_VERSION);
        assert_eq!(BlockHeader::peek(&bytes).unwrap(), Some(header));
        assert_eq!(header.split_count(), 4);
        assert_eq!(header.table_len(), 16);
    }

    #[test]
    fn test_peek_needs_full_header() {
        let bytes = [BLOCK_VERSION, 0, 0, 1, 0, 0];
        assert!(BlockHeader::peek(&bytes).unwrap().is_none());
    }

    #[test]
    fn test_peek_rejects_bad_version() {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0] = 9;
        let err = BlockHeader::peek(&bytes).unwrap_err().to_string();
        assert!(err.contains("unsupported block version"), "got: {err}");
    }

    #[test]
    fn test_empty_block_has_no_splits() {
        let header = BlockHeader {
            codec_id: CODEC_LZ4,
            flags: 0,
            type_size: 1,
            raw_len: 0,
            split_len: 0,
            block_len: BLOCK_HEADER_SIZE as u32,
        };
        assert_eq!(header.split_count(), 0);
        assert_eq!(BlockHeader::peek(&header.to_bytes()).unwrap(), Some(header));
    }
}
