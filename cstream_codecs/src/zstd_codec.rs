use cstream_core::codec::Codec;
use cstream_core::format::CODEC_ZSTD;

/// Zstandard block codec.
///
/// Engine levels 1..=9 map onto zstd levels 1..=19 so the top of the range
/// reaches zstd's strongest non-ultra settings.
///
/// Best for: general text, JSON, logs, mixed structured data.
pub struct ZstdCodec;

impl ZstdCodec {
    fn zstd_level(level: u8) -> i32 {
        (level as i32 * 2 - 1).clamp(1, 19)
    }
}

impl Codec for ZstdCodec {
    fn id(&self) -> u8 {
        CODEC_ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress_block(&self, raw: &[u8], level: u8) -> anyhow::Result<Vec<u8>> {
        let compressed = zstd::bulk::compress(raw, Self::zstd_level(level))?;
        Ok(compressed)
    }

    fn decompress_block(&self, compressed: &[u8], raw: &mut [u8]) -> anyhow::Result<usize> {
        let n = zstd::bulk::decompress_to_buffer(compressed, raw)?;
        Ok(n)
    }
}
