use cstream_core::codec::Codec;
use cstream_core::format::CODEC_LZ4;
use lz4_flex::block::{compress, decompress_into};

/// LZ4 block codec.
///
/// Fastest of the bundled codecs in both directions. The level is ignored;
/// the engine already knows each split's raw length, so no size prefix is
/// stored.
///
/// Best for: hot data and links where CPU, not bandwidth, is the bottleneck.
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn id(&self) -> u8 {
        CODEC_LZ4
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress_block(&self, raw: &[u8], _level: u8) -> anyhow::Result<Vec<u8>> {
        Ok(compress(raw))
    }

    fn decompress_block(&self, compressed: &[u8], raw: &mut [u8]) -> anyhow::Result<usize> {
        let n = decompress_into(compressed, raw)
            .map_err(|e| anyhow::anyhow!("lz4 decompress error: {}", e))?;
        Ok(n)
    }
}
