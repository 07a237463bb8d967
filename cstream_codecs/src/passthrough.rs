use cstream_core::codec::Codec;
use cstream_core::format::CODEC_PASSTHROUGH;

/// No-op codec: every split is copied verbatim.
///
/// Useful for:
/// - Verifying the block format and framing independently of any codec.
/// - Data that is already compressed (e.g., JPEG, MP4) where further
///   compression would expand the stream.
pub struct PassThroughCodec;

impl Codec for PassThroughCodec {
    fn id(&self) -> u8 {
        CODEC_PASSTHROUGH
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn compress_block(&self, raw: &[u8], _level: u8) -> anyhow::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decompress_block(&self, compressed: &[u8], raw: &mut [u8]) -> anyhow::Result<usize> {
        anyhow::ensure!(
            compressed.len() == raw.len(),
            "passthrough split is {} bytes but {} were expected",
            compressed.len(),
            raw.len()
        );
        raw.copy_from_slice(compressed);
        Ok(raw.len())
    }
}
