use cstream_core::codec::Codec;
use cstream_core::format::CODEC_ZLIB;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use flate2::write::ZlibEncoder;
use std::io::Write;

/// Zlib block codec (deflate with the zlib wrapper).
///
/// Engine levels map one-to-one onto zlib levels.
///
/// Best for: interoperability with tooling that already speaks deflate.
pub struct ZlibCodec;

impl Codec for ZlibCodec {
    fn id(&self) -> u8 {
        CODEC_ZLIB
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress_block(&self, raw: &[u8], level: u8) -> anyhow::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(level as u32));
        encoder.write_all(raw)?;
        Ok(encoder.finish()?)
    }

    fn decompress_block(&self, compressed: &[u8], raw: &mut [u8]) -> anyhow::Result<usize> {
        let mut inflater = Decompress::new(true);
        let status = inflater
            .decompress(compressed, raw, FlushDecompress::Finish)
            .map_err(|e| anyhow::anyhow!("zlib decompress error: {}", e))?;
        if status != Status::StreamEnd {
            anyhow::bail!(
                "zlib stream did not end within {} output bytes ({} of {} input bytes used)",
                raw.len(),
                inflater.total_in(),
                compressed.len()
            );
        }
        Ok(inflater.total_out() as usize)
    }
}
