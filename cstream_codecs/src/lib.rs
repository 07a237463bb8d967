mod lz4_codec;
mod passthrough;
mod soft_deflate;
mod zlib_codec;
mod zstd_codec;

pub use lz4_codec::Lz4Codec;
pub use passthrough::PassThroughCodec;
pub use soft_deflate::{SoftDeflateDevice, STATUS_DEFLATE_ERROR, STATUS_OUTPUT_FULL, STATUS_WORKER_LOST};
pub use zlib_codec::ZlibCodec;
pub use zstd_codec::ZstdCodec;

use cstream_core::format::{CODEC_LZ4, CODEC_PASSTHROUGH, CODEC_ZLIB, CODEC_ZSTD, COMPRESSOR_NAMES};
use cstream_core::Codec;
use std::sync::Arc;

/// Resolve a codec from the `codec_id` in a block header.
///
/// Called by the CLI when decoding an existing stream, so the decode engine
/// can be built with the right codec after peeking at the first block.
pub fn codec_by_id(id: u8) -> anyhow::Result<Arc<dyn Codec>> {
    match id {
        CODEC_PASSTHROUGH => Ok(Arc::new(PassThroughCodec)),
        CODEC_LZ4 => Ok(Arc::new(Lz4Codec)),
        CODEC_ZLIB => Ok(Arc::new(ZlibCodec)),
        CODEC_ZSTD => Ok(Arc::new(ZstdCodec)),
        _ => anyhow::bail!(
            "unknown codec id {}; supported: 0 (none), 1 (lz4), 4 (zlib), 5 (zstd)",
            id
        ),
    }
}

/// Resolve a codec from its compressor-table name.
pub fn codec_by_name(name: &str) -> anyhow::Result<Arc<dyn Codec>> {
    match name {
        "none" | "passthrough" => Ok(Arc::new(PassThroughCodec)),
        "lz4" => Ok(Arc::new(Lz4Codec)),
        "zlib" => Ok(Arc::new(ZlibCodec)),
        "zstd" => Ok(Arc::new(ZstdCodec)),
        known if COMPRESSOR_NAMES.contains(&known) => {
            anyhow::bail!("compressor '{}' is not supported by this build", known)
        }
        other => anyhow::bail!(
            "unknown compressor '{}'. Valid options: none, lz4, zlib, zstd",
            other
        ),
    }
}
