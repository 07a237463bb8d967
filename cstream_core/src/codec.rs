/// Per-algorithm compression primitive.
///
/// A `Codec` only knows how to turn one contiguous run of bytes into another
/// and back. Block headers, splitting across threads, shuffling, and the
/// stored-verbatim fallback all live in [`CodecEngine`](crate::CodecEngine),
/// so implementations stay small and stateless.
pub trait Codec: Send + Sync {
    /// Stable codec ID stored in every block header.
    fn id(&self) -> u8;

    /// Name used in the compressor table and CLI display.
    fn name(&self) -> &'static str;

    /// Compress one split. `level` is 1..=9; level 0 never reaches a codec
    /// because the engine stores those splits verbatim.
    fn compress_block(&self, raw: &[u8], level: u8) -> anyhow::Result<Vec<u8>>;

    /// Decompress one split into `raw`, whose length is the exact uncompressed
    /// size. Returns the number of bytes produced.
    fn decompress_block(&self, compressed: &[u8], raw: &mut [u8]) -> anyhow::Result<usize>;
}
