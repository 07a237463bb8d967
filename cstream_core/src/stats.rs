/// Byte counters kept by every adapter and reported on close.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Uncompressed bytes that went in (encode) or came out (decode).
    pub raw_bytes: u64,
    /// Framed bytes written to or read from the wrapped endpoint.
    pub encoded_bytes: u64,
    /// Frames written or decoded.
    pub frames: u64,
}

impl StreamStats {
    /// Compression ratio (raw / encoded).
    pub fn ratio(&self) -> f64 {
        if self.encoded_bytes == 0 {
            return 1.0;
        }
        self.raw_bytes as f64 / self.encoded_bytes as f64
    }
}
