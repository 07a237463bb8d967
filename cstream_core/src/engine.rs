use std::sync::Arc;

use log::{debug, trace};
use rayon::prelude::*;
use serde::Deserialize;

use crate::codec::Codec;
use crate::error::StreamError;
use crate::format::{
    BlockHeader, BLOCK_HEADER_SIZE, FLAG_SHUFFLE, SPLIT_ENTRY_SIZE, SPLIT_STORED,
};

/// Default worker threads per engine.
pub const DEFAULT_THREADS: usize = 4;

/// Default raw bytes per split: 256 KB.
pub const DEFAULT_SPLIT_LEN: usize = 256 * 1024;

/// Highest compression level accepted by the engine.
pub const MAX_LEVEL: u8 = 9;

/// Settings that used to be process-wide codec state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads splits are compressed on.
    pub threads: usize,
    /// Raw bytes per split; rounded down to a multiple of `type_size`.
    pub split_len: usize,
    /// Element width for the byte-shuffle filter; 1 disables shuffling.
    pub type_size: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            split_len: DEFAULT_SPLIT_LEN,
            type_size: 1,
        }
    }
}

/// Owned compression engine shared by adapters through an `Arc`.
///
/// One engine wraps one [`Codec`] and a private thread pool. Building the
/// engine is the "init + configure + select compressor" step; dropping the
/// last `Arc` is teardown. Two adapters holding different engines never see
/// each other's settings.
///
/// # Block layout
/// ```text
/// [HEADER: 16 bytes]
/// [SPLIT TABLE: 4 bytes × splits]   ← compressed length, high bit = stored
/// [SPLIT 0] [SPLIT 1] ... [SPLIT N-1]
/// ```
pub struct CodecEngine {
    codec: Arc<dyn Codec>,
    config: EngineConfig,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for CodecEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecEngine")
            .field("codec", &self.codec.name())
            .field("config", &self.config)
            .finish()
    }
}

impl CodecEngine {
    pub fn new(codec: Arc<dyn Codec>, config: EngineConfig) -> Result<Arc<Self>, StreamError> {
        if config.threads == 0 {
            return Err(StreamError::Resource("engine needs at least one thread".into()));
        }
        if config.type_size == 0 {
            return Err(StreamError::Resource("type size must be at least 1".into()));
        }
        let type_size = config.type_size as usize;
        let split_len = (config.split_len / type_size) * type_size;
        if split_len == 0 || split_len > (SPLIT_STORED - 1) as usize {
            return Err(StreamError::Resource(format!(
                "split length {} is unusable with type size {}",
                config.split_len, config.type_size
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("cstream-engine-{i}"))
            .build()
            .map_err(|e| StreamError::Resource(format!("engine thread pool: {e}")))?;
        debug!(
            "engine ready: codec={} threads={} split_len={} type_size={}",
            codec.name(),
            config.threads,
            split_len,
            config.type_size
        );
        Ok(Arc::new(Self {
            codec,
            config: EngineConfig {
                split_len,
                ..config
            },
            pool,
        }))
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Worst-case encoded size of `raw_len` bytes: header, table, and every
    /// split stored verbatim.
    pub fn max_encoded_len(&self, raw_len: usize) -> usize {
        let splits = raw_len.div_ceil(self.config.split_len);
        BLOCK_HEADER_SIZE + splits * SPLIT_ENTRY_SIZE + raw_len
    }

    /// Encode `src` as one block into the front of `dst`.
    ///
    /// Nothing is written to `dst` unless the whole block fits; otherwise
    /// [`StreamError::Overflow`] reports the size that was needed.
    pub fn compress_into(&self, level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize, StreamError> {
        let raw_len = u32::try_from(src.len()).map_err(|_| StreamError::Overflow {
            needed: src.len(),
            available: u32::MAX as usize,
        })?;
        let level = level.min(MAX_LEVEL);
        let split_len = self.config.split_len;
        let type_size = self.config.type_size as usize;
        let shuffle = type_size > 1;

        let splits: Vec<Vec<u8>> = self.pool.install(|| {
            src.par_chunks(split_len)
                .map(|chunk| self.encode_split(level, type_size, shuffle, chunk))
                .collect::<Result<Vec<_>, StreamError>>()
        })?;

        let table_len = splits.len() * SPLIT_ENTRY_SIZE;
        let payload_len: usize = splits.iter().map(|s| s.len()).sum();
        let needed = BLOCK_HEADER_SIZE + table_len + payload_len;
        if needed > dst.len() {
            return Err(StreamError::Overflow {
                needed,
                available: dst.len(),
            });
        }

        let header = BlockHeader {
            codec_id: self.codec.id(),
            flags: if shuffle { FLAG_SHUFFLE } else { 0 },
            type_size: self.config.type_size,
            raw_len,
            split_len: if raw_len == 0 { 0 } else { split_len as u32 },
            block_len: block_len_field(needed)?,
        };
        dst[..BLOCK_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        let mut table_pos = BLOCK_HEADER_SIZE;
        let mut data_pos = BLOCK_HEADER_SIZE + table_len;
        for (chunk, split) in src.chunks(split_len).zip(&splits) {
            let mut entry = split.len() as u32;
            if split.len() == chunk.len() {
                entry |= SPLIT_STORED;
            }
            dst[table_pos..table_pos + SPLIT_ENTRY_SIZE].copy_from_slice(&entry.to_le_bytes());
            dst[data_pos..data_pos + split.len()].copy_from_slice(split);
            table_pos += SPLIT_ENTRY_SIZE;
            data_pos += split.len();
        }

        trace!(
            "encoded block: raw={} encoded={} splits={}",
            raw_len,
            needed,
            splits.len()
        );
        Ok(needed)
    }

    /// Compress one split, falling back to a verbatim copy when compression
    /// does not pay off. A stored split always has exactly the raw length.
    fn encode_split(
        &self,
        level: u8,
        type_size: usize,
        shuffle: bool,
        chunk: &[u8],
    ) -> Result<Vec<u8>, StreamError> {
        let shuffled;
        let input = if shuffle {
            shuffled = shuffle_bytes(chunk, type_size);
            shuffled.as_slice()
        } else {
            chunk
        };
        if level == 0 {
            return Ok(input.to_vec());
        }
        let compressed = self
            .codec
            .compress_block(input, level)
            .map_err(StreamError::Codec)?;
        if compressed.len() >= input.len() {
            Ok(input.to_vec())
        } else {
            Ok(compressed)
        }
    }

    /// Check the block at the front of `src` without decoding it: header,
    /// codec id, declared length and every split table entry.
    pub fn validate(&self, src: &[u8]) -> Result<BlockHeader, StreamError> {
        self.checked_block(src).map(|(header, _)| header)
    }

    fn checked_block<'a>(&self, src: &'a [u8]) -> Result<(BlockHeader, Vec<(bool, &'a [u8])>), StreamError> {
        let header = BlockHeader::peek(src)
            .map_err(|e| StreamError::Corrupt(format!("{e:#}")))?
            .ok_or_else(|| StreamError::corrupt("block header truncated"))?;
        if header.codec_id != self.codec.id() {
            return Err(StreamError::Codec(anyhow::anyhow!(
                "codec mismatch: block uses codec {} but engine has {} (id {})",
                header.codec_id,
                self.codec.name(),
                self.codec.id()
            )));
        }
        let block_len = header.block_len as usize;
        if src.len() < block_len {
            return Err(StreamError::Corrupt(format!(
                "block needs {} bytes but only {} were supplied",
                block_len,
                src.len()
            )));
        }
        let pieces = split_table(&header, &src[..block_len])?;
        Ok((header, pieces))
    }

    /// Decode the block at the front of `src` into `dst`.
    ///
    /// `src` must hold the whole block (see [`BlockHeader::block_len`]) and
    /// `dst` at least `raw_len` bytes. Returns the number of bytes produced.
    pub fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, StreamError> {
        let (header, pieces) = self.checked_block(src)?;
        let raw_len = header.raw_len as usize;
        if dst.len() < raw_len {
            return Err(StreamError::Overflow {
                needed: raw_len,
                available: dst.len(),
            });
        }
        if raw_len == 0 {
            return Ok(0);
        }

        let type_size = header.type_size.max(1) as usize;
        let shuffled = header.has_flag(FLAG_SHUFFLE);
        let codec = self.codec.as_ref();

        self.pool.install(|| {
            dst[..raw_len]
                .par_chunks_mut(header.split_len as usize)
                .zip(pieces.par_iter())
                .try_for_each(|(out, &(stored, piece))| {
                    decode_split(codec, stored, piece, out, shuffled, type_size)
                })
        })?;

        trace!("decoded block: encoded={} raw={}", header.block_len, raw_len);
        Ok(raw_len)
    }
}

/// The header stores the block length in 32 bits; header, table and stored
/// splits can push a block just under that limit of raw bytes past it.
fn block_len_field(needed: usize) -> Result<u32, StreamError> {
    u32::try_from(needed).map_err(|_| StreamError::Overflow {
        needed,
        available: u32::MAX as usize,
    })
}

/// Resolve the split table into `(stored, bytes)` pairs, bounds-checked
/// against the block.
fn split_table<'a>(header: &BlockHeader, block: &'a [u8]) -> Result<Vec<(bool, &'a [u8])>, StreamError> {
    let count = header.split_count();
    let split_len = header.split_len as usize;
    let mut pieces = Vec::with_capacity(count);
    let mut data_pos = BLOCK_HEADER_SIZE + header.table_len();
    for i in 0..count {
        let at = BLOCK_HEADER_SIZE + i * SPLIT_ENTRY_SIZE;
        let mut entry = [0u8; SPLIT_ENTRY_SIZE];
        entry.copy_from_slice(&block[at..at + SPLIT_ENTRY_SIZE]);
        let entry = u32::from_le_bytes(entry);
        let len = (entry & !SPLIT_STORED) as usize;
        let stored = entry & SPLIT_STORED != 0;
        let raw = (header.raw_len as usize - i * split_len).min(split_len);
        // Stored splits carry exactly their raw bytes; anything else must
        // have shrunk, or the encoder would have stored it.
        if (stored && len != raw) || (!stored && (len == 0 || len >= raw)) {
            return Err(StreamError::Corrupt(format!(
                "split {} claims {} encoded bytes for {} raw bytes (stored: {})",
                i, len, raw, stored
            )));
        }
        let end = data_pos + len;
        if end > block.len() {
            return Err(StreamError::Corrupt(format!(
                "split {} runs past the end of its block ({} > {})",
                i,
                end,
                block.len()
            )));
        }
        pieces.push((stored, &block[data_pos..end]));
        data_pos = end;
    }
    if data_pos != block.len() {
        return Err(StreamError::Corrupt(format!(
            "split table accounts for {} bytes but block is {}",
            data_pos,
            block.len()
        )));
    }
    Ok(pieces)
}

fn decode_split(
    codec: &dyn Codec,
    stored: bool,
    piece: &[u8],
    out: &mut [u8],
    shuffled: bool,
    type_size: usize,
) -> Result<(), StreamError> {
    if shuffled {
        let mut scratch = vec![0u8; out.len()];
        fill_split(codec, stored, piece, &mut scratch)?;
        unshuffle_bytes(&scratch, type_size, out);
        Ok(())
    } else {
        fill_split(codec, stored, piece, out)
    }
}

fn fill_split(codec: &dyn Codec, stored: bool, piece: &[u8], target: &mut [u8]) -> Result<(), StreamError> {
    if stored {
        if piece.len() != target.len() {
            return Err(StreamError::Corrupt(format!(
                "stored split is {} bytes, expected {}",
                piece.len(),
                target.len()
            )));
        }
        target.copy_from_slice(piece);
        return Ok(());
    }
    let produced = codec.decompress_block(piece, target).map_err(StreamError::Codec)?;
    if produced != target.len() {
        return Err(StreamError::Codec(anyhow::anyhow!(
            "split decompressed to {} bytes but {} were expected",
            produced,
            target.len()
        )));
    }
    Ok(())
}

/// Group byte `k` of every `type_size`-wide element together. Trailing bytes
/// that do not fill an element are copied unchanged.
fn shuffle_bytes(src: &[u8], type_size: usize) -> Vec<u8> {
    let elements = src.len() / type_size;
    let mut out = vec![0u8; src.len()];
    for i in 0..elements {
        for k in 0..type_size {
            out[k * elements + i] = src[i * type_size + k];
        }
    }
    let body = elements * type_size;
    out[body..].copy_from_slice(&src[body..]);
    out
}

fn unshuffle_bytes(src: &[u8], type_size: usize, dst: &mut [u8]) {
    let elements = src.len() / type_size;
    for i in 0..elements {
        for k in 0..type_size {
            dst[i * type_size + k] = src[k * elements + i];
        }
    }
    let body = elements * type_size;
    dst[body..].copy_from_slice(&src[body..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CODEC_PASSTHROUGH;

    /// Halves runs of identical byte pairs so the engine sees real savings
    /// on repetitive input without pulling a codec crate into unit tests.
    struct PairCodec;

    impl Codec for PairCodec {
        fn id(&self) -> u8 {
            CODEC_PASSTHROUGH
        }

        fn name(&self) -> &'static str {
            "pair"
        }

        fn compress_block(&self, raw: &[u8], _level: u8) -> anyhow::Result<Vec<u8>> {
            if raw.len() % 2 == 0 && raw.chunks(2).all(|p| p[0] == p[1]) {
                Ok(raw.iter().step_by(2).copied().collect())
            } else {
                Ok(raw.to_vec())
            }
        }

        fn decompress_block(&self, compressed: &[u8], raw: &mut [u8]) -> anyhow::Result<usize> {
            anyhow::ensure!(compressed.len() * 2 == raw.len(), "pair codec size mismatch");
            for (i, b) in compressed.iter().enumerate() {
                raw[2 * i] = *b;
                raw[2 * i + 1] = *b;
            }
            Ok(raw.len())
        }
    }

    fn engine(split_len: usize, type_size: u8) -> Arc<CodecEngine> {
        CodecEngine::new(
            Arc::new(PairCodec),
            EngineConfig {
                threads: 2,
                split_len,
                type_size,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_block_roundtrip_across_splits() {
        let engine = engine(64, 1);
        let src: Vec<u8> = (0..300u32).map(|i| (i / 2) as u8).collect();
        let mut block = vec![0u8; engine.max_encoded_len(src.len())];
        let n = engine.compress_into(5, &src, &mut block).unwrap();
        assert!(n < src.len(), "pairs should halve: {n}");

        let header = BlockHeader::peek(&block).unwrap().unwrap();
        assert_eq!(header.block_len as usize, n);
        assert_eq!(header.split_count(), 5);

        let mut out = vec![0u8; src.len()];
        assert_eq!(engine.decompress_into(&block[..n], &mut out).unwrap(), src.len());
        assert_eq!(out, src);
    }

    #[test]
    fn test_level_zero_stores_everything() {
        let engine = engine(64, 1);
        let src = vec![9u8; 100];
        let mut block = vec![0u8; engine.max_encoded_len(src.len())];
        let n = engine.compress_into(0, &src, &mut block).unwrap();
        assert_eq!(n, engine.max_encoded_len(src.len()));
    }

    #[test]
    fn test_overflow_leaves_destination_untouched() {
        let engine = engine(64, 1);
        let src: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
        let mut block = vec![0xAAu8; 50];
        match engine.compress_into(5, &src, &mut block) {
            Err(StreamError::Overflow { needed, available }) => {
                assert_eq!(available, 50);
                assert!(needed > 200);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert!(block.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_shuffle_roundtrip_with_ragged_tail() {
        let engine = engine(40, 4);
        assert_eq!(engine.config().split_len, 40);
        let src: Vec<u8> = (0..103u32).map(|i| (i % 13) as u8).collect();
        let mut block = vec![0u8; engine.max_encoded_len(src.len())];
        let n = engine.compress_into(3, &src, &mut block).unwrap();
        assert!(BlockHeader::peek(&block).unwrap().unwrap().has_flag(FLAG_SHUFFLE));

        let mut out = vec![0u8; src.len()];
        engine.decompress_into(&block[..n], &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_shuffle_helpers_are_inverse() {
        let src: Vec<u8> = (0..19u8).collect();
        let shuffled = shuffle_bytes(&src, 4);
        assert_eq!(&shuffled[..4], &[0, 4, 8, 12]);
        let mut back = vec![0u8; src.len()];
        unshuffle_bytes(&shuffled, 4, &mut back);
        assert_eq!(back, src);
    }

    #[test]
    fn test_empty_input_is_header_only() {
        let engine = engine(64, 1);
        let mut block = [0u8; BLOCK_HEADER_SIZE];
        assert_eq!(engine.compress_into(5, &[], &mut block).unwrap(), BLOCK_HEADER_SIZE);
        let mut out = [0u8; 0];
        assert_eq!(engine.decompress_into(&block, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_split_table_is_rejected() {
        let engine = engine(64, 1);
        let src = vec![1u8; 128];
        let mut block = vec![0u8; engine.max_encoded_len(src.len())];
        let n = engine.compress_into(5, &src, &mut block).unwrap();
        block[BLOCK_HEADER_SIZE] = 0xFF;
        let mut out = vec![0u8; src.len()];
        assert!(matches!(
            engine.decompress_into(&block[..n], &mut out),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn test_block_len_past_u32_is_overflow() {
        assert_eq!(block_len_field(u32::MAX as usize).unwrap(), u32::MAX);
        match block_len_field(u32::MAX as usize + 17) {
            Err(StreamError::Overflow { needed, available }) => {
                assert_eq!(needed, u32::MAX as usize + 17);
                assert_eq!(available, u32::MAX as usize);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_compressed_split_is_rejected() {
        let engine = engine(64, 1);
        let header = BlockHeader {
            codec_id: CODEC_PASSTHROUGH,
            flags: 0,
            type_size: 1,
            raw_len: 64,
            split_len: 64,
            block_len: (BLOCK_HEADER_SIZE + SPLIT_ENTRY_SIZE) as u32,
        };
        let mut block = header.to_bytes().to_vec();
        block.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(engine.validate(&block), Err(StreamError::Corrupt(_))));

        // a stored split shorter than its raw size
        let mut short = header;
        short.block_len += 10;
        let mut block = short.to_bytes().to_vec();
        block.extend_from_slice(&(10 | SPLIT_STORED).to_le_bytes());
        block.extend_from_slice(&[7u8; 10]);
        assert!(matches!(engine.validate(&block), Err(StreamError::Corrupt(_))));
    }

    #[test]
    fn test_validate_accepts_encoded_block() {
        let engine = engine(64, 1);
        let src = vec![3u8; 150];
        let mut block = vec![0u8; engine.max_encoded_len(src.len())];
        let n = engine.compress_into(5, &src, &mut block).unwrap();
        let header = engine.validate(&block[..n]).unwrap();
        assert_eq!(header.raw_len, 150);
        assert_eq!(header.block_len as usize, n);
    }

    #[test]
    fn test_zero_threads_is_a_resource_error() {
        let err = CodecEngine::new(
            Arc::new(PairCodec),
            EngineConfig {
                threads: 0,
                ..EngineConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Resource(_)));
    }
}
