//! Endpoints and data generators shared by the integration tests.
#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cstream_codecs::codec_by_name;
use cstream_core::{
    CodecEngine, DecodeAdapter, EncodeAdapter, EncodeConfig, EngineConfig, Sink, Source, StreamError,
    StreamStats,
};

/// Generate `len` deterministic bytes using a simple LCG.
pub fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = seed;
    (0..len)
        .map(|_| {
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (rng >> 56) as u8
        })
        .collect()
}

/// Generate `len` highly compressible bytes (repeating pattern).
pub fn compressible_bytes(len: usize) -> Vec<u8> {
    let pattern = b"the quick brown fox jumps over the lazy dog. ";
    (0..len).map(|i| pattern[i % pattern.len()]).collect()
}

/// Engine with small splits so multi-split blocks are the common case.
pub fn engine(codec: &str) -> Arc<CodecEngine> {
    let config = EngineConfig {
        threads: 2,
        split_len: 16 * 1024,
        type_size: 1,
    };
    CodecEngine::new(codec_by_name(codec).unwrap(), config).unwrap()
}

// ── sinks ─────────────────────────────────────────────────────────────────

/// Sink whose contents stay observable after the adapter takes ownership.
#[derive(Clone, Default)]
pub struct SharedSink {
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl SharedSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Sink for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that only ever accepts half of what it is offered.
#[derive(Clone, Default)]
pub struct HalfSink {
    pub inner: SharedSink,
}

impl Sink for HalfSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len() / 2;
        self.inner.write(&buf[..n])
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Sink that accepts `accept` writes and then fails every later one.
#[derive(Clone, Default)]
pub struct FailingSink {
    pub inner: SharedSink,
    pub accept: usize,
}

impl Sink for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.write_calls() >= self.accept {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "downstream went away"));
        }
        self.inner.write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

// ── sources ───────────────────────────────────────────────────────────────

/// In-memory source that hands out at most `max_read` bytes per call.
pub struct VecSource {
    data: Vec<u8>,
    pos: usize,
    max_read: usize,
    closed: Arc<AtomicBool>,
}

impl VecSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_max_read(data, usize::MAX)
    }

    pub fn with_max_read(data: Vec<u8>, max_read: usize) -> Self {
        Self {
            data,
            pos: 0,
            max_read,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl Source for VecSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.max_read).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Source that hands out the first `limit` bytes of `data`, then errors.
pub struct FailingSource {
    inner: VecSource,
    remaining: usize,
}

impl FailingSource {
    pub fn new(data: Vec<u8>, limit: usize) -> Self {
        Self {
            inner: VecSource::new(data),
            remaining: limit,
        }
    }
}

impl Source for FailingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "parent reset"));
        }
        let n = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..n])?;
        self.remaining -= n;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

// ── drivers ───────────────────────────────────────────────────────────────

/// Encode `data` in `write_size` pieces and return the child's bytes.
pub fn encode_all(
    engine: Arc<CodecEngine>,
    config: EncodeConfig,
    data: &[u8],
    write_size: usize,
) -> (Vec<u8>, StreamStats) {
    let sink = SharedSink::default();
    let mut adapter = EncodeAdapter::open(sink.clone(), engine, config).unwrap();
    for chunk in data.chunks(write_size.max(1)) {
        assert_eq!(adapter.write(chunk).unwrap(), chunk.len());
    }
    let stats = adapter.close().unwrap();
    assert!(sink.is_closed());
    (sink.bytes(), stats)
}

/// Read `adapter` to end-of-stream with a `read_size` buffer.
pub fn decode_all<S: Source>(adapter: &mut DecodeAdapter<S>, read_size: usize) -> Result<Vec<u8>, StreamError> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; read_size];
    loop {
        let n = adapter.read(&mut buf)?;
        assert!(n <= read_size, "read returned {} for a {}-byte request", n, read_size);
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}
