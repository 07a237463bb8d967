use std::io;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use serde::Deserialize;

use crate::endpoint::Sink;
use crate::engine::CodecEngine;
use crate::error::{AdapterState, StreamError};
use crate::framing::{Framing, FramingKind};
use crate::staging::StagingBuffer;
use crate::stats::StreamStats;

/// Default output staging: 1 MB.
pub const DEFAULT_ENCODE_STAGING: usize = 1024 * 1024;

/// Flush once free staging space drops to 100 KB or less.
pub const DEFAULT_LOW_WATER: usize = 100 * 1024;

/// Default caller bytes encoded per block: 64 KB.
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

/// Default compression level (0 = store, 9 = smallest).
pub const DEFAULT_LEVEL: u8 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    pub staging_capacity: usize,
    pub low_water: usize,
    /// Caller bytes encoded into one block. Its worst-case encoded size must
    /// fit under `low_water`, or a chunk can overflow the staging buffer.
    pub max_chunk: usize,
    pub level: u8,
    pub framing: FramingKind,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            staging_capacity: DEFAULT_ENCODE_STAGING,
            low_water: DEFAULT_LOW_WATER,
            max_chunk: DEFAULT_MAX_CHUNK,
            level: DEFAULT_LEVEL,
            framing: FramingKind::Unframed,
        }
    }
}

/// Streaming encoder in front of a [`Sink`].
///
/// # Write contract
/// Call [`write`](Self::write) any number of times. Input is cut into chunks
/// of at most `max_chunk` bytes; each chunk is encoded as one framed block
/// directly into the free region of the staging buffer. Whenever the free
/// region is at or below the low-water mark, the staged bytes go to the child
/// in a single write. [`close`](Self::close) flushes what is left and closes
/// the child.
///
/// A chunk that does not fit the free region is fatal: there is no spill
/// path. A child that accepts fewer bytes than offered is fatal as well; the
/// bytes consumed before that point are still reported.
pub struct EncodeAdapter<K: Sink> {
    child: K,
    engine: Arc<CodecEngine>,
    framing: Box<dyn Framing>,
    staging: StagingBuffer,
    level: u8,
    low_water: usize,
    max_chunk: usize,
    state: AdapterState,
    pending_error: Option<StreamError>,
    stats: StreamStats,
    closed: bool,
}

impl<K: Sink> EncodeAdapter<K> {
    /// Wrap an already-open `child`.
    pub fn open(child: K, engine: Arc<CodecEngine>, config: EncodeConfig) -> Result<Self, StreamError> {
        if config.max_chunk == 0 {
            return Err(StreamError::Resource("max_chunk must be at least 1 byte".into()));
        }
        if config.low_water >= config.staging_capacity {
            return Err(StreamError::Resource(format!(
                "low-water mark {} leaves no room in {} bytes of staging",
                config.low_water, config.staging_capacity
            )));
        }
        let framing = config.framing.build();
        let worst = framing.header_len() + engine.max_encoded_len(config.max_chunk) + framing.trailer_len();
        if worst > config.low_water {
            warn!(
                "a {}-byte chunk may encode to {} bytes, above the {}-byte low-water mark; \
                 incompressible input can overflow staging",
                config.max_chunk, worst, config.low_water
            );
        }
        debug!(
            "encode adapter open: codec={} level={} framing={} staging={} low_water={}",
            engine.codec().name(),
            config.level,
            framing.name(),
            config.staging_capacity,
            config.low_water
        );
        Ok(Self {
            child,
            engine,
            framing,
            staging: StagingBuffer::with_capacity(config.staging_capacity),
            level: config.level,
            low_water: config.low_water,
            max_chunk: config.max_chunk,
            state: AdapterState::Active,
            pending_error: None,
            stats: StreamStats::default(),
            closed: false,
        })
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Encoded bytes waiting in staging.
    pub fn staged(&self) -> usize {
        self.staging.used()
    }

    /// Encode `input`, returning how many caller bytes were consumed.
    pub fn write(&mut self, input: &[u8]) -> Result<usize, StreamError> {
        match self.state {
            AdapterState::Failed => return Err(self.pending_error.take().unwrap_or(StreamError::Terminated)),
            AdapterState::EndOfStream => return Ok(0),
            AdapterState::Active => {}
        }
        if input.is_empty() {
            return Ok(0);
        }

        let mut done = 0;
        while done < input.len() {
            if self.staging.remaining() <= self.low_water {
                if let Err(e) = self.flush_staging() {
                    return self.fail(done, e);
                }
            }
            let take = (input.len() - done).min(self.max_chunk);
            match self.encode_chunk(&input[done..done + take]) {
                Ok(()) => done += take,
                Err(e @ StreamError::Overflow { .. }) => {
                    error!("encode overflow after {} bytes this call: {}", done, e);
                    self.state = AdapterState::Failed;
                    return Err(e);
                }
                Err(e) => return self.fail(done, e),
            }
        }
        Ok(done)
    }

    /// Push everything staged so far to the child.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        match self.state {
            AdapterState::Failed => return Err(self.pending_error.take().unwrap_or(StreamError::Terminated)),
            AdapterState::EndOfStream => return Ok(()),
            AdapterState::Active => {}
        }
        if let Err(e) = self.flush_staging() {
            self.fail(0, e)?;
        }
        Ok(())
    }

    /// Encode one chunk as a framed block in the free staging region.
    fn encode_chunk(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        let header_len = self.framing.header_len();
        let trailer_len = self.framing.trailer_len();
        let spare = self.staging.spare_mut();
        let available = spare.len();
        if available < header_len + trailer_len {
            return Err(StreamError::Overflow {
                needed: header_len + self.engine.max_encoded_len(chunk.len()) + trailer_len,
                available,
            });
        }

        let (header, rest) = spare.split_at_mut(header_len);
        let payload_cap = rest.len() - trailer_len;
        let n = self
            .engine
            .compress_into(self.level, chunk, &mut rest[..payload_cap])
            .map_err(|e| match e {
                StreamError::Overflow { needed, .. } => StreamError::Overflow {
                    needed: header_len + needed + trailer_len,
                    available,
                },
                other => other,
            })?;
        let (payload, rest) = rest.split_at_mut(n);
        self.framing.seal(header, payload, &mut rest[..trailer_len])?;

        let frame_len = header_len + n + trailer_len;
        self.staging.commit(frame_len);
        self.stats.raw_bytes += chunk.len() as u64;
        self.stats.frames += 1;
        trace!(
            "chunk of {} bytes staged as {}-byte frame ({} free)",
            chunk.len(),
            frame_len,
            self.staging.remaining()
        );
        Ok(())
    }

    /// Write the used staging region to the child in one call.
    fn flush_staging(&mut self) -> Result<(), StreamError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let len = self.staging.used();
        let written = self.child.write(self.staging.filled())?;
        if written != len {
            return Err(StreamError::ShortWrite {
                requested: len,
                written,
            });
        }
        self.staging.clear();
        self.stats.encoded_bytes += len as u64;
        debug!("flushed {} staged bytes", len);
        Ok(())
    }

    fn fail(&mut self, done: usize, err: StreamError) -> Result<usize, StreamError> {
        error!("encode failed after {} bytes this call: {}", done, err);
        self.state = AdapterState::Failed;
        if done > 0 {
            self.pending_error = Some(err);
            Ok(done)
        } else {
            Err(err)
        }
    }

    /// Flush what is staged and close the child.
    ///
    /// The child is closed even when the final flush fails; the flush error
    /// is what gets reported. An adapter that already failed skips the flush.
    pub fn close(mut self) -> Result<StreamStats, StreamError> {
        self.shutdown()?;
        Ok(self.stats)
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = if self.state == AdapterState::Active {
            self.flush_staging()
        } else {
            self.pending_error.take().map_or(Ok(()), Err)
        };
        if let Err(e) = &flushed {
            if self.state == AdapterState::Active {
                error!("final flush failed: {}", e);
                self.state = AdapterState::Failed;
            }
        }
        let closed = self.child.close().map_err(StreamError::from);

        debug!(
            "encode adapter close: raw={} encoded={} frames={} ratio={:.2}x",
            self.stats.raw_bytes,
            self.stats.encoded_bytes,
            self.stats.frames,
            self.stats.ratio()
        );
        flushed.and(closed)
    }
}

impl<K: Sink> Drop for EncodeAdapter<K> {
    fn drop(&mut self) {
        if !self.closed {
            warn!("encode adapter dropped without close; flushing {} staged bytes", self.staging.used());
            let _ = self.shutdown();
        }
    }
}

impl<K: Sink> Sink for EncodeAdapter<K> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        EncodeAdapter::write(self, buf).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown().map_err(io::Error::from)
    }
}

impl<K: Sink> io::Write for EncodeAdapter<K> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        EncodeAdapter::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        EncodeAdapter::flush(self).map_err(io::Error::from)
    }
}
