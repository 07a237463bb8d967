use std::io;
use std::sync::Arc;

use log::{debug, error, trace};
use serde::Deserialize;

use crate::endpoint::Source;
use crate::engine::CodecEngine;
use crate::error::{AdapterState, StreamError};
use crate::format::{BlockHeader, BLOCK_HEADER_SIZE};
use crate::framing::{Framing, FramingKind};
use crate::staging::StagingBuffer;
use crate::stats::StreamStats;

/// Default input staging: 2 MB.
pub const DEFAULT_DECODE_STAGING: usize = 2 * 1024 * 1024;

/// Default ceiling on the decoded size of one frame: 64 MB.
pub const DEFAULT_MAX_FRAME_RAW: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Bytes of compressed input staged from the parent at a time. Must hold
    /// the largest frame in the stream.
    pub staging_capacity: usize,
    /// Framing the stream was written with.
    pub framing: FramingKind,
    /// Largest decoded size a single frame may claim. Frames above it are
    /// rejected before any output memory is allocated.
    pub max_frame_raw: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            staging_capacity: DEFAULT_DECODE_STAGING,
            framing: FramingKind::Unframed,
            max_frame_raw: DEFAULT_MAX_FRAME_RAW,
        }
    }
}

/// Where one complete frame sits inside the staged input.
#[derive(Debug, Clone, Copy)]
struct FrameSpan {
    block_start: usize,
    block_len: usize,
    total: usize,
    raw_len: usize,
}

/// Streaming decoder over a compressed [`Source`].
///
/// # Read contract
/// [`read`](Self::read) fills as much of the caller's buffer as it can and
/// never returns more than was asked for. Compressed input is staged from the
/// parent in large reads; each complete frame is decoded straight into the
/// caller's buffer, or into an internal spill buffer when the caller's
/// remaining space is smaller than the frame. Frames that straddle a refill
/// are kept: the unconsumed tail is moved to the front of the staging buffer
/// before the next parent read.
///
/// `Ok(0)` means clean end-of-stream and stays that way for every later
/// call. Errors that happen after some bytes were produced are held back:
/// the partial count is returned first and the error on the next call.
pub struct DecodeAdapter<S: Source> {
    parent: S,
    engine: Arc<CodecEngine>,
    framing: Box<dyn Framing>,
    input: StagingBuffer,
    /// Offset of the first unconsumed staged byte.
    consumed: usize,
    /// Decoded bytes of a frame that did not fit the caller's buffer.
    spill: Vec<u8>,
    spill_pos: usize,
    max_frame_raw: usize,
    state: AdapterState,
    pending_error: Option<StreamError>,
    stats: StreamStats,
    closed: bool,
}

impl<S: Source> DecodeAdapter<S> {
    /// Wrap an already-open `parent`.
    pub fn open(parent: S, engine: Arc<CodecEngine>, config: DecodeConfig) -> Result<Self, StreamError> {
        let framing = config.framing.build();
        let minimum = framing.header_len() + BLOCK_HEADER_SIZE + framing.trailer_len();
        if config.staging_capacity < minimum {
            return Err(StreamError::Resource(format!(
                "decode staging of {} bytes cannot hold a {}-byte frame header",
                config.staging_capacity, minimum
            )));
        }
        debug!(
            "decode adapter open: codec={} framing={} staging={}",
            engine.codec().name(),
            framing.name(),
            config.staging_capacity
        );
        Ok(Self {
            parent,
            engine,
            framing,
            input: StagingBuffer::with_capacity(config.staging_capacity),
            consumed: 0,
            spill: Vec::new(),
            spill_pos: 0,
            max_frame_raw: config.max_frame_raw,
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

    /// Staged compressed bytes not yet decoded.
    #[inline]
    pub fn available(&self) -> usize {
        self.input.used() - self.consumed
    }

    /// Decode into `out`, returning the number of bytes produced.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, StreamError> {
        match self.state {
            AdapterState::EndOfStream => return Ok(0),
            AdapterState::Failed => return Err(self.pending_error.take().unwrap_or(StreamError::Terminated)),
            AdapterState::Active => {}
        }
        if out.is_empty() {
            return Ok(0);
        }

        let mut produced = 0;
        while produced < out.len() {
            if self.spill_pos < self.spill.len() {
                let n = (out.len() - produced).min(self.spill.len() - self.spill_pos);
                out[produced..produced + n].copy_from_slice(&self.spill[self.spill_pos..self.spill_pos + n]);
                self.spill_pos += n;
                produced += n;
                continue;
            }

            let span = match self.next_frame() {
                Ok(span) => span,
                Err(e) => return self.fail(produced, e),
            };
            match span {
                Some(span) => match self.decode_frame(span, &mut out[produced..]) {
                    Ok(n) => produced += n,
                    Err(e) => return self.fail(produced, e),
                },
                None => match self.refill() {
                    Ok(0) => {
                        if self.available() > 0 {
                            let err = io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                format!("stream ends inside a frame ({} bytes left over)", self.available()),
                            );
                            return self.fail(produced, StreamError::Io(err));
                        }
                        if produced == 0 {
                            debug!(
                                "end of stream: raw={} encoded={} frames={}",
                                self.stats.raw_bytes, self.stats.encoded_bytes, self.stats.frames
                            );
                            self.state = AdapterState::EndOfStream;
                        }
                        return Ok(produced);
                    }
                    Ok(_) => {}
                    Err(e) => return self.fail(produced, e),
                },
            }
        }
        Ok(produced)
    }

    /// Locate the next complete frame in the staged input, if there is one.
    fn next_frame(&self) -> Result<Option<FrameSpan>, StreamError> {
        let staged = &self.input.filled()[self.consumed..];
        let header_len = self.framing.header_len();
        let trailer_len = self.framing.trailer_len();
        if staged.len() < header_len {
            return Ok(None);
        }
        let header = match BlockHeader::peek(&staged[header_len..]) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StreamError::Corrupt(format!("{e:#}"))),
        };
        let raw_len = header.raw_len as usize;
        if raw_len > self.max_frame_raw {
            return Err(StreamError::Overflow {
                needed: raw_len,
                available: self.max_frame_raw,
            });
        }
        let block_len = header.block_len as usize;
        let total = header_len + block_len + trailer_len;
        if total > self.input.capacity() {
            return Err(StreamError::Overflow {
                needed: total,
                available: self.input.capacity(),
            });
        }
        if staged.len() < total {
            return Ok(None);
        }
        self.framing.unseal(
            &staged[..header_len],
            &staged[header_len..header_len + block_len],
            &staged[header_len + block_len..total],
        )?;
        Ok(Some(FrameSpan {
            block_start: self.consumed + header_len,
            block_len,
            total,
            raw_len,
        }))
    }

    /// Decode one frame. Output goes to `dst` when it fits, otherwise to the
    /// spill buffer, in which case 0 is returned and the read loop copies it
    /// out.
    fn decode_frame(&mut self, span: FrameSpan, dst: &mut [u8]) -> Result<usize, StreamError> {
        let block = &self.input.filled()[span.block_start..span.block_start + span.block_len];
        let direct = span.raw_len <= dst.len();
        let n = if direct {
            self.engine.decompress_into(block, dst)?
        } else {
            // The split table is checked before the header's raw length is
            // trusted with an allocation.
            self.engine.validate(block)?;
            self.spill.clear();
            self.spill_pos = 0;
            self.spill.try_reserve_exact(span.raw_len).map_err(|e| {
                StreamError::Resource(format!("spill buffer for a {}-byte frame: {e}", span.raw_len))
            })?;
            self.spill.resize(span.raw_len, 0);
            self.engine.decompress_into(block, &mut self.spill)?;
            trace!("frame of {} bytes spilled ({} requested)", span.raw_len, dst.len());
            0
        };
        self.consumed += span.total;
        self.stats.raw_bytes += span.raw_len as u64;
        self.stats.encoded_bytes += span.total as u64;
        self.stats.frames += 1;
        Ok(n)
    }

    /// Compact the staged tail and read more from the parent.
    fn refill(&mut self) -> Result<usize, StreamError> {
        if self.consumed > 0 {
            self.input.discard_front(self.consumed);
            self.consumed = 0;
        }
        let n = self.parent.read(self.input.spare_mut())?;
        self.input.commit(n);
        trace!("staged {} bytes from parent ({} available)", n, self.available());
        Ok(n)
    }

    fn fail(&mut self, produced: usize, err: StreamError) -> Result<usize, StreamError> {
        error!("decode failed after {} bytes this call: {}", produced, err);
        self.state = AdapterState::Failed;
        if produced > 0 {
            self.pending_error = Some(err);
            Ok(produced)
        } else {
            Err(err)
        }
    }

    /// Close the parent. Consumes the adapter so the parent is closed once.
    pub fn close(mut self) -> Result<StreamStats, StreamError> {
        self.shutdown()?;
        Ok(self.stats)
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("decode adapter close: state={:?} frames={}", self.state, self.stats.frames);
        self.parent.close()?;
        Ok(())
    }
}

impl<S: Source> Source for DecodeAdapter<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DecodeAdapter::read(self, buf).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown().map_err(io::Error::from)
    }
}

impl<S: Source> io::Read for DecodeAdapter<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DecodeAdapter::read(self, buf).map_err(io::Error::from)
    }
}
