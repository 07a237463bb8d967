use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serde::Deserialize;

use crate::endpoint::Sink;
use crate::error::{AdapterState, StreamError};
use crate::framing::{Framing, FramingKind};
use crate::hardware::{HardwareDevice, HardwareError, HardwareSlot, JobFlags, SlotStatus};
use crate::stats::StreamStats;

/// Raw bytes handed to the hardware per job: 128 KB.
pub const DEFAULT_INPUT_BLOCK: usize = 128 * 1024;

/// Slots opened per hardware channel.
pub const DEFAULT_SLOTS_PER_CHANNEL: usize = 4;

/// Bound on one wait for the tail slot: 30 s.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30 * 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub slots_per_channel: usize,
    pub input_block: usize,
    pub wait_timeout_ms: u64,
    pub framing: FramingKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slots_per_channel: DEFAULT_SLOTS_PER_CHANNEL,
            input_block: DEFAULT_INPUT_BLOCK,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            framing: FramingKind::GzipExtra,
        }
    }
}

impl PipelineConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Payload capacity per slot: the deflate worst case for one input block
    /// (5 bytes per 4 KB of stored blocks) plus slack for the stream trailer.
    pub fn payload_capacity(&self) -> usize {
        self.input_block + 5 * self.input_block.div_ceil(4096) + 30
    }
}

/// One unit of the ring. The buffers are `None` while the device owns them.
struct PipelineSlot {
    handle: Box<dyn HardwareSlot>,
    input: Option<Vec<u8>>,
    output: Option<Vec<u8>>,
}

/// Overlapping compression on a hardware accelerator.
///
/// # Write contract
/// Each [`write`](Self::write) runs two phases. Submission cuts the input
/// into `input_block` pieces and starts one job per piece on the slot at the
/// head of the ring. Draining then waits on the slot at the tail of the ring,
/// in submission order, frames its output, and writes it to the child. The
/// call returns only once every job it started has been written, so the ring
/// is empty between calls.
///
/// Draining waits on the tail slot even when a later slot has already
/// finished; output order is submission order. When the ring is full during
/// submission the tail slot is drained first, so a slot is never reused while
/// its previous job is in flight.
///
/// # Frame layout written per job
/// ```text
/// [HEADER: framing header, 20 bytes for gzip-extra]
/// [PAYLOAD: device output]
/// [TRAILER: framing trailer, empty for gzip-extra]
/// ```
pub struct PipelineAdapter<K: Sink> {
    child: K,
    slots: Vec<PipelineSlot>,
    head: usize,
    tail: usize,
    outstanding: usize,
    framing: Box<dyn Framing>,
    input_block: usize,
    wait_timeout: Duration,
    state: AdapterState,
    stats: StreamStats,
    closed: bool,
}

impl<K: Sink> PipelineAdapter<K> {
    /// Open `slots_per_channel` slots for every available channel of
    /// `device` and wrap `child`.
    ///
    /// Fails with [`StreamError::Resource`] when the device has no channels
    /// or a slot cannot be opened; slots opened so far are closed again and
    /// `child` is dropped without being closed.
    pub fn open(child: K, device: &dyn HardwareDevice, config: PipelineConfig) -> Result<Self, StreamError> {
        if config.input_block == 0 || config.slots_per_channel == 0 {
            return Err(StreamError::Resource(
                "input block and slots per channel must both be non-zero".into(),
            ));
        }
        let channels = device
            .channels_available()
            .map_err(|e| StreamError::Resource(format!("querying compression channels: {e}")))?;
        if channels == 0 {
            return Err(StreamError::Resource("no compression channels available".into()));
        }

        let framing = config.framing.build();
        let output_len = framing.header_len() + config.payload_capacity() + framing.trailer_len();
        let ring_len = channels * config.slots_per_channel;
        let mut slots: Vec<PipelineSlot> = Vec::with_capacity(ring_len);
        for i in 0..ring_len {
            match device.open_slot() {
                Ok(handle) => slots.push(PipelineSlot {
                    handle,
                    input: Some(vec![0u8; config.input_block]),
                    output: Some(vec![0u8; output_len]),
                }),
                Err(e) => {
                    error!("opening slot {} of {} failed: {}", i, ring_len, e);
                    for slot in &mut slots {
                        slot.handle.close();
                    }
                    return Err(StreamError::Resource(format!("opening slot {i} of {ring_len}: {e}")));
                }
            }
        }

        info!(
            "pipeline open: {} channels, {} slots, {}-byte blocks, framing={}",
            channels,
            ring_len,
            config.input_block,
            framing.name()
        );
        Ok(Self {
            child,
            slots,
            head: 0,
            tail: 0,
            outstanding: 0,
            framing,
            input_block: config.input_block,
            wait_timeout: config.wait_timeout(),
            state: AdapterState::Active,
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

    /// Ring size N.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Jobs submitted but not yet written to the child.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Compress and write all of `input`. Returns `input.len()` on success.
    pub fn write(&mut self, input: &[u8]) -> Result<usize, StreamError> {
        match self.state {
            AdapterState::Failed => return Err(StreamError::Terminated),
            AdapterState::EndOfStream => return Ok(0),
            AdapterState::Active => {}
        }
        if input.is_empty() {
            return Ok(0);
        }

        for chunk in input.chunks(self.input_block) {
            if self.outstanding == self.slots.len() {
                trace!("ring full, draining slot {} before reuse", self.tail);
                if let Err(e) = self.drain_one() {
                    return self.fail(e);
                }
            }
            if let Err(e) = self.submit(chunk) {
                return self.fail(e);
            }
        }
        while self.outstanding > 0 {
            if let Err(e) = self.drain_one() {
                return self.fail(e);
            }
        }
        Ok(input.len())
    }

    /// Start a job for `chunk` on the head slot.
    fn submit(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        let idx = self.head;
        let header_len = self.framing.header_len();
        let slot = &mut self.slots[idx];
        let mut input = slot.input.take().ok_or_else(|| HardwareError::Rejected {
            call: "add_input_buffer",
            reason: format!("slot {idx} input buffer is still held by the device"),
        })?;
        let output = slot.output.take().ok_or_else(|| HardwareError::Rejected {
            call: "add_output_buffer",
            reason: format!("slot {idx} output buffer is still held by the device"),
        })?;

        input[..chunk.len()].copy_from_slice(chunk);
        slot.handle.add_output_buffer(output, header_len)?;
        slot.handle
            .add_input_buffer(input, chunk.len(), JobFlags::FINISH | JobFlags::NO_HEADER)?;

        self.head = (self.head + 1) % self.slots.len();
        self.outstanding += 1;
        self.stats.raw_bytes += chunk.len() as u64;
        trace!("submitted {} bytes on slot {} ({} outstanding)", chunk.len(), idx, self.outstanding);
        Ok(())
    }

    /// Wait for the tail slot, frame its output, and write it downstream.
    fn drain_one(&mut self) -> Result<(), StreamError> {
        let idx = self.tail;
        let timeout = self.wait_timeout;
        let slot = &mut self.slots[idx];

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::Timeout { slot: idx, timeout });
            }
            match slot.handle.wait_status(deadline - now)? {
                SlotStatus::Complete => break,
                SlotStatus::InProgress | SlotStatus::Reclaiming => continue,
                SlotStatus::Failed(code) => return Err(HardwareError::JobFailed(code).into()),
            }
        }

        let produced = slot.handle.output_size()?;
        let (input, mut output) = slot.handle.reclaim_buffers()?;
        let header_len = self.framing.header_len();
        let trailer_len = self.framing.trailer_len();
        let frame_len = header_len + produced + trailer_len;
        if frame_len > output.len() {
            return Err(StreamError::Overflow {
                needed: frame_len,
                available: output.len(),
            });
        }
        {
            let (header, rest) = output.split_at_mut(header_len);
            let (payload, rest) = rest.split_at_mut(produced);
            self.framing.seal(header, payload, &mut rest[..trailer_len])?;
        }

        let written = self.child.write(&output[..frame_len])?;
        if written != frame_len {
            return Err(StreamError::ShortWrite {
                requested: frame_len,
                written,
            });
        }
        slot.handle.reinitialize()?;
        slot.input = Some(input);
        slot.output = Some(output);

        self.tail = (self.tail + 1) % self.slots.len();
        self.outstanding -= 1;
        self.stats.encoded_bytes += frame_len as u64;
        self.stats.frames += 1;
        trace!("drained slot {}: {}-byte frame ({} outstanding)", idx, frame_len, self.outstanding);
        Ok(())
    }

    fn fail(&mut self, err: StreamError) -> Result<usize, StreamError> {
        error!("pipeline write failed with {} jobs outstanding: {}", self.outstanding, err);
        self.state = AdapterState::Failed;
        Err(err)
    }

    /// Drain anything still outstanding, release every slot, and close the
    /// child.
    pub fn close(mut self) -> Result<StreamStats, StreamError> {
        self.shutdown()?;
        Ok(self.stats)
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut drained = Ok(());
        if self.state == AdapterState::Active {
            while self.outstanding > 0 {
                if let Err(e) = self.drain_one() {
                    error!("draining on close failed: {}", e);
                    self.state = AdapterState::Failed;
                    drained = Err(e);
                    break;
                }
            }
        } else if self.outstanding > 0 {
            warn!("abandoning {} outstanding jobs after failure", self.outstanding);
        }

        for slot in &mut self.slots {
            slot.handle.close();
        }
        let closed = self.child.close().map_err(StreamError::from);

        debug!(
            "pipeline close: raw={} encoded={} frames={} ratio={:.2}x",
            self.stats.raw_bytes,
            self.stats.encoded_bytes,
            self.stats.frames,
            self.stats.ratio()
        );
        drained.and(closed)
    }
}

impl<K: Sink> Drop for PipelineAdapter<K> {
    fn drop(&mut self) {
        if !self.closed {
            warn!("pipeline adapter dropped without close");
            let _ = self.shutdown();
        }
    }
}

impl<K: Sink> Sink for PipelineAdapter<K> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PipelineAdapter::write(self, buf).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown().map_err(io::Error::from)
    }
}

impl<K: Sink> io::Write for PipelineAdapter<K> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PipelineAdapter::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
