//! Call contract for compression accelerators.
//!
//! A device exposes some number of independent channels. The pipeline opens
//! several slots per channel and keeps them all busy. Buffers are handed to a
//! slot by value for the lifetime of a job and reclaimed once the job has
//! completed, so the hardware never writes into memory the adapter can still
//! touch.

use std::time::Duration;

use thiserror::Error;

/// Driver-level failure.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("device not available: {0}")]
    Unavailable(String),

    #[error("slot rejected {call}: {reason}")]
    Rejected { call: &'static str, reason: String },

    #[error("job failed with status {0:#06x}")]
    JobFailed(u32),

    #[error("slot has no completed job to {0}")]
    NotComplete(&'static str),
}

bitflags::bitflags! {
    /// Per-job options passed with the input buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobFlags: u8 {
        /// The input is a complete stream: emit the end-of-stream marker and
        /// trailer.
        const FINISH = 1 << 0;
        /// Leave the container header out; the caller writes its own in the
        /// reserved region before the output offset.
        const NO_HEADER = 1 << 1;
    }
}

/// Result of one bounded wait on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// The job is still running; the wait bound elapsed.
    InProgress,
    /// The driver is reclaiming buffers; wait again.
    Reclaiming,
    /// Output is ready; query [`HardwareSlot::output_size`].
    Complete,
    /// The job failed with a driver status code.
    Failed(u32),
}

/// One accelerator.
pub trait HardwareDevice {
    /// Number of compression channels currently usable.
    fn channels_available(&self) -> Result<usize, HardwareError>;

    /// Open one job slot.
    fn open_slot(&self) -> Result<Box<dyn HardwareSlot>, HardwareError>;
}

/// One job slot on a device.
///
/// Call order per job: `add_output_buffer`, `add_input_buffer` (starts the
/// job), `wait_status` until `Complete`, `output_size`, `reclaim_buffers`,
/// `reinitialize`.
pub trait HardwareSlot: Send {
    /// Register the output buffer; the device writes starting at `offset`.
    fn add_output_buffer(&mut self, buf: Vec<u8>, offset: usize) -> Result<(), HardwareError>;

    /// Hand over the first `len` bytes of `buf` as input and start the job.
    fn add_input_buffer(&mut self, buf: Vec<u8>, len: usize, flags: JobFlags) -> Result<(), HardwareError>;

    /// Block for at most `timeout` waiting for the job.
    fn wait_status(&mut self, timeout: Duration) -> Result<SlotStatus, HardwareError>;

    /// Bytes the completed job wrote after the output offset.
    fn output_size(&self) -> Result<usize, HardwareError>;

    /// Take back `(input, output)` after completion.
    fn reclaim_buffers(&mut self) -> Result<(Vec<u8>, Vec<u8>), HardwareError>;

    /// Reset the slot so it can accept a new job.
    fn reinitialize(&mut self) -> Result<(), HardwareError>;

    /// Release the slot. Any running job is abandoned.
    fn close(&mut self);
}
