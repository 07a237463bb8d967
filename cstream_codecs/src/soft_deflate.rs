use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use cstream_core::hardware::{HardwareDevice, HardwareError, HardwareSlot, JobFlags, SlotStatus};
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use log::trace;

/// Job status: the output buffer was too small.
pub const STATUS_OUTPUT_FULL: u32 = 0x8001;
/// Job status: the deflate backend reported an error.
pub const STATUS_DEFLATE_ERROR: u32 = 0x8002;
/// Job status: the worker went away without reporting.
pub const STATUS_WORKER_LOST: u32 = 0x8003;

/// Standard 10-byte gzip header written when a job does not ask for
/// [`JobFlags::NO_HEADER`].
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

/// Software stand-in for a deflate accelerator.
///
/// Every job runs on its own worker thread, so jobs overlap and may finish in
/// any order, just like on real hardware. The output is a gzip member body:
/// raw deflate followed by the CRC-32 and input size trailer when the job has
/// [`JobFlags::FINISH`].
pub struct SoftDeflateDevice {
    channels: usize,
    level: u32,
}

impl SoftDeflateDevice {
    pub fn new(channels: usize) -> Self {
        Self { channels, level: 6 }
    }

    /// Deflate level 0..=9 used by every slot.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }
}

impl HardwareDevice for SoftDeflateDevice {
    fn channels_available(&self) -> Result<usize, HardwareError> {
        Ok(self.channels)
    }

    fn open_slot(&self) -> Result<Box<dyn HardwareSlot>, HardwareError> {
        Ok(Box::new(SoftDeflateSlot {
            level: self.level,
            phase: Phase::Idle,
        }))
    }
}

struct JobResult {
    input: Vec<u8>,
    output: Vec<u8>,
    outcome: Result<usize, u32>,
}

impl JobResult {
    fn status(&self) -> SlotStatus {
        match self.outcome {
            Ok(_) => SlotStatus::Complete,
            Err(code) => SlotStatus::Failed(code),
        }
    }
}

enum Phase {
    Idle,
    Armed { output: Vec<u8>, offset: usize },
    Running(Receiver<JobResult>),
    Done(JobResult),
    Reclaimed,
}

struct SoftDeflateSlot {
    level: u32,
    phase: Phase,
}

impl HardwareSlot for SoftDeflateSlot {
    fn add_output_buffer(&mut self, buf: Vec<u8>, offset: usize) -> Result<(), HardwareError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(HardwareError::Rejected {
                call: "add_output_buffer",
                reason: "slot is busy".into(),
            });
        }
        if offset > buf.len() {
            return Err(HardwareError::Rejected {
                call: "add_output_buffer",
                reason: format!("offset {} is past the {}-byte buffer", offset, buf.len()),
            });
        }
        self.phase = Phase::Armed { output: buf, offset };
        Ok(())
    }

    fn add_input_buffer(&mut self, buf: Vec<u8>, len: usize, flags: JobFlags) -> Result<(), HardwareError> {
        if len > buf.len() {
            return Err(HardwareError::Rejected {
                call: "add_input_buffer",
                reason: format!("length {} exceeds the {}-byte buffer", len, buf.len()),
            });
        }
        let (output, offset) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Armed { output, offset } => (output, offset),
            other => {
                self.phase = other;
                return Err(HardwareError::Rejected {
                    call: "add_input_buffer",
                    reason: "no output buffer registered".into(),
                });
            }
        };

        let level = self.level;
        let (tx, rx) = channel::bounded(1);
        thread::Builder::new()
            .name("soft-deflate".into())
            .spawn(move || {
                let mut output = output;
                let outcome = deflate_job(level, &buf[..len], &mut output[offset..], flags);
                let _ = tx.send(JobResult {
                    input: buf,
                    output,
                    outcome,
                });
            })
            .map_err(|e| HardwareError::Rejected {
                call: "add_input_buffer",
                reason: format!("spawning worker: {e}"),
            })?;
        self.phase = Phase::Running(rx);
        Ok(())
    }

    fn wait_status(&mut self, timeout: Duration) -> Result<SlotStatus, HardwareError> {
        let received = match &self.phase {
            Phase::Running(rx) => rx.recv_timeout(timeout),
            Phase::Done(result) => return Ok(result.status()),
            _ => return Err(HardwareError::NotComplete("wait on")),
        };
        match received {
            Ok(result) => {
                let status = result.status();
                trace!("soft deflate job finished: {:?}", status);
                self.phase = Phase::Done(result);
                Ok(status)
            }
            Err(RecvTimeoutError::Timeout) => Ok(SlotStatus::InProgress),
            Err(RecvTimeoutError::Disconnected) => {
                self.phase = Phase::Idle;
                Err(HardwareError::JobFailed(STATUS_WORKER_LOST))
            }
        }
    }

    fn output_size(&self) -> Result<usize, HardwareError> {
        match &self.phase {
            Phase::Done(JobResult { outcome: Ok(n), .. }) => Ok(*n),
            _ => Err(HardwareError::NotComplete("report output size of")),
        }
    }

    fn reclaim_buffers(&mut self) -> Result<(Vec<u8>, Vec<u8>), HardwareError> {
        match std::mem::replace(&mut self.phase, Phase::Reclaimed) {
            Phase::Done(result) => Ok((result.input, result.output)),
            other => {
                self.phase = other;
                Err(HardwareError::NotComplete("reclaim buffers from"))
            }
        }
    }

    fn reinitialize(&mut self) -> Result<(), HardwareError> {
        if matches!(self.phase, Phase::Running(_)) {
            return Err(HardwareError::Rejected {
                call: "reinitialize",
                reason: "job still running".into(),
            });
        }
        self.phase = Phase::Idle;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the receiver detaches a running worker; its send fails.
        self.phase = Phase::Idle;
    }
}

/// Compress `input` into `out`, returning the bytes written.
fn deflate_job(level: u32, input: &[u8], out: &mut [u8], flags: JobFlags) -> Result<usize, u32> {
    let mut pos = 0;
    if !flags.contains(JobFlags::NO_HEADER) {
        if out.len() < GZIP_HEADER.len() {
            return Err(STATUS_OUTPUT_FULL);
        }
        out[..GZIP_HEADER.len()].copy_from_slice(&GZIP_HEADER);
        pos = GZIP_HEADER.len();
    }

    let finish = flags.contains(JobFlags::FINISH);
    let mut deflater = Compress::new(Compression::new(level), false);
    let flush = if finish { FlushCompress::Finish } else { FlushCompress::Full };
    let status = deflater
        .compress(input, &mut out[pos..], flush)
        .map_err(|_| STATUS_DEFLATE_ERROR)?;
    if deflater.total_in() as usize != input.len() || (finish && status != Status::StreamEnd) {
        return Err(STATUS_OUTPUT_FULL);
    }
    pos += deflater.total_out() as usize;

    if finish {
        if out.len() < pos + 8 {
            return Err(STATUS_OUTPUT_FULL);
        }
        let mut crc = Crc::new();
        crc.update(input);
        out[pos..pos + 4].copy_from_slice(&crc.sum().to_le_bytes());
        out[pos + 4..pos + 8].copy_from_slice(&(input.len() as u32).to_le_bytes());
        pos += 8;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn run(slot: &mut dyn HardwareSlot, input: &[u8], offset: usize, flags: JobFlags) -> (Vec<u8>, usize) {
        slot.add_output_buffer(vec![0u8; offset + input.len() + 1024], offset).unwrap();
        slot.add_input_buffer(input.to_vec(), input.len(), flags).unwrap();
        loop {
            match slot.wait_status(Duration::from_secs(5)).unwrap() {
                SlotStatus::Complete => break,
                SlotStatus::InProgress | SlotStatus::Reclaiming => continue,
                SlotStatus::Failed(code) => panic!("job failed: {code:#x}"),
            }
        }
        let n = slot.output_size().unwrap();
        let (_, output) = slot.reclaim_buffers().unwrap();
        slot.reinitialize().unwrap();
        (output, n)
    }

    #[test]
    fn test_full_member_is_plain_gzip() {
        let device = SoftDeflateDevice::new(1);
        let mut slot = device.open_slot().unwrap();
        let input = b"hello hello hello hello accelerator".repeat(20);
        let (output, n) = run(slot.as_mut(), &input, 0, JobFlags::FINISH);

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&output[..n]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_headerless_job_leaves_reserved_region() {
        let device = SoftDeflateDevice::new(1);
        let mut slot = device.open_slot().unwrap();
        let input = vec![42u8; 5000];
        let (output, n) = run(slot.as_mut(), &input, 20, JobFlags::FINISH | JobFlags::NO_HEADER);
        assert!(output[..20].iter().all(|&b| b == 0));
        assert!(n < input.len());

        // slot is reusable after reinitialize
        let (_, again) = run(slot.as_mut(), &input, 20, JobFlags::FINISH | JobFlags::NO_HEADER);
        assert_eq!(again, n);
    }

    #[test]
    fn test_small_output_reports_failure() {
        let device = SoftDeflateDevice::new(1);
        let mut slot = device.open_slot().unwrap();
        let input: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        slot.add_output_buffer(vec![0u8; 64], 0).unwrap();
        slot.add_input_buffer(input.clone(), input.len(), JobFlags::FINISH).unwrap();
        let status = loop {
            match slot.wait_status(Duration::from_secs(5)).unwrap() {
                SlotStatus::InProgress => continue,
                other => break other,
            }
        };
        assert_eq!(status, SlotStatus::Failed(STATUS_OUTPUT_FULL));
        assert!(slot.output_size().is_err());
    }

    #[test]
    fn test_input_without_output_is_rejected() {
        let device = SoftDeflateDevice::new(2);
        assert_eq!(device.channels_available().unwrap(), 2);
        let mut slot = device.open_slot().unwrap();
        let err = slot.add_input_buffer(vec![1, 2, 3], 3, JobFlags::FINISH).unwrap_err();
        assert!(matches!(err, HardwareError::Rejected { .. }));
    }
}
