use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::hardware::HardwareError;

/// Everything an adapter can report.
///
/// Clean end-of-stream is not an error: `read` returns `Ok(0)`. Every variant
/// here is terminal for the adapter that produced it; after the first error
/// the adapter answers all further calls with [`StreamError::Terminated`].
#[derive(Debug, Error)]
pub enum StreamError {
    /// The wrapped endpoint failed.
    #[error("endpoint I/O error: {0}")]
    Io(#[from] io::Error),

    /// The wrapped sink accepted fewer bytes than were offered in one call.
    #[error("short write: endpoint accepted {written} of {requested} bytes")]
    ShortWrite { requested: usize, written: usize },

    /// The codec signalled a failure while encoding or decoding a block.
    #[error("codec failure: {0:#}")]
    Codec(anyhow::Error),

    /// An encoded block does not fit its destination region.
    #[error("overflow: {needed} bytes needed but only {available} available")]
    Overflow { needed: usize, available: usize },

    /// Not enough channels, slots, or memory to set up the adapter.
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// The hardware did not complete a slot within the configured bound.
    #[error("hardware slot {slot} did not complete within {timeout:?}")]
    Timeout { slot: usize, timeout: Duration },

    /// The hardware driver rejected a call or reported a job failure.
    #[error("hardware failure: {0}")]
    Hardware(#[from] HardwareError),

    /// Received bytes do not form a valid frame or block.
    #[error("corrupt stream: {0}")]
    Corrupt(String),

    /// The adapter already failed; no further work is attempted.
    #[error("adapter is in a failed state")]
    Terminated,
}

impl StreamError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StreamError::Corrupt(msg.into())
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::ShortWrite { .. } => io::Error::new(io::ErrorKind::WriteZero, err),
            StreamError::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            StreamError::Corrupt(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Lifecycle of every adapter. `EndOfStream` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Active,
    EndOfStream,
    Failed,
}

impl AdapterState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, AdapterState::Active)
    }
}
