pub mod codec;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod format;
pub mod framing;
pub mod hardware;
pub mod pipeline;
pub mod reader;
pub mod staging;
pub mod stats;
pub mod writer;

pub use codec::Codec;
pub use endpoint::{IoSink, IoSource, Sink, Source};
pub use engine::{CodecEngine, EngineConfig};
pub use error::{AdapterState, StreamError};
pub use format::{BlockHeader, BLOCK_HEADER_SIZE};
pub use framing::{FrameHeader, Framing, FramingKind, GZIP_EXTRA_HEADER_SIZE};
pub use hardware::{HardwareDevice, HardwareError, HardwareSlot, JobFlags, SlotStatus};
pub use pipeline::{PipelineAdapter, PipelineConfig};
pub use reader::{DecodeAdapter, DecodeConfig};
pub use staging::StagingBuffer;
pub use stats::StreamStats;
pub use writer::{EncodeAdapter, EncodeConfig};
