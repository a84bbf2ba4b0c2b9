//! Error types for FrameBus

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for FrameBus operations
pub type Result<T> = std::result::Result<T, FrameBusError>;

/// Errors that can occur in FrameBus operations
#[derive(Debug, Error)]
pub enum FrameBusError {
    /// Channel name cannot be used as a shared memory name
    #[error("Invalid channel name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// A process-shared lock or condition call failed
    #[error("{op} failed: {source}")]
    Sync {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Segment exists but its creator has not finished initializing it
    #[error("Channel '{name}' is not ready yet")]
    NotReady { name: String },

    /// Invalid channel magic number
    #[error("Invalid channel magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Layout version written by the creator is not understood
    #[error("Unsupported layout version: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// Mapped segment size differs from the expected layout size
    #[error("Segment size mismatch: expected {expected} bytes, got {got} bytes")]
    SizeMismatch { expected: usize, got: usize },

    /// Frame or channel geometry disagree
    #[error("Frame geometry mismatch: expected {expected}, got {got}")]
    GeometryMismatch { expected: String, got: String },

    /// Geometry with a zero dimension or an oversized frame
    #[error("Invalid frame geometry: {0}")]
    InvalidGeometry(String),

    /// More consumers requested than the layout can hold
    #[error("Too many consumers: max {max}, got {got}")]
    TooManyConsumers { max: usize, got: usize },

    /// Consumer index outside the channel's registered range
    #[error("Invalid consumer index {index}: channel has {consumers} consumers")]
    InvalidConsumerIndex { index: usize, consumers: usize },

    /// Consumer index already claimed by a live process
    #[error("Consumer index {index} is held by process {owner}")]
    ConsumerIndexInUse { index: usize, owner: u32 },

    /// Every consumer index of the channel is claimed
    #[error("No free consumer slot: all {consumers} are claimed")]
    NoFreeConsumerSlot { consumers: usize },

    /// Producer could not install a frame because consumers did not drain the previous one
    #[error("Producer stalled for {waited:?}: consumers {pending:?} have not read the current frame")]
    Stalled { pending: Vec<usize>, waited: Duration },

    /// Consumer waited longer than its configured limit for a new frame
    #[error("No new frame after {waited:?}")]
    Timeout { waited: Duration },

    /// Wait interrupted by a stop request
    #[error("Wait cancelled by stop request")]
    Cancelled,

    /// Producer tore down the channel
    #[error("Channel closed by producer")]
    Closed,

    /// External frame source failed
    ///
    /// Raised by [`FrameSource`](crate::FrameSource) implementations, e.g. a
    /// camera that stopped delivering; stages propagate it as fatal.
    #[error("Frame source failed: {0}")]
    Source(String),

    /// External frame sink failed
    ///
    /// Raised by [`FrameSink`](crate::FrameSink) implementations, e.g. a
    /// display that could not be opened.
    #[error("Frame sink failed: {0}")]
    Sink(String),
}

impl FrameBusError {
    /// Whether an opener should retry attaching after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            FrameBusError::ShmOpen { source, .. } => source.kind() == io::ErrorKind::NotFound,
            FrameBusError::NotReady { .. } | FrameBusError::Closed => true,
            _ => false,
        }
    }

    /// Whether this error means the stage was asked to stop rather than failed
    pub fn is_shutdown(&self) -> bool {
        matches!(self, FrameBusError::Cancelled | FrameBusError::Closed)
    }
}
