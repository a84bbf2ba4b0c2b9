//! FrameBus - shared memory frame exchange between processes
//!
//! One producer process publishes full video frames into a named shared
//! memory channel; every registered consumer process reads each frame
//! exactly once before the producer may overwrite it.
//!
//! # Architecture
//!
//! - **Producer (creator)**: creates the channel, publishes frames, removes it on exit
//! - **Consumers (openers)**: attach, claim a consumer index, read every frame once
//!
//! A channel holds a single frame slot guarded by a process-shared mutex
//! and two condition variables (`frame_ready`, `frame_done`). The producer
//! blocks until all consumers drained the previous frame, so the pipeline
//! always works on the freshest frame without queueing.

pub mod error;
pub mod shm;
pub mod sync;
pub mod layout;
pub mod frame;
pub mod wait;
pub mod bus;
pub mod channel;
pub mod config;
pub mod rate;
pub mod stage;

pub use error::{FrameBusError, Result};
pub use bus::BusState;
pub use channel::{ChannelConfig, ConsumerChannel, ProducerChannel, Registration};
pub use frame::{Frame, FrameGeometry};
pub use rate::FrameRater;
pub use stage::{FrameSink, FrameSource, FrameTransform, SinkStage, SourceStage, StageReport, TransformStage};
pub use wait::{StopSignal, WaitPolicy};
