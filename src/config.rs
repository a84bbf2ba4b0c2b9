//! Channel names and consumer indices of the capture pipeline
//!
//! ```text
//! capture ──OriginalFrame──┬─ index 0 ─> circle detection ──CircleDetectionFrame──┐
//!                          ├─ index 1 ─> optical flow ──────OpticalFlowFrame──────┤
//!                          └─ index 2 ─────────────────────────────────────────> viewer
//! ```

use crate::channel::ChannelConfig;
use crate::frame::FrameGeometry;

/// Raw camera frames
pub const RAW_CHANNEL: &str = "OriginalFrame";
/// Circle detection output
pub const CIRCLE_CHANNEL: &str = "CircleDetectionFrame";
/// Optical flow output
pub const FLOW_CHANNEL: &str = "OpticalFlowFrame";

/// Frame geometry shared by every channel
pub const PIPELINE_GEOMETRY: FrameGeometry = FrameGeometry::VGA_BGR;

/// Consumers of the raw channel
pub const RAW_CONSUMERS: usize = 3;
pub const CIRCLE_DETECT_INDEX: usize = 0;
pub const OPTICAL_FLOW_INDEX: usize = 1;
pub const VIEWER_INDEX: usize = 2;

/// Consumers of each transform output (the viewer)
pub const TRANSFORM_CONSUMERS: usize = 1;

/// Config for [`RAW_CHANNEL`]
pub fn raw_channel_config() -> ChannelConfig {
    ChannelConfig::default()
        .with_geometry(PIPELINE_GEOMETRY)
        .with_consumers(RAW_CONSUMERS)
}

/// Config for [`CIRCLE_CHANNEL`] and [`FLOW_CHANNEL`]
pub fn transform_channel_config() -> ChannelConfig {
    ChannelConfig::default()
        .with_geometry(PIPELINE_GEOMETRY)
        .with_consumers(TRANSFORM_CONSUMERS)
}
