//! Frames and their fixed geometry

use crate::error::{FrameBusError, Result};
use std::fmt;

/// Largest frame a channel accepts (8K, four channels)
pub const MAX_FRAME_BYTES: usize = 7680 * 4320 * 4;

/// Pixel dimensions shared by every channel of a pipeline
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel (3 for BGR)
    pub channels: u32,
}

impl FrameGeometry {
    /// 640x480 BGR
    pub const VGA_BGR: FrameGeometry = FrameGeometry::new(640, 480, 3);

    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Size of one frame in bytes
    #[inline]
    pub const fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// Bytes per row
    #[inline]
    pub const fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Reject zero dimensions and frames larger than [`MAX_FRAME_BYTES`]
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.channels == 0 {
            return Err(FrameBusError::InvalidGeometry(format!(
                "{} has a zero dimension",
                self
            )));
        }
        // Checked in u128 so huge dimensions cannot wrap
        let len = self.width as u128 * self.height as u128 * self.channels as u128;
        if len > MAX_FRAME_BYTES as u128 {
            return Err(FrameBusError::InvalidGeometry(format!(
                "{} needs {} bytes, max {}",
                self, len, MAX_FRAME_BYTES
            )));
        }
        Ok(())
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::VGA_BGR
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// A process-local pixel buffer
///
/// Frames cross the process boundary by value only: `publish` copies the
/// bytes into the channel slot and `consume` copies them back out.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    geometry: FrameGeometry,
    sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    /// A black frame
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            sequence: 0,
            data: vec![0; geometry.frame_len()],
        }
    }

    /// Wrap existing pixel bytes; the length must match the geometry
    pub fn from_bytes(geometry: FrameGeometry, data: Vec<u8>) -> Result<Self> {
        if data.len() != geometry.frame_len() {
            return Err(FrameBusError::GeometryMismatch {
                expected: format!("{} ({} bytes)", geometry, geometry.frame_len()),
                got: format!("{} bytes", data.len()),
            });
        }
        Ok(Self {
            geometry,
            sequence: 0,
            data,
        })
    }

    #[inline]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Sequence number assigned by the producer, 0 if never published
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes of the pixel at (`x`, `y`), or `None` outside the frame
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.geometry.width || y >= self.geometry.height {
            return None;
        }
        let channels = self.geometry.channels as usize;
        let offset = y as usize * self.geometry.stride() + x as usize * channels;
        Some(&self.data[offset..offset + channels])
    }

    /// Mutable bytes of the pixel at (`x`, `y`)
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> Option<&mut [u8]> {
        if x >= self.geometry.width || y >= self.geometry.height {
            return None;
        }
        let channels = self.geometry.channels as usize;
        let offset = y as usize * self.geometry.stride() + x as usize * channels;
        Some(&mut self.data[offset..offset + channels])
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("geometry", &self.geometry)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}
