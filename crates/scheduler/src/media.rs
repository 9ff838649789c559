//! Media descriptor module
//!
//! Holds the immutable facts the scheduler needs about a probed source file.

use serde::Serialize;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

/// Widest frame that is encoded without downscaling.
pub const MAX_WIDTH: u32 = 1920;
/// Tallest frame that is encoded without downscaling.
pub const MAX_HEIGHT: u32 = 1080;

/// Frame dimensions in pixels. Both dimensions are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    width: NonZeroU32,
    height: NonZeroU32,
}

impl Resolution {
    /// `None` when either dimension is zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self::from_non_zero(
            NonZeroU32::new(width)?,
            NonZeroU32::new(height)?,
        ))
    }

    pub fn from_non_zero(width: NonZeroU32, height: NonZeroU32) -> Self {
        Self { width, height }
    }

    pub fn width(&self) -> u32 {
        self.width.get()
    }

    pub fn height(&self) -> u32 {
        self.height.get()
    }

    /// True when either dimension exceeds 1920x1080.
    pub fn exceeds_1080p(&self) -> bool {
        self.width() > MAX_WIDTH || self.height() > MAX_HEIGHT
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Converts a bits-per-second figure into whole kilobits per second.
///
/// Truncates, so 1999 b/s is 1 kb/s.
pub fn bps_to_kbps(bits_per_second: u64) -> u64 {
    bits_per_second / 1000
}

/// Probed metadata for one source file.
///
/// Fields are private so the downscale decision can only ever be derived from
/// the stored resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaDescriptor {
    path: PathBuf,
    resolution: Resolution,
    bitrate_kbps: u64,
    codec: String,
}

impl MediaDescriptor {
    pub fn new(
        path: impl Into<PathBuf>,
        resolution: Resolution,
        bitrate_kbps: u64,
        codec: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            resolution,
            bitrate_kbps,
            codec: codec.into(),
        }
    }

    /// Build a descriptor from the raw bits-per-second figure a prober reports.
    pub fn from_raw_bitrate(
        path: impl Into<PathBuf>,
        resolution: Resolution,
        bit_rate_bps: u64,
        codec: impl Into<String>,
    ) -> Self {
        Self::new(path, resolution, bps_to_kbps(bit_rate_bps), codec)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn bitrate_kbps(&self) -> u64 {
        self.bitrate_kbps
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn needs_downscale(&self) -> bool {
        self.resolution.exceeds_1080p()
    }
}
