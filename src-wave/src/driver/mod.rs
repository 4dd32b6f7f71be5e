//! Driver seam
//!
//! A `WaveDriver` enumerates and opens devices; a `WaveDevice` is one open
//! handle. Engines only talk to these traits. Every backend reports
//! completions by calling into `crate::bridge` with the instance token it
//! was given at open time and the token of the finished buffer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::audio_buffer::WaveBuffer;
use crate::format::WaveFormat;
use crate::Result;

pub mod loopback;
#[cfg(windows)]
pub mod winmm;

/// Device id selecting the first device able to handle the format
pub const WAVE_MAPPER: u32 = u32::MAX;

// Standard format bits of a device record
pub const WAVE_FORMAT_1M08: u32 = 0x0000_0001;
pub const WAVE_FORMAT_1S08: u32 = 0x0000_0002;
pub const WAVE_FORMAT_1M16: u32 = 0x0000_0004;
pub const WAVE_FORMAT_1S16: u32 = 0x0000_0008;
pub const WAVE_FORMAT_2M08: u32 = 0x0000_0010;
pub const WAVE_FORMAT_2S08: u32 = 0x0000_0020;
pub const WAVE_FORMAT_2M16: u32 = 0x0000_0040;
pub const WAVE_FORMAT_2S16: u32 = 0x0000_0080;
pub const WAVE_FORMAT_4M08: u32 = 0x0000_0100;
pub const WAVE_FORMAT_4S08: u32 = 0x0000_0200;
pub const WAVE_FORMAT_4M16: u32 = 0x0000_0400;
pub const WAVE_FORMAT_4S16: u32 = 0x0000_0800;

// Optional output features of a device record
pub const WAVECAPS_PITCH: u32 = 0x0001;
pub const WAVECAPS_PLAYBACKRATE: u32 = 0x0002;
pub const WAVECAPS_VOLUME: u32 = 0x0004;
pub const WAVECAPS_LRVOLUME: u32 = 0x0008;
pub const WAVECAPS_SYNC: u32 = 0x0010;
pub const WAVECAPS_SAMPLEACCURATE: u32 = 0x0020;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Output,
    Input,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Output => write!(f, "output"),
            Direction::Input => write!(f, "input"),
        }
    }
}

/// Capabilities of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Enumeration index, usable as the open id
    pub id: u32,
    pub name: String,
    pub manufacturer_id: u16,
    pub product_id: u16,
    pub driver_version: u32,
    /// `WAVE_FORMAT_*` bitmask
    pub formats: u32,
    pub channels: u16,
    /// `WAVECAPS_*` bitmask, output devices only
    pub support: u32,
}

impl DeviceRecord {
    /// Driver version as "major.minor"
    pub fn version_label(&self) -> String {
        format!("{}.{}", self.driver_version >> 8, self.driver_version & 0xFF)
    }

    pub fn supports(&self, feature: u32) -> bool {
        self.support & feature == feature
    }
}

/// A wave audio subsystem
pub trait WaveDriver: Send + Sync {
    fn name(&self) -> &str;

    fn device_count(&self, direction: Direction) -> u32;

    fn device_caps(&self, direction: Direction, id: u32) -> Result<DeviceRecord>;

    /// Open device `id` (or `WAVE_MAPPER`)
    ///
    /// `instance` is the token handed back with every notification. The
    /// Opened notification is delivered before this returns.
    fn open(
        &self,
        direction: Direction,
        id: u32,
        format: &WaveFormat,
        instance: usize,
    ) -> Result<Box<dyn WaveDevice>>;

    /// Diagnostic text for a driver status code
    fn error_text(&self, direction: Direction, code: u32) -> String;
}

/// An open device handle
///
/// Buffers passed to `submit` are already Queued; the driver reports each one
/// back exactly once, through the bridge, in submission order.
pub trait WaveDevice: Send {
    fn prepare(&mut self, buffer: &WaveBuffer) -> Result<()>;

    fn unprepare(&mut self, buffer: &WaveBuffer) -> Result<()>;

    fn submit(&mut self, buffer: &WaveBuffer) -> Result<()>;

    /// Output: restart after a pause. Input: begin recording.
    fn start(&mut self) -> Result<()>;

    /// Output: pause, holding the buffer being played. Input: stop recording
    /// and hand back the buffer being filled with what it holds so far.
    fn stop(&mut self) -> Result<()>;

    /// Stop and return every pending buffer as done
    fn reset(&mut self) -> Result<()>;

    fn set_volume(&mut self, volume: u32) -> Result<()>;

    fn volume(&self) -> Result<u32>;

    /// Pitch multiplier in 16.16 fixed point
    fn set_pitch(&mut self, pitch: u32) -> Result<()>;

    fn pitch(&self) -> Result<u32>;

    /// Release the handle; the Closed notification is delivered before this returns
    fn close(&mut self) -> Result<()>;
}

/// Driver for this platform
///
/// WinMM on Windows, the in-process loopback driver everywhere else.
pub fn create_driver() -> Arc<dyn WaveDriver> {
    #[cfg(windows)]
    {
        Arc::new(winmm::WinmmDriver::new())
    }
    #[cfg(not(windows))]
    {
        Arc::new(loopback::LoopbackDriver::new(
            loopback::LoopbackConfig::default(),
        ))
    }
}
