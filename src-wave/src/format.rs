//! PCM format descriptor
//!
//! `WaveFormat` carries the channel count, sample rate and bit depth handed to
//! the driver at open time, plus the two derived fields the driver checks:
//! block alignment and average byte rate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::utils::sample_rate_label;

/// Format tag for integer PCM
pub const WAVE_FORMAT_PCM: u16 = 1;

pub const SPS_8KHZ: u32 = 8000;
pub const SPS_11KHZ: u32 = 11025;
pub const SPS_22KHZ: u32 = 22050;
pub const SPS_44KHZ: u32 = 44100;

/// Channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Channels {
    Mono = 1,
    Stereo = 2,
}

impl From<Channels> for u16 {
    fn from(channels: Channels) -> Self {
        channels as u16
    }
}

impl TryFrom<u16> for Channels {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            other => Err(format!("unsupported channel count {other}, expected 1 or 2")),
        }
    }
}

/// Sample bit depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum BitsPerSample {
    Eight = 8,
    Sixteen = 16,
}

impl From<BitsPerSample> for u16 {
    fn from(bits: BitsPerSample) -> Self {
        bits as u16
    }
}

impl TryFrom<u16> for BitsPerSample {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            other => Err(format!("unsupported bit depth {other}, expected 8 or 16")),
        }
    }
}

/// Immutable PCM format descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    block_align: u16,
    avg_bytes_per_sec: u32,
}

impl WaveFormat {
    /// Create a PCM descriptor from typed parameters
    pub fn new(channels: Channels, sample_rate: u32, bits_per_sample: BitsPerSample) -> Self {
        Self::pcm(channels.into(), sample_rate, bits_per_sample.into())
    }

    /// Create a PCM descriptor from raw values
    ///
    /// No validation happens here; the driver rejects unsupported
    /// combinations when the device is opened.
    pub fn pcm(channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        let block_align = channels.wrapping_mul(bits_per_sample) / 8;
        Self {
            format_tag: WAVE_FORMAT_PCM,
            channels,
            sample_rate,
            bits_per_sample,
            block_align,
            avg_bytes_per_sec: sample_rate.saturating_mul(u32::from(block_align)),
        }
    }

    pub fn format_tag(&self) -> u16 {
        self.format_tag
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    /// Bytes per frame: `channels * bits_per_sample / 8`
    pub fn block_align(&self) -> u16 {
        self.block_align
    }

    /// Bytes per second: `sample_rate * block_align`
    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.avg_bytes_per_sec
    }

    /// Byte length of a buffer holding `seconds` of audio
    ///
    /// Returns None when the length does not fit the driver's 32-bit length field.
    pub fn buffer_len(&self, seconds: u32) -> Option<usize> {
        let len = u64::from(self.sample_rate)
            .checked_mul(u64::from(self.block_align))?
            .checked_mul(u64::from(seconds))?;
        u32::try_from(len).ok().map(|len| len as usize)
    }

    /// Playback duration of `bytes` of audio in this format
    pub fn duration_of(&self, bytes: usize) -> Duration {
        if self.avg_bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / f64::from(self.avg_bytes_per_sec))
    }

    /// Whole frames of audio that fit in `duration`, in bytes
    pub fn bytes_in(&self, duration: Duration) -> usize {
        let bytes = (duration.as_secs_f64() * f64::from(self.avg_bytes_per_sec)) as usize;
        let frame = usize::from(self.block_align.max(1));
        bytes - bytes % frame
    }

    /// Whether the derived fields agree with the base fields
    pub fn is_consistent(&self) -> bool {
        u32::from(self.channels) * u32::from(self.bits_per_sample) / 8
            == u32::from(self.block_align)
            && u64::from(self.sample_rate) * u64::from(self.block_align)
                == u64::from(self.avg_bytes_per_sec)
    }
}

impl fmt::Display for WaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ch {} {}-bit",
            self.channels,
            sample_rate_label(self.sample_rate),
            self.bits_per_sample
        )
    }
}
