//! Output engine
//!
//! Plays one buffer at a time: prepare it, `write` it, wait for its
//! completion event, then write it again or unprepare it.

use std::sync::Arc;

use crate::audio_buffer::{BufferState, WaveBuffer};
use crate::driver::{Direction, WaveDriver};
use crate::engine::EngineCore;
use crate::events::EventStream;
use crate::format::WaveFormat;
use crate::utils::{
    fixed_to_pitch, pack_volume, pitch_to_fixed, unpack_volume, MMSYSERR_INVALPARAM,
};
use crate::Result;

/// Playback engine with a single buffer slot
pub struct WaveOut {
    core: EngineCore,
    slot: Option<WaveBuffer>,
}

impl WaveOut {
    pub fn new(driver: Arc<dyn WaveDriver>) -> Self {
        Self {
            core: EngineCore::new(driver, Direction::Output),
            slot: None,
        }
    }

    /// Open output device `device_id` (or `WAVE_MAPPER`) with `format`
    pub fn open(&mut self, device_id: u32, format: &WaveFormat) -> Result<()> {
        self.core.open(device_id, format)
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn format(&self) -> Option<WaveFormat> {
        self.core.format()
    }

    /// Completion events; already ended when the engine is not open
    pub fn events(&self) -> EventStream {
        self.core.events()
    }

    /// Number of buffers the driver has handed back since creation
    pub fn completions(&self) -> u64 {
        self.core.completions()
    }

    /// Register `buffer` with the device and place it in the slot
    ///
    /// # Panics
    /// If the slot already holds a buffer.
    pub fn prepare_buffer(&mut self, buffer: WaveBuffer) -> Result<()> {
        if let Some(current) = &self.slot {
            panic!("output engine already holds {}", current.id());
        }
        self.core.prepare(&buffer)?;
        self.slot = Some(buffer);
        Ok(())
    }

    /// Queue the slot buffer for playback
    ///
    /// # Panics
    /// If the slot is empty, or its buffer is neither Prepared nor Completed.
    pub fn write(&mut self) -> Result<()> {
        let buffer = match &self.slot {
            Some(buffer) => buffer.clone(),
            None => panic!("write with no prepared output buffer"),
        };
        self.core.submit(&buffer)
    }

    /// Unregister the slot buffer and hand it back
    ///
    /// Fails with `WAVERR_STILLPLAYING` while the buffer is queued.
    pub fn unprepare_buffer(&mut self) -> Result<WaveBuffer> {
        let buffer = match &self.slot {
            Some(buffer) => buffer.clone(),
            None => panic!("unprepare with no prepared output buffer"),
        };
        self.core.unprepare(&buffer)?;
        self.slot = None;
        Ok(buffer)
    }

    pub fn buffer(&self) -> Option<&WaveBuffer> {
        self.slot.as_ref()
    }

    pub fn is_queued(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|buffer| buffer.state() == BufferState::Queued)
    }

    /// Set the per-channel volume, 0 is silence and 0xFFFF full volume
    pub fn set_volume(&mut self, left: u16, right: u16) -> Result<()> {
        self.core.set_volume(pack_volume(left, right))
    }

    /// Current (left, right) volume
    pub fn volume(&self) -> Result<(u16, u16)> {
        self.core.volume().map(unpack_volume)
    }

    /// Set the pitch multiplier, 1.0 is unchanged
    pub fn set_pitch(&mut self, multiplier: f64) -> Result<()> {
        let pitch = pitch_to_fixed(multiplier).ok_or_else(|| self.core.status(MMSYSERR_INVALPARAM))?;
        self.core.set_pitch(pitch)
    }

    /// Current pitch multiplier
    pub fn pitch(&self) -> Result<f64> {
        self.core.pitch().map(fixed_to_pitch)
    }

    pub fn pause(&mut self) -> Result<()> {
        self.core.stop()
    }

    pub fn restart(&mut self) -> Result<()> {
        self.core.start()
    }

    /// Stop playback; a queued buffer comes back as a completion event
    pub fn reset(&mut self) -> Result<()> {
        self.core.reset()
    }

    /// Close the device
    ///
    /// # Panics
    /// If a buffer is still prepared.
    pub fn close(&mut self) -> Result<()> {
        if let Some(buffer) = &self.slot {
            panic!("output engine closed with {} still prepared", buffer.id());
        }
        self.core.close()
    }
}

impl std::fmt::Debug for WaveOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveOut")
            .field("open", &self.is_open())
            .field("format", &self.format())
            .field("slot", &self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::loopback::{LoopbackConfig, LoopbackDriver};
    use crate::format::{BitsPerSample, Channels, SPS_8KHZ};
    use crate::utils::MMSYSERR_NOTSUPPORTED;

    fn open_engine(config: LoopbackConfig) -> WaveOut {
        let mut out = WaveOut::new(Arc::new(LoopbackDriver::new(config)));
        let format = WaveFormat::new(Channels::Mono, SPS_8KHZ, BitsPerSample::Eight);
        out.open(0, &format).unwrap();
        out
    }

    #[test]
    fn test_volume_round_trip() {
        let mut out = open_engine(LoopbackConfig::default());
        out.set_volume(0x1000, 0xF000).unwrap();
        assert_eq!(out.volume().unwrap(), (0x1000, 0xF000));
        out.close().unwrap();
    }

    #[test]
    fn test_pitch_validation() {
        let mut out = open_engine(LoopbackConfig::default());
        let err = out.set_pitch(-2.0).unwrap_err();
        assert_eq!(err.device_code(), Some(MMSYSERR_INVALPARAM));
        let err = out.set_pitch(1.5).unwrap_err();
        assert_eq!(err.device_code(), Some(MMSYSERR_NOTSUPPORTED));
        assert!(out.pitch().is_err());
        out.close().unwrap();

        let mut out = open_engine(LoopbackConfig {
            supports_pitch: true,
            ..LoopbackConfig::default()
        });
        assert_eq!(out.pitch().unwrap(), 1.0);
        out.set_pitch(1.5).unwrap();
        assert_eq!(out.pitch().unwrap(), 1.5);
        out.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn test_second_buffer_in_slot_panics() {
        let mut out = open_engine(LoopbackConfig::default());
        out.prepare_buffer(WaveBuffer::with_len(8).unwrap()).unwrap();
        let _ = out.prepare_buffer(WaveBuffer::with_len(8).unwrap());
    }

    #[test]
    #[should_panic(expected = "no prepared output buffer")]
    fn test_write_without_buffer_panics() {
        let mut out = open_engine(LoopbackConfig::default());
        let _ = out.write();
    }

    #[test]
    fn test_is_queued_reflects_slot() {
        let mut out = open_engine(LoopbackConfig::default());
        assert!(!out.is_queued());
        assert!(out.buffer().is_none());

        out.prepare_buffer(WaveBuffer::with_len(8).unwrap()).unwrap();
        assert_eq!(out.buffer().unwrap().state(), BufferState::Prepared);
        assert!(!out.is_queued());

        let buffer = out.unprepare_buffer().unwrap();
        assert_eq!(buffer.state(), BufferState::Raw);
        out.close().unwrap();
        assert!(!out.is_open());
    }
}
