//! Input engine
//!
//! Records into any number of buffers. Each prepared buffer gets a
//! `BufferKey`, which stays valid until the buffer is removed and is never
//! handed out again: keys are insertion indices, not positions.

use std::fmt;
use std::sync::Arc;

use crate::audio_buffer::{BufferId, BufferState, WaveBuffer};
use crate::driver::{Direction, WaveDriver};
use crate::engine::EngineCore;
use crate::events::EventStream;
use crate::format::WaveFormat;
use crate::Result;

/// Stable handle on a buffer held by a `WaveIn`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey(usize);

impl BufferKey {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {}", self.0)
    }
}

/// Capture engine with a keyed set of buffers
pub struct WaveIn {
    core: EngineCore,
    slots: Vec<Option<WaveBuffer>>,
}

impl WaveIn {
    pub fn new(driver: Arc<dyn WaveDriver>) -> Self {
        Self {
            core: EngineCore::new(driver, Direction::Input),
            slots: Vec::new(),
        }
    }

    /// Open input device `device_id` (or `WAVE_MAPPER`) with `format`
    ///
    /// Recording does not begin until `start`.
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

    pub fn completions(&self) -> u64 {
        self.core.completions()
    }

    fn slot(&self, key: BufferKey) -> &WaveBuffer {
        match self.slots.get(key.0) {
            Some(Some(buffer)) => buffer,
            _ => panic!("input engine has no buffer under {}", key),
        }
    }

    /// Register `buffer` with the device; the key is assigned only on success
    pub fn prepare_buffer(&mut self, buffer: WaveBuffer) -> Result<BufferKey> {
        self.core.prepare(&buffer)?;
        let key = BufferKey(self.slots.len());
        log::debug!("{} held under {}", buffer.id(), key);
        self.slots.push(Some(buffer));
        Ok(key)
    }

    /// Queue the buffer under `key` for recording
    ///
    /// # Panics
    /// On an unknown or removed key, or a buffer not ready to queue.
    pub fn add_buffer(&mut self, key: BufferKey) -> Result<()> {
        let buffer = self.slot(key).clone();
        self.core.submit(&buffer)
    }

    pub fn get_buffer(&self, key: BufferKey) -> Option<&WaveBuffer> {
        self.slots.get(key.0).and_then(Option::as_ref)
    }

    /// Take the buffer under `key` out of the engine
    ///
    /// # Panics
    /// If the buffer is still prepared.
    pub fn remove_buffer(&mut self, key: BufferKey) -> Option<WaveBuffer> {
        let slot = self.slots.get_mut(key.0)?;
        if let Some(buffer) = slot.as_ref() {
            assert!(
                buffer.state() == BufferState::Raw,
                "{} under {} must be unprepared before removal",
                buffer.id(),
                key
            );
        }
        slot.take()
    }

    /// Key of the held buffer with the given id, e.g. for a completion event
    pub fn key_of(&self, id: BufferId) -> Option<BufferKey> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|buffer| buffer.id() == id))
            .map(BufferKey)
    }

    pub fn keys(&self) -> impl Iterator<Item = BufferKey> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| BufferKey(index))
    }

    /// Number of buffers held
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|buffer| buffer.state() == BufferState::Queued)
            .count()
    }

    pub fn start(&mut self) -> Result<()> {
        self.core.start()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.core.stop()
    }

    /// Stop recording; every queued buffer comes back as a completion event
    pub fn reset(&mut self) -> Result<()> {
        self.core.reset()
    }

    /// Unregister the buffer under `key`; it stays held until removed
    ///
    /// Fails with `WAVERR_STILLPLAYING` while the buffer is queued.
    pub fn unprepare_buffer(&mut self, key: BufferKey) -> Result<()> {
        let buffer = self.slot(key).clone();
        self.core.unprepare(&buffer)
    }

    /// Close the device
    ///
    /// # Panics
    /// If any held buffer is still prepared.
    pub fn close(&mut self) -> Result<()> {
        if let Some(key) = self
            .keys()
            .find(|&key| self.slot(key).state() != BufferState::Raw)
        {
            panic!("input engine closed with the buffer under {} still prepared", key);
        }
        self.core.close()
    }
}

impl fmt::Debug for WaveIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveIn")
            .field("open", &self.is_open())
            .field("format", &self.format())
            .field("buffers", &self.len())
            .finish()
    }
}
