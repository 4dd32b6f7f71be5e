//! Shared engine core
//!
//! Holds the driver, the open device handle and the engine's registration in
//! the dispatch table. Both `WaveOut` and `WaveIn` are thin layers over this:
//! they decide which buffers exist, the core moves them through the lifecycle.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio_buffer::{BufferState, WaveBuffer};
use crate::driver::{Direction, WaveDevice, WaveDriver};
use crate::events::EventStream;
use crate::format::WaveFormat;
use crate::registry::{self, EngineShared};
use crate::utils::{MMSYSERR_INVALPARAM, WAVERR_STILLPLAYING};
use crate::{Result, WaveError};

const SHUTDOWN_RETRIES: usize = 50;
const SHUTDOWN_RETRY_DELAY: Duration = Duration::from_millis(10);

pub(crate) struct EngineCore {
    driver: Arc<dyn WaveDriver>,
    shared: Arc<EngineShared>,
    device: Option<Box<dyn WaveDevice>>,
    format: Option<WaveFormat>,
}

impl EngineCore {
    pub(crate) fn new(driver: Arc<dyn WaveDriver>, direction: Direction) -> Self {
        Self {
            driver,
            shared: EngineShared::new(direction),
            device: None,
            format: None,
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.shared.direction()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub(crate) fn format(&self) -> Option<WaveFormat> {
        self.format
    }

    pub(crate) fn events(&self) -> EventStream {
        self.shared.events()
    }

    pub(crate) fn completions(&self) -> u64 {
        self.shared.completions()
    }

    /// Device error carrying the driver's text for `code`
    pub(crate) fn status(&self, code: u32) -> WaveError {
        WaveError::device(code, self.driver.error_text(self.direction(), code))
    }

    fn device_mut(&mut self) -> &mut Box<dyn WaveDevice> {
        let direction = self.direction();
        match self.device.as_mut() {
            Some(device) => device,
            None => panic!("{} engine is not open", direction),
        }
    }

    fn device_ref(&self) -> &Box<dyn WaveDevice> {
        match self.device.as_ref() {
            Some(device) => device,
            None => panic!("{} engine is not open", self.direction()),
        }
    }

    pub(crate) fn open(&mut self, device_id: u32, format: &WaveFormat) -> Result<()> {
        assert!(!self.is_open(), "{} engine is already open", self.direction());

        // The driver reports Opened before open returns, so the engine must
        // already be reachable.
        registry::register(&self.shared);
        match self
            .driver
            .open(self.direction(), device_id, format, self.shared.token())
        {
            Ok(device) => {
                self.device = Some(device);
                self.format = Some(*format);
                log::info!(
                    "{} engine {} opened device {} ({}) via {}",
                    self.direction(),
                    self.shared.token(),
                    device_id,
                    format,
                    self.driver.name()
                );
                Ok(())
            }
            Err(err) => {
                registry::unregister(self.shared.token());
                self.shared.close_channel();
                log::warn!("{} open of device {} failed: {}", self.direction(), device_id, err);
                Err(err)
            }
        }
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        let prepared = self.shared.prepared_count();
        assert!(
            prepared == 0,
            "{} engine closed with {} prepared buffers",
            self.direction(),
            prepared
        );

        // With nothing prepared no completion can be due, but the last one may
        // still be waiting for a receiver. End the stream so the driver thread
        // is released before the handle closes.
        self.shared.close_channel();
        self.device_mut().close()?;
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.device = None;
        self.format = None;
        registry::unregister(self.shared.token());
        self.shared.close_channel();
        log::info!("{} engine {} closed", self.direction(), self.shared.token());
    }

    pub(crate) fn prepare(&mut self, buffer: &WaveBuffer) -> Result<()> {
        self.device_mut().prepare(buffer)?;

        if let Err(err) = buffer.transition(BufferState::Prepared) {
            // Prepared somewhere else: take back this driver's registration.
            log::warn!("Rejecting prepare: {}", err);
            if let Err(undo) = self.device_mut().unprepare(buffer) {
                log::warn!("Could not undo prepare of {}: {}", buffer.id(), undo);
            }
            return Err(self.status(MMSYSERR_INVALPARAM));
        }
        self.shared.insert_prepared(buffer);
        log::debug!("{} prepared on {} engine", buffer.id(), self.direction());
        Ok(())
    }

    pub(crate) fn unprepare(&mut self, buffer: &WaveBuffer) -> Result<()> {
        match buffer.state() {
            BufferState::Raw => return Ok(()),
            BufferState::Queued => return Err(self.status(WAVERR_STILLPLAYING)),
            BufferState::Prepared | BufferState::Completed => {}
        }
        assert!(
            self.shared.prepared_buffer(buffer.id()).is_some(),
            "{} is not prepared on this {} engine",
            buffer.id(),
            self.direction()
        );

        self.device_mut().unprepare(buffer)?;
        self.shared.remove_prepared(buffer.id());
        if let Err(err) = buffer.transition(BufferState::Raw) {
            panic!("unprepare raced with the driver: {}", err);
        }
        log::debug!("{} unprepared on {} engine", buffer.id(), self.direction());
        Ok(())
    }

    pub(crate) fn submit(&mut self, buffer: &WaveBuffer) -> Result<()> {
        assert!(
            self.shared.prepared_buffer(buffer.id()).is_some(),
            "{} is not prepared on this {} engine",
            buffer.id(),
            self.direction()
        );
        // Queued before the driver sees it: the completion may arrive
        // before submit returns.
        let previous = match buffer.transition(BufferState::Queued) {
            Ok(previous) => previous,
            Err(err) => panic!("cannot submit: {}", err),
        };

        if let Err(err) = self.device_mut().submit(buffer) {
            buffer.restore(previous);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        self.device_mut().start()
    }

    pub(crate) fn stop(&mut self) -> Result<()> {
        self.device_mut().stop()
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.device_mut().reset()
    }

    pub(crate) fn set_volume(&mut self, volume: u32) -> Result<()> {
        self.device_mut().set_volume(volume)
    }

    pub(crate) fn volume(&self) -> Result<u32> {
        self.device_ref().volume()
    }

    pub(crate) fn set_pitch(&mut self, pitch: u32) -> Result<()> {
        self.device_mut().set_pitch(pitch)
    }

    pub(crate) fn pitch(&self) -> Result<u32> {
        self.device_ref().pitch()
    }

    /// Best-effort teardown of an engine dropped while open
    fn shutdown(&mut self) {
        if !self.is_open() {
            return;
        }
        log::warn!("{} engine dropped while open, shutting down", self.direction());

        // Nobody will receive any more events; release blocked publishers first.
        self.shared.close_channel();
        if let Err(err) = self.device_mut().reset() {
            log::warn!("{} reset during shutdown failed: {}", self.direction(), err);
        }

        for buffer in self.shared.prepared_buffers() {
            let mut attempts = 0;
            loop {
                match self.unprepare(&buffer) {
                    Ok(()) => break,
                    Err(err)
                        if err.device_code() == Some(WAVERR_STILLPLAYING)
                            && attempts < SHUTDOWN_RETRIES =>
                    {
                        attempts += 1;
                        thread::sleep(SHUTDOWN_RETRY_DELAY);
                    }
                    Err(err) => {
                        log::error!("Could not unprepare {} during shutdown: {}", buffer.id(), err);
                        break;
                    }
                }
            }
        }

        if self.shared.prepared_count() > 0 {
            // The driver may still own these buffers; stay registered so late
            // callbacks resolve.
            log::error!(
                "{} engine leaked with {} prepared buffers",
                self.direction(),
                self.shared.prepared_count()
            );
            self.device = None;
            return;
        }

        match self.device_mut().close() {
            Ok(()) => self.release(),
            Err(err) => {
                log::error!("{} close during shutdown failed: {}", self.direction(), err);
                self.device = None;
            }
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
