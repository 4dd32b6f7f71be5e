//! In-process loopback driver
//!
//! Behaves like a WinMM device pair without hardware: output devices "play"
//! a buffer by appending its bytes to a tape shared by every device of the
//! driver, and input devices "record" by taking bytes back off that tape.
//! Each open device has a worker thread that completes buffers in submission
//! order and reports them through the callback bridge, so engines see the
//! same threading they would see with a real driver.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{
    DeviceRecord, Direction, WaveDevice, WaveDriver, WAVECAPS_LRVOLUME, WAVECAPS_PITCH,
    WAVECAPS_VOLUME, WAVE_MAPPER,
};
use crate::audio_buffer::{BufferId, BufferState, WaveBuffer};
use crate::bridge::{self, DriverMessage};
use crate::format::{WaveFormat, WAVE_FORMAT_PCM};
use crate::utils::{
    status_text, truncate_device_name, MMSYSERR_BADDEVICEID, MMSYSERR_INVALHANDLE,
    MMSYSERR_INVALPARAM, MMSYSERR_NOTSUPPORTED, WAVERR_BADFORMAT, WAVERR_STILLPLAYING,
    WAVERR_UNPREPARED,
};
use crate::{Result, WaveError};

/// Manufacturer id reported for loopback devices
pub const LOOPBACK_MANUFACTURER: u16 = 0xFFFF;

const LOOPBACK_DRIVER_VERSION: u32 = 0x0100;
const ALL_STANDARD_FORMATS: u32 = 0x0FFF;
const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;
/// How long close waits for a completion that is being delivered
const CLOSE_GRACE: Duration = Duration::from_millis(200);
/// 1.0 in 16.16 fixed point
const UNIT_PITCH: u32 = 0x0001_0000;

/// Loopback driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub output_devices: Vec<String>,
    pub input_devices: Vec<String>,
    /// Pace each buffer by its playback duration instead of completing at once
    pub realtime: bool,
    /// Most bytes the tape keeps; the oldest bytes are dropped first
    pub tape_bytes: usize,
    pub supports_pitch: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            output_devices: vec!["Loopback Output".to_string()],
            input_devices: vec!["Loopback Input".to_string()],
            realtime: false,
            tape_bytes: 4 * 1024 * 1024,
            supports_pitch: false,
        }
    }
}

type Tape = Arc<Mutex<VecDeque<u8>>>;

/// Simulated driver with a shared output-to-input tape
pub struct LoopbackDriver {
    config: LoopbackConfig,
    tape: Tape,
}

impl LoopbackDriver {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            tape: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Bytes played but not yet recorded
    pub fn tape_len(&self) -> usize {
        self.tape.lock().len()
    }

    fn names(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Output => &self.config.output_devices,
            Direction::Input => &self.config.input_devices,
        }
    }

    fn resolve(&self, direction: Direction, id: u32) -> Result<u32> {
        let count = self.device_count(direction);
        if id == WAVE_MAPPER && count > 0 {
            return Ok(0);
        }
        if id >= count {
            return Err(status_error(MMSYSERR_BADDEVICEID));
        }
        Ok(id)
    }
}

fn status_error(code: u32) -> WaveError {
    WaveError::device(code, status_text(code))
}

fn validate_format(format: &WaveFormat) -> Result<()> {
    let supported = format.format_tag() == WAVE_FORMAT_PCM
        && matches!(format.channels(), 1 | 2)
        && matches!(format.bits_per_sample(), 8 | 16)
        && (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&format.sample_rate())
        && format.is_consistent();
    if supported {
        Ok(())
    } else {
        Err(status_error(WAVERR_BADFORMAT))
    }
}

impl WaveDriver for LoopbackDriver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn device_count(&self, direction: Direction) -> u32 {
        u32::try_from(self.names(direction).len()).unwrap_or(u32::MAX - 1)
    }

    fn device_caps(&self, direction: Direction, id: u32) -> Result<DeviceRecord> {
        let id = self.resolve(direction, id)?;
        let support = match direction {
            Direction::Output if self.config.supports_pitch => {
                WAVECAPS_VOLUME | WAVECAPS_LRVOLUME | WAVECAPS_PITCH
            }
            Direction::Output => WAVECAPS_VOLUME | WAVECAPS_LRVOLUME,
            Direction::Input => 0,
        };
        Ok(DeviceRecord {
            id,
            name: truncate_device_name(&self.names(direction)[id as usize]),
            manufacturer_id: LOOPBACK_MANUFACTURER,
            product_id: u16::try_from(id).unwrap_or(u16::MAX),
            driver_version: LOOPBACK_DRIVER_VERSION,
            formats: ALL_STANDARD_FORMATS,
            channels: 2,
            support,
        })
    }

    fn open(
        &self,
        direction: Direction,
        id: u32,
        format: &WaveFormat,
        instance: usize,
    ) -> Result<Box<dyn WaveDevice>> {
        let id = self.resolve(direction, id)?;
        validate_format(format)?;

        let shared = Arc::new(DeviceShared {
            queue: Mutex::new(DeviceQueue {
                // Output devices play as soon as data arrives, input waits for start
                running: direction == Direction::Output,
                ..DeviceQueue::default()
            }),
            wake: Condvar::new(),
        });
        let worker = Worker {
            direction,
            instance,
            format: *format,
            realtime: self.config.realtime,
            tape_bytes: self.config.tape_bytes,
            tape: Arc::clone(&self.tape),
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name(format!("loopback-{}-{}", direction, id))
            .spawn(move || worker.run())?;

        log::info!(
            "Loopback {} device {} opened with {}",
            direction,
            id,
            format
        );
        bridge::dispatch_or_abort(instance, DriverMessage::Opened);

        Ok(Box::new(LoopbackDevice {
            direction,
            instance,
            shared,
            worker: Some(handle),
            volume: 0xFFFF_FFFF,
            pitch: UNIT_PITCH,
            supports_pitch: self.config.supports_pitch,
            closed: false,
        }))
    }

    fn error_text(&self, _direction: Direction, code: u32) -> String {
        status_text(code).to_string()
    }
}

#[derive(Default)]
struct DeviceQueue {
    prepared: HashSet<BufferId>,
    pending: VecDeque<WaveBuffer>,
    /// Returned by reset, completed without transfer
    flushed: VecDeque<WaveBuffer>,
    /// Buffer being transferred or reported by the worker
    in_flight: Option<WaveBuffer>,
    /// Cuts the in-flight buffer short; cleared when the next one is taken
    interrupt: Option<Interrupt>,
    running: bool,
    shutdown: bool,
}

impl DeviceQueue {
    /// Whether the driver still owns the buffer
    ///
    /// An in-flight buffer is released as soon as it is reported Completed,
    /// even if its event has not been received yet.
    fn holds(&self, id: BufferId) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|b| b.id() == id && b.state() == BufferState::Queued)
            || self.pending.iter().any(|b| b.id() == id)
            || self.flushed.iter().any(|b| b.id() == id)
    }

    fn has_queued(&self) -> bool {
        !self.pending.is_empty() || !self.flushed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Reset,
    Stop,
}

/// How the worker finishes a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    /// Returned by reset without touching the bytes
    Flushed,
    /// The first n bytes were played or recorded
    Transferred(usize),
}

struct DeviceShared {
    queue: Mutex<DeviceQueue>,
    wake: Condvar,
}

struct Worker {
    direction: Direction,
    instance: usize,
    format: WaveFormat,
    realtime: bool,
    tape_bytes: usize,
    tape: Tape,
    shared: Arc<DeviceShared>,
}

impl Worker {
    fn run(self) {
        log::debug!("Loopback {} worker started", self.direction);
        while let Some((buffer, completion)) = self.next_buffer() {
            let bytes = match completion {
                Completion::Flushed => 0,
                Completion::Transferred(limit) => self.transfer(&buffer, limit),
            };
            bridge::dispatch_or_abort(
                self.instance,
                DriverMessage::Done {
                    buffer: buffer.id().as_raw(),
                    bytes_recorded: bytes,
                },
            );
            drop(buffer);

            self.shared.queue.lock().in_flight = None;
            self.shared.wake.notify_all();
        }
        log::debug!("Loopback {} worker stopped", self.direction);
    }

    /// Wait for the next buffer to complete; None on shutdown
    fn next_buffer(&self) -> Option<(WaveBuffer, Completion)> {
        let mut queue = self.shared.queue.lock();
        let (buffer, flushed) = loop {
            if queue.shutdown {
                return None;
            }
            if let Some(buffer) = queue.flushed.pop_front() {
                break (buffer, true);
            }
            if queue.running {
                if let Some(buffer) = queue.pending.pop_front() {
                    break (buffer, false);
                }
            }
            self.shared.wake.wait(&mut queue);
        };
        queue.in_flight = Some(buffer.clone());
        queue.interrupt = None;

        if flushed {
            return Some((buffer, Completion::Flushed));
        }
        if !self.realtime {
            let len = buffer.len();
            return Some((buffer, Completion::Transferred(len)));
        }

        // Realtime: the buffer plays only while the device runs, and reset
        // or an input stop hands it back with what was covered so far.
        let total = self.format.duration_of(buffer.len());
        let mut elapsed = Duration::ZERO;
        loop {
            if queue.shutdown {
                return None;
            }
            if let Some(interrupt) = queue.interrupt.take() {
                let completion = match (self.direction, interrupt) {
                    (Direction::Input, Interrupt::Reset) => Completion::Flushed,
                    _ => Completion::Transferred(self.format.bytes_in(elapsed).min(buffer.len())),
                };
                log::debug!(
                    "Loopback {} {} cut short by {:?} after {:?}",
                    self.direction,
                    buffer.id(),
                    interrupt,
                    elapsed
                );
                return Some((buffer, completion));
            }
            if elapsed >= total {
                break;
            }
            if queue.running {
                let resumed = Instant::now();
                let _ = self.shared.wake.wait_while_for(
                    &mut queue,
                    |q| !q.shutdown && q.interrupt.is_none() && q.running,
                    total - elapsed,
                );
                elapsed += resumed.elapsed();
            } else {
                self.shared.wake.wait_while(&mut queue, |q| {
                    !q.shutdown && q.interrupt.is_none() && !q.running
                });
            }
        }
        let len = buffer.len();
        Some((buffer, Completion::Transferred(len)))
    }

    /// Move the first `limit` bytes between the buffer and the tape;
    /// returns bytes transferred
    fn transfer(&self, buffer: &WaveBuffer, limit: usize) -> usize {
        match self.direction {
            Direction::Output => buffer.driver_read(|bytes| {
                let bytes = &bytes[..limit.min(bytes.len())];
                let mut tape = self.tape.lock();
                tape.extend(bytes.iter().copied());
                let excess = tape.len().saturating_sub(self.tape_bytes);
                tape.drain(..excess);
                bytes.len()
            }),
            Direction::Input => {
                let silence = if self.format.bits_per_sample() == 8 { 0x80 } else { 0 };
                buffer.driver_write(|bytes| {
                    let len = limit.min(bytes.len());
                    let bytes = &mut bytes[..len];
                    let mut tape = self.tape.lock();
                    let available = tape.len().min(bytes.len());
                    for (dst, src) in bytes.iter_mut().zip(tape.drain(..available)) {
                        *dst = src;
                    }
                    bytes[available..].fill(silence);
                    bytes.len()
                })
            }
        }
    }
}

/// Open loopback device handle
pub struct LoopbackDevice {
    direction: Direction,
    instance: usize,
    shared: Arc<DeviceShared>,
    worker: Option<JoinHandle<()>>,
    volume: u32,
    pitch: u32,
    supports_pitch: bool,
    closed: bool,
}

impl LoopbackDevice {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(status_error(MMSYSERR_INVALHANDLE))
        } else {
            Ok(())
        }
    }

    fn set_running(&mut self, running: bool) -> Result<()> {
        self.check_open()?;
        let mut queue = self.shared.queue.lock();
        queue.running = running;
        // A stopped input device hands back the buffer it is recording into;
        // a paused output device holds its buffer.
        if !running && self.direction == Direction::Input && queue.in_flight.is_some() {
            queue.interrupt = Some(Interrupt::Stop);
        }
        drop(queue);
        self.shared.wake.notify_all();
        Ok(())
    }
}

impl WaveDevice for LoopbackDevice {
    fn prepare(&mut self, buffer: &WaveBuffer) -> Result<()> {
        self.check_open()?;
        if !self.shared.queue.lock().prepared.insert(buffer.id()) {
            return Err(status_error(MMSYSERR_INVALPARAM));
        }
        Ok(())
    }

    fn unprepare(&mut self, buffer: &WaveBuffer) -> Result<()> {
        self.check_open()?;
        let mut queue = self.shared.queue.lock();
        if queue.holds(buffer.id()) {
            return Err(status_error(WAVERR_STILLPLAYING));
        }
        queue.prepared.remove(&buffer.id());
        Ok(())
    }

    fn submit(&mut self, buffer: &WaveBuffer) -> Result<()> {
        self.check_open()?;
        let mut queue = self.shared.queue.lock();
        if !queue.prepared.contains(&buffer.id()) {
            return Err(status_error(WAVERR_UNPREPARED));
        }
        queue.pending.push_back(buffer.clone());
        drop(queue);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.set_running(true)
    }

    fn stop(&mut self) -> Result<()> {
        self.set_running(false)
    }

    fn reset(&mut self) -> Result<()> {
        self.check_open()?;
        let mut queue = self.shared.queue.lock();
        let pending: Vec<WaveBuffer> = queue.pending.drain(..).collect();
        queue.flushed.extend(pending);
        if queue.in_flight.is_some() {
            queue.interrupt = Some(Interrupt::Reset);
        }
        if self.direction == Direction::Input {
            queue.running = false;
        }
        drop(queue);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn set_volume(&mut self, volume: u32) -> Result<()> {
        self.check_open()?;
        if self.direction == Direction::Input {
            return Err(status_error(MMSYSERR_NOTSUPPORTED));
        }
        self.volume = volume;
        Ok(())
    }

    fn volume(&self) -> Result<u32> {
        self.check_open()?;
        if self.direction == Direction::Input {
            return Err(status_error(MMSYSERR_NOTSUPPORTED));
        }
        Ok(self.volume)
    }

    fn set_pitch(&mut self, pitch: u32) -> Result<()> {
        self.check_open()?;
        if self.direction == Direction::Input || !self.supports_pitch {
            return Err(status_error(MMSYSERR_NOTSUPPORTED));
        }
        log::debug!("Loopback {} pitch set to {:#010x}", self.direction, pitch);
        self.pitch = pitch;
        Ok(())
    }

    fn pitch(&self) -> Result<u32> {
        self.check_open()?;
        if self.direction == Direction::Input || !self.supports_pitch {
            return Err(status_error(MMSYSERR_NOTSUPPORTED));
        }
        Ok(self.pitch)
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        {
            let mut queue = self.shared.queue.lock();
            if queue.has_queued() {
                return Err(status_error(WAVERR_STILLPLAYING));
            }
            if queue.in_flight.is_some() {
                let _ = self
                    .shared
                    .wake
                    .wait_while_for(&mut queue, |q| q.in_flight.is_some(), CLOSE_GRACE);
                if queue.in_flight.is_some() {
                    return Err(status_error(WAVERR_STILLPLAYING));
                }
            }
            queue.shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Loopback {} worker panicked", self.direction);
            }
        }
        self.closed = true;
        log::info!("Loopback {} device closed", self.direction);
        bridge::dispatch_or_abort(self.instance, DriverMessage::Closed);
        Ok(())
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        if !self.closed {
            // The worker may be blocked delivering a completion, so it is
            // signalled and detached rather than joined.
            self.shared.queue.lock().shutdown = true;
            self.shared.wake.notify_all();
        }
    }
}
