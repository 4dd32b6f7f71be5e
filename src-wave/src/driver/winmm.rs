//! Windows multimedia (WinMM) backend
//!
//! Thin wrapper over `waveOut*` / `waveIn*`. Devices are opened with
//! `CALLBACK_FUNCTION`; the callbacks below run on a thread owned by the
//! audio subsystem and forward straight into the bridge. The header handed
//! to the driver carries the buffer token in `dwUser`, never an address the
//! bridge would have to trust.

use std::collections::HashMap;
use std::mem;

use windows::core::PSTR;
use windows::Win32::Media::Audio::{
    waveInAddBuffer, waveInClose, waveInGetDevCapsA, waveInGetErrorTextA, waveInGetNumDevs,
    waveInOpen, waveInPrepareHeader, waveInReset, waveInStart, waveInStop,
    waveInUnprepareHeader, waveOutClose, waveOutGetDevCapsA, waveOutGetErrorTextA,
    waveOutGetNumDevs, waveOutGetPitch, waveOutGetVolume, waveOutOpen, waveOutPause, waveOutPrepareHeader,
    waveOutReset, waveOutRestart, waveOutSetPitch, waveOutSetVolume, waveOutUnprepareHeader,
    waveOutWrite, CALLBACK_FUNCTION, HWAVEIN, HWAVEOUT, WAVEFORMATEX, WAVEHDR, WAVEINCAPSA,
    WAVEOUTCAPSA,
};

use super::{DeviceRecord, Direction, WaveDevice, WaveDriver};
use crate::audio_buffer::{BufferId, WaveBuffer};
use crate::bridge::{self, decode_message, DriverMessage, MessageKind};
use crate::format::WaveFormat;
use crate::utils::{
    device_name_from_bytes, status_text, MMSYSERR_NOERROR, MMSYSERR_NOTSUPPORTED,
};
use crate::{Result, WaveError};

const MAXERRORLENGTH: usize = 256;

/// The system wave audio subsystem
#[derive(Debug, Default)]
pub struct WinmmDriver;

impl WinmmDriver {
    pub fn new() -> Self {
        Self
    }
}

fn check(direction: Direction, code: u32) -> Result<()> {
    if code == MMSYSERR_NOERROR {
        Ok(())
    } else {
        Err(WaveError::device(code, error_text(direction, code)))
    }
}

fn error_text(direction: Direction, code: u32) -> String {
    let mut text = [0u8; MAXERRORLENGTH];
    // SAFETY: the slice is a valid, writable buffer of MAXERRORLENGTH bytes.
    let status = unsafe {
        match direction {
            Direction::Output => waveOutGetErrorTextA(code, &mut text),
            Direction::Input => waveInGetErrorTextA(code, &mut text),
        }
    };
    if status != MMSYSERR_NOERROR {
        return status_text(code).to_string();
    }
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    String::from_utf8_lossy(&text[..end]).into_owned()
}

fn to_waveformatex(format: &WaveFormat) -> WAVEFORMATEX {
    WAVEFORMATEX {
        wFormatTag: format.format_tag(),
        nChannels: format.channels(),
        nSamplesPerSec: format.sample_rate(),
        nAvgBytesPerSec: format.avg_bytes_per_sec(),
        nBlockAlign: format.block_align(),
        wBitsPerSample: format.bits_per_sample(),
        cbSize: 0,
    }
}

impl WaveDriver for WinmmDriver {
    fn name(&self) -> &str {
        "winmm"
    }

    fn device_count(&self, direction: Direction) -> u32 {
        // SAFETY: no arguments, plain query.
        unsafe {
            match direction {
                Direction::Output => waveOutGetNumDevs(),
                Direction::Input => waveInGetNumDevs(),
            }
        }
    }

    fn device_caps(&self, direction: Direction, id: u32) -> Result<DeviceRecord> {
        match direction {
            Direction::Output => {
                let mut caps = WAVEOUTCAPSA::default();
                // SAFETY: caps is a valid WAVEOUTCAPSA and its size is passed along.
                let code = unsafe {
                    waveOutGetDevCapsA(id as usize, &mut caps, mem::size_of::<WAVEOUTCAPSA>() as u32)
                };
                check(direction, code)?;
                let name: Vec<u8> = caps.szPname.iter().map(|&c| c as u8).collect();
                Ok(DeviceRecord {
                    id,
                    name: device_name_from_bytes(&name),
                    manufacturer_id: caps.wMid,
                    product_id: caps.wPid,
                    driver_version: caps.vDriverVersion,
                    formats: caps.dwFormats,
                    channels: caps.wChannels,
                    support: caps.dwSupport,
                })
            }
            Direction::Input => {
                let mut caps = WAVEINCAPSA::default();
                // SAFETY: caps is a valid WAVEINCAPSA and its size is passed along.
                let code = unsafe {
                    waveInGetDevCapsA(id as usize, &mut caps, mem::size_of::<WAVEINCAPSA>() as u32)
                };
                check(direction, code)?;
                let name: Vec<u8> = caps.szPname.iter().map(|&c| c as u8).collect();
                Ok(DeviceRecord {
                    id,
                    name: device_name_from_bytes(&name),
                    manufacturer_id: caps.wMid,
                    product_id: caps.wPid,
                    driver_version: caps.vDriverVersion,
                    formats: caps.dwFormats,
                    channels: caps.wChannels,
                    support: 0,
                })
            }
        }
    }

    fn open(
        &self,
        direction: Direction,
        id: u32,
        format: &WaveFormat,
        instance: usize,
    ) -> Result<Box<dyn WaveDevice>> {
        let wfx = to_waveformatex(format);
        let handle = match direction {
            Direction::Output => {
                let mut hwo = HWAVEOUT::default();
                // SAFETY: wfx outlives the call; the callback is a valid
                // extern "system" function for the whole process lifetime.
                let code = unsafe {
                    waveOutOpen(
                        Some(&mut hwo as *mut HWAVEOUT),
                        id,
                        &wfx,
                        wave_out_proc as usize,
                        instance,
                        CALLBACK_FUNCTION,
                    )
                };
                check(direction, code)?;
                RawHandle::Output(hwo)
            }
            Direction::Input => {
                let mut hwi = HWAVEIN::default();
                // SAFETY: as above.
                let code = unsafe {
                    waveInOpen(
                        Some(&mut hwi as *mut HWAVEIN),
                        id,
                        &wfx,
                        wave_in_proc as usize,
                        instance,
                        CALLBACK_FUNCTION,
                    )
                };
                check(direction, code)?;
                RawHandle::Input(hwi)
            }
        };
        log::info!("WinMM {} device {} opened with {}", direction, id, format);

        Ok(Box::new(WinmmDevice {
            handle,
            headers: HashMap::new(),
            closed: false,
        }))
    }

    fn error_text(&self, direction: Direction, code: u32) -> String {
        error_text(direction, code)
    }
}

#[derive(Clone, Copy)]
enum RawHandle {
    Output(HWAVEOUT),
    Input(HWAVEIN),
}

impl RawHandle {
    fn direction(self) -> Direction {
        match self {
            RawHandle::Output(_) => Direction::Output,
            RawHandle::Input(_) => Direction::Input,
        }
    }
}

/// Open WinMM device
pub struct WinmmDevice {
    handle: RawHandle,
    /// One pinned header per prepared buffer
    headers: HashMap<BufferId, Box<WAVEHDR>>,
    closed: bool,
}

// SAFETY: WinMM handles may be used from any thread. The headers are only
// touched by the driver between prepare and unprepare, and by this struct
// through `&mut self`.
unsafe impl Send for WinmmDevice {}

impl WinmmDevice {
    fn direction(&self) -> Direction {
        self.handle.direction()
    }

    fn header_ptr(&mut self, id: BufferId) -> Option<*mut WAVEHDR> {
        self.headers
            .get_mut(&id)
            .map(|header| &mut **header as *mut WAVEHDR)
    }
}

const HEADER_SIZE: u32 = mem::size_of::<WAVEHDR>() as u32;

impl WaveDevice for WinmmDevice {
    fn prepare(&mut self, buffer: &WaveBuffer) -> Result<()> {
        if self.headers.contains_key(&buffer.id()) {
            return check(self.direction(), crate::utils::MMSYSERR_INVALPARAM);
        }
        let mut header = Box::new(WAVEHDR {
            lpData: PSTR::from_raw(buffer.as_mut_ptr()),
            dwBufferLength: buffer.len() as u32,
            dwUser: buffer.id().as_raw(),
            ..Default::default()
        });
        let ptr = &mut *header as *mut WAVEHDR;
        // SAFETY: the header is boxed and kept in `headers` until unprepared;
        // lpData points into a region the buffer keeps alive.
        let code = unsafe {
            match self.handle {
                RawHandle::Output(h) => waveOutPrepareHeader(h, ptr, HEADER_SIZE),
                RawHandle::Input(h) => waveInPrepareHeader(h, ptr, HEADER_SIZE),
            }
        };
        check(self.direction(), code)?;
        self.headers.insert(buffer.id(), header);
        Ok(())
    }

    fn unprepare(&mut self, buffer: &WaveBuffer) -> Result<()> {
        let Some(ptr) = self.header_ptr(buffer.id()) else {
            return Ok(());
        };
        // SAFETY: ptr is a header previously prepared on this handle.
        let code = unsafe {
            match self.handle {
                RawHandle::Output(h) => waveOutUnprepareHeader(h, ptr, HEADER_SIZE),
                RawHandle::Input(h) => waveInUnprepareHeader(h, ptr, HEADER_SIZE),
            }
        };
        check(self.direction(), code)?;
        self.headers.remove(&buffer.id());
        Ok(())
    }

    fn submit(&mut self, buffer: &WaveBuffer) -> Result<()> {
        let direction = self.direction();
        let Some(ptr) = self.header_ptr(buffer.id()) else {
            return check(direction, crate::utils::WAVERR_UNPREPARED);
        };
        // SAFETY: ptr is a prepared header pinned in `headers`.
        let code = unsafe {
            (*ptr).dwBytesRecorded = 0;
            match self.handle {
                RawHandle::Output(h) => waveOutWrite(h, ptr, HEADER_SIZE),
                RawHandle::Input(h) => waveInAddBuffer(h, ptr, HEADER_SIZE),
            }
        };
        check(direction, code)
    }

    fn start(&mut self) -> Result<()> {
        // SAFETY: handle is open.
        let code = unsafe {
            match self.handle {
                RawHandle::Output(h) => waveOutRestart(h),
                RawHandle::Input(h) => waveInStart(h),
            }
        };
        check(self.direction(), code)
    }

    fn stop(&mut self) -> Result<()> {
        // SAFETY: handle is open.
        let code = unsafe {
            match self.handle {
                RawHandle::Output(h) => waveOutPause(h),
                RawHandle::Input(h) => waveInStop(h),
            }
        };
        check(self.direction(), code)
    }

    fn reset(&mut self) -> Result<()> {
        // SAFETY: handle is open.
        let code = unsafe {
            match self.handle {
                RawHandle::Output(h) => waveOutReset(h),
                RawHandle::Input(h) => waveInReset(h),
            }
        };
        check(self.direction(), code)
    }

    fn set_volume(&mut self, volume: u32) -> Result<()> {
        match self.handle {
            // SAFETY: handle is open.
            RawHandle::Output(h) => check(Direction::Output, unsafe { waveOutSetVolume(h, volume) }),
            RawHandle::Input(_) => check(Direction::Input, MMSYSERR_NOTSUPPORTED),
        }
    }

    fn volume(&self) -> Result<u32> {
        match self.handle {
            RawHandle::Output(h) => {
                let mut volume = 0u32;
                // SAFETY: volume is a valid out-pointer.
                check(Direction::Output, unsafe { waveOutGetVolume(h, &mut volume) })?;
                Ok(volume)
            }
            RawHandle::Input(_) => Err(WaveError::device(
                MMSYSERR_NOTSUPPORTED,
                error_text(Direction::Input, MMSYSERR_NOTSUPPORTED),
            )),
        }
    }

    fn set_pitch(&mut self, pitch: u32) -> Result<()> {
        match self.handle {
            // SAFETY: handle is open.
            RawHandle::Output(h) => check(Direction::Output, unsafe { waveOutSetPitch(h, pitch) }),
            RawHandle::Input(_) => check(Direction::Input, MMSYSERR_NOTSUPPORTED),
        }
    }

    fn pitch(&self) -> Result<u32> {
        match self.handle {
            RawHandle::Output(h) => {
                let mut pitch = 0u32;
                // SAFETY: pitch is a valid out-pointer.
                check(Direction::Output, unsafe { waveOutGetPitch(h, &mut pitch) })?;
                Ok(pitch)
            }
            RawHandle::Input(_) => Err(WaveError::device(
                MMSYSERR_NOTSUPPORTED,
                error_text(Direction::Input, MMSYSERR_NOTSUPPORTED),
            )),
        }
    }

    fn close(&mut self) -> Result<()> {
        // SAFETY: handle is open; WIM/WOM_CLOSE is delivered before return.
        let code = unsafe {
            match self.handle {
                RawHandle::Output(h) => waveOutClose(h),
                RawHandle::Input(h) => waveInClose(h),
            }
        };
        check(self.direction(), code)?;
        self.closed = true;
        log::info!("WinMM {} device closed", self.direction());
        Ok(())
    }
}

impl Drop for WinmmDevice {
    fn drop(&mut self) {
        if !self.closed && !self.headers.is_empty() {
            // The driver may still write through these headers.
            log::error!(
                "WinMM {} device dropped open with {} prepared headers, leaking them",
                self.direction(),
                self.headers.len()
            );
            for (_, header) in self.headers.drain() {
                Box::leak(header);
            }
        }
    }
}

/// Forward one raw callback into the bridge
///
/// # Safety
/// For Done messages `param1` must point to a live `WAVEHDR`.
unsafe fn forward(direction: Direction, message: u32, instance: usize, param1: usize) {
    let Some(kind) = decode_message(direction, message) else {
        return;
    };
    let message = match kind {
        MessageKind::Opened => DriverMessage::Opened,
        MessageKind::Closed => DriverMessage::Closed,
        MessageKind::Done => {
            let header = &*(param1 as *const WAVEHDR);
            DriverMessage::Done {
                buffer: header.dwUser,
                bytes_recorded: header.dwBytesRecorded as usize,
            }
        }
    };
    bridge::dispatch_or_abort(instance, message);
}

unsafe extern "system" fn wave_out_proc(
    _hwo: HWAVEOUT,
    message: u32,
    instance: usize,
    param1: usize,
    _param2: usize,
) {
    forward(Direction::Output, message, instance, param1);
}

unsafe extern "system" fn wave_in_proc(
    _hwi: HWAVEIN,
    message: u32,
    instance: usize,
    param1: usize,
    _param2: usize,
) {
    forward(Direction::Input, message, instance, param1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_does_not_fail() {
        let driver = WinmmDriver::new();
        for direction in [Direction::Output, Direction::Input] {
            for id in 0..driver.device_count(direction) {
                let record = driver.device_caps(direction, id).unwrap();
                assert!(record.name.len() < crate::utils::MAXPNAMELEN);
            }
        }
    }

    #[test]
    fn test_error_text_is_not_empty() {
        let text = error_text(Direction::Output, crate::utils::WAVERR_STILLPLAYING);
        assert!(!text.is_empty());
    }
}
