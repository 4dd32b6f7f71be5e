//! Utility functions for wave audio I/O
//!
//! This module contains the driver status codes, scalar control packing,
//! device-name decoding and id generation shared by the engines and drivers.

use std::sync::atomic::{AtomicUsize, Ordering};

// Driver status codes, values as defined by mmsystem.h
pub const MMSYSERR_NOERROR: u32 = 0;
pub const MMSYSERR_ERROR: u32 = 1;
pub const MMSYSERR_BADDEVICEID: u32 = 2;
pub const MMSYSERR_NOTENABLED: u32 = 3;
pub const MMSYSERR_ALLOCATED: u32 = 4;
pub const MMSYSERR_INVALHANDLE: u32 = 5;
pub const MMSYSERR_NODRIVER: u32 = 6;
pub const MMSYSERR_NOMEM: u32 = 7;
pub const MMSYSERR_NOTSUPPORTED: u32 = 8;
pub const MMSYSERR_INVALFLAG: u32 = 10;
pub const MMSYSERR_INVALPARAM: u32 = 11;
pub const WAVERR_BADFORMAT: u32 = 32;
pub const WAVERR_STILLPLAYING: u32 = 33;
pub const WAVERR_UNPREPARED: u32 = 34;
pub const WAVERR_SYNC: u32 = 35;

/// Maximum device name length, terminating NUL included
pub const MAXPNAMELEN: usize = 32;

/// Convert a driver status code to its diagnostic text
///
/// Used by drivers that have no localized text source of their own.
pub fn status_text(code: u32) -> &'static str {
    match code {
        MMSYSERR_NOERROR => "The specified command was carried out.",
        MMSYSERR_ERROR => "Undefined external error.",
        MMSYSERR_BADDEVICEID => "A device ID has been used that is out of range for your system.",
        MMSYSERR_NOTENABLED => "The driver was not enabled.",
        MMSYSERR_ALLOCATED => {
            "The specified device is already in use. Wait until it is free, and then try again."
        }
        MMSYSERR_INVALHANDLE => "The specified device handle is invalid.",
        MMSYSERR_NODRIVER => "There is no driver installed on your system.",
        MMSYSERR_NOMEM => {
            "There is not enough memory available for this task. Quit one or more applications to increase available memory, and then try again."
        }
        MMSYSERR_NOTSUPPORTED => {
            "This function is not supported. Use the Capabilities function to determine which functions and messages the driver supports."
        }
        MMSYSERR_INVALFLAG => "An invalid flag was passed to a system function.",
        MMSYSERR_INVALPARAM => "An invalid parameter was passed to a system function.",
        WAVERR_BADFORMAT => {
            "The specified format is not supported or cannot be translated. Use the Capabilities function to determine the supported formats."
        }
        WAVERR_STILLPLAYING => "Cannot perform this operation while media data is still playing. Reset the device, or wait until the data is finished playing.",
        WAVERR_UNPREPARED => "The wave header was not prepared. Use the Prepare function to prepare the header, and then try again.",
        WAVERR_SYNC => "Cannot open the device without using the WAVE_ALLOWSYNC flag. Use the flag, and then try again.",
        _ => "Unknown driver error.",
    }
}

/// Pack a stereo volume into the driver's 32-bit volume word
///
/// The low-order word holds the left channel, the high-order word the right.
pub fn pack_volume(left: u16, right: u16) -> u32 {
    (u32::from(right) << 16) | u32::from(left)
}

/// Split a 32-bit volume word into (left, right)
pub fn unpack_volume(volume: u32) -> (u16, u16) {
    ((volume & 0xFFFF) as u16, (volume >> 16) as u16)
}

/// Convert a pitch multiplier to the driver's 16.16 fixed-point word
///
/// Returns None for non-finite, non-positive or out-of-range multipliers.
pub fn pitch_to_fixed(multiplier: f64) -> Option<u32> {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return None;
    }
    let fixed = (multiplier * 65536.0).round();
    if fixed < 1.0 || fixed > f64::from(u32::MAX) {
        return None;
    }
    Some(fixed as u32)
}

/// Convert a 16.16 fixed-point pitch word back to a multiplier
pub fn fixed_to_pitch(fixed: u32) -> f64 {
    f64::from(fixed) / 65536.0
}

/// Decode a fixed-length, NUL-terminated device name
pub fn device_name_from_bytes(raw: &[u8]) -> String {
    let raw = &raw[..raw.len().min(MAXPNAMELEN)];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
}

/// Clamp a device name to what fits in a device record
pub fn truncate_device_name(name: &str) -> String {
    let mut out = String::with_capacity(MAXPNAMELEN - 1);
    for c in name.chars() {
        if out.len() + c.len_utf8() > MAXPNAMELEN - 1 {
            break;
        }
        out.push(c);
    }
    out
}

/// Convert sample rate from Hz to a friendly string
pub fn sample_rate_label(sample_rate: u32) -> String {
    match sample_rate {
        8000 => "8 kHz".to_string(),
        11025 => "11.025 kHz".to_string(),
        22050 => "22.05 kHz".to_string(),
        44100 => "44.1 kHz".to_string(),
        48000 => "48 kHz".to_string(),
        96000 => "96 kHz".to_string(),
        _ => format!("{} Hz", sample_rate),
    }
}

// Zero is never handed out: a zeroed driver field must not resolve to anything
static BUFFER_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Generate a process-unique buffer id atomically
pub fn next_buffer_id() -> usize {
    BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_packing() {
        assert_eq!(pack_volume(0xFFFF, 0xFFFF), 0xFFFF_FFFF);
        assert_eq!(pack_volume(0xFFFF, 0), 0x0000_FFFF);
        assert_eq!(pack_volume(0, 0x8000), 0x8000_0000);
        assert_eq!(unpack_volume(pack_volume(0x1234, 0xABCD)), (0x1234, 0xABCD));
    }

    #[test]
    fn test_pitch_conversion() {
        assert_eq!(pitch_to_fixed(1.0), Some(0x0001_0000));
        assert_eq!(pitch_to_fixed(0.5), Some(0x0000_8000));
        assert_eq!(pitch_to_fixed(0.0), None);
        assert_eq!(pitch_to_fixed(-1.0), None);
        assert_eq!(pitch_to_fixed(f64::NAN), None);
        assert_eq!(fixed_to_pitch(0x0002_0000), 2.0);
    }

    #[test]
    fn test_device_name_decoding() {
        let mut raw = [0u8; MAXPNAMELEN];
        raw[..8].copy_from_slice(b"Speakers");
        assert_eq!(device_name_from_bytes(&raw), "Speakers");

        let full = [b'x'; 40];
        assert_eq!(device_name_from_bytes(&full).len(), MAXPNAMELEN);
    }

    #[test]
    fn test_device_name_truncation() {
        let long = "Realtek High Definition Audio Output Device";
        let name = truncate_device_name(long);
        assert_eq!(name.len(), MAXPNAMELEN - 1);
        assert!(long.starts_with(&name));
        assert_eq!(truncate_device_name("Mic"), "Mic");
    }

    #[test]
    fn test_buffer_id_generation() {
        let id1 = next_buffer_id();
        let id2 = next_buffer_id();
        assert_ne!(id1, 0);
        assert!(id2 > id1);
    }

    #[test]
    fn test_status_text() {
        assert!(status_text(WAVERR_STILLPLAYING).contains("still playing"));
        assert!(status_text(MMSYSERR_BADDEVICEID).contains("out of range"));
        assert_eq!(status_text(9999), "Unknown driver error.");
    }
}
