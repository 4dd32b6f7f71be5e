//! Wave Audio I/O - Block-Oriented Playback and Capture
//!
//! This library drives a block-oriented, callback-based audio subsystem
//! (the Windows multimedia `waveOut`/`waveIn` API, or the in-process
//! loopback driver on every other platform).
//!
//! The library is intentionally small:
//! - Opens playback/capture devices with a negotiated PCM format
//! - Moves fixed-size buffers through their lifecycle (Raw → Prepared → Queued → Completed)
//! - Bridges driver callbacks, fired on a driver-owned thread, into per-engine event streams
//!
//! Data flow:
//! - Output: application fills buffer → `WaveOut::write` → driver plays → completion event
//! - Input: `WaveIn::add_buffer` → driver records → completion event → application reads

use std::sync::Once;

// Module declarations
pub mod audio_buffer;
pub mod bridge;
pub mod config;
pub mod devices;
pub mod driver;
mod engine;
pub mod events;
pub mod format;
mod registry;
pub mod utils;
pub mod wave_in;
pub mod wave_out;

// Re-exports for easier use
pub use audio_buffer::{BufferId, BufferState, WaveBuffer};
pub use config::{DriverKind, WaveConfig};
pub use devices::{input_devices, output_devices};
pub use driver::{create_driver, DeviceRecord, Direction, WaveDevice, WaveDriver, WAVE_MAPPER};
pub use events::EventStream;
pub use format::{BitsPerSample, Channels, WaveFormat};
pub use wave_in::{BufferKey, WaveIn};
pub use wave_out::WaveOut;

/// Custom error types for wave audio I/O
#[derive(thiserror::Error, Debug)]
pub enum WaveError {
    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Device error {code}: {message}")]
    Device { code: u32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WaveError {
    /// Build a device error from a raw driver status and its diagnostic text
    pub fn device(code: u32, message: impl Into<String>) -> Self {
        Self::Device {
            code,
            message: message.into(),
        }
    }

    /// Raw driver status, if this is a device error
    pub fn device_code(&self) -> Option<u32> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WaveError>;

/// Initialize logging for the library
static INIT: Once = Once::new();

pub fn init_logging(default_filter: &str) {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
            .init();
        log::info!("{} v{} starting", LIBRARY_NAME, LIBRARY_VERSION);
    });
}

/// Library version information
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const LIBRARY_NAME: &str = "sotf_wave";
