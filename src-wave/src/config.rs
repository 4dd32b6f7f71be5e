//! YAML configuration
//!
//! ```yaml
//! driver: loopback
//! output_device: 0
//! input_device: 4294967295   # WAVE_MAPPER
//! channels: 2
//! sample_rate: 44100
//! bits_per_sample: 16
//! buffer_seconds: 1
//! input_buffers: 3
//! loopback:
//!   realtime: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::driver::loopback::{LoopbackConfig, LoopbackDriver};
use crate::driver::{WaveDriver, WAVE_MAPPER};
use crate::format::{BitsPerSample, Channels, WaveFormat, SPS_44KHZ};
use crate::{Result, WaveError};

/// Which driver backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Loopback,
    Winmm,
}

/// Settings for a record/playback session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveConfig {
    pub driver: DriverKind,
    pub output_device: u32,
    pub input_device: u32,
    pub channels: Channels,
    pub sample_rate: u32,
    pub bits_per_sample: BitsPerSample,
    pub buffer_seconds: u32,
    pub input_buffers: usize,
    pub volume_left: u16,
    pub volume_right: u16,
    pub log_filter: String,
    pub loopback: LoopbackConfig,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            output_device: WAVE_MAPPER,
            input_device: WAVE_MAPPER,
            channels: Channels::Stereo,
            sample_rate: SPS_44KHZ,
            bits_per_sample: BitsPerSample::Sixteen,
            buffer_seconds: 1,
            input_buffers: 1,
            volume_left: 0xFFFF,
            volume_right: 0xFFFF,
            log_filter: "info".to_string(),
            loopback: LoopbackConfig::default(),
        }
    }
}

impl WaveConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&contents)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_seconds == 0 {
            return Err(WaveError::Config("buffer_seconds must be at least 1".into()));
        }
        if self.input_buffers == 0 {
            return Err(WaveError::Config("input_buffers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn format(&self) -> WaveFormat {
        WaveFormat::new(self.channels, self.sample_rate, self.bits_per_sample)
    }

    /// Instantiate the configured driver
    pub fn create_driver(&self) -> Result<Arc<dyn WaveDriver>> {
        match self.driver {
            DriverKind::Loopback => Ok(Arc::new(LoopbackDriver::new(self.loopback.clone()))),
            #[cfg(windows)]
            DriverKind::Winmm => Ok(Arc::new(crate::driver::winmm::WinmmDriver::new())),
            #[cfg(not(windows))]
            DriverKind::Winmm => Err(WaveError::Config(
                "the winmm driver is only available on Windows".into(),
            )),
        }
    }
}
