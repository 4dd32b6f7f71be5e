//! Device enumeration

use crate::driver::{DeviceRecord, Direction, WaveDriver};
use crate::Result;

/// Capability records of every device in `direction`, in id order
pub fn enumerate(driver: &dyn WaveDriver, direction: Direction) -> Result<Vec<DeviceRecord>> {
    let count = driver.device_count(direction);
    log::debug!("{} reports {} {} devices", driver.name(), count, direction);
    (0..count)
        .map(|id| driver.device_caps(direction, id))
        .collect()
}

pub fn output_devices(driver: &dyn WaveDriver) -> Result<Vec<DeviceRecord>> {
    enumerate(driver, Direction::Output)
}

pub fn input_devices(driver: &dyn WaveDriver) -> Result<Vec<DeviceRecord>> {
    enumerate(driver, Direction::Input)
}
