//! DS18B20 thermometers exposed by the Linux 1-Wire sysfs driver.

use super::HardwareError;
use std::path::PathBuf;

pub const DEFAULT_W1_ROOT: &str = "/sys/bus/w1/devices";

#[derive(Debug, Clone)]
pub struct W1Bus {
    root: PathBuf,
}

impl W1Bus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read `<root>/<device>/w1_slave` and return degrees Celsius.
    pub fn read_celsius(&self, device: &str) -> Result<f32, HardwareError> {
        let path = self.root.join(device).join("w1_slave");
        let text = std::fs::read_to_string(&path).map_err(|e| HardwareError::SensorRead {
            sensor: device.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;
        parse_w1_slave(&text).map_err(|reason| HardwareError::SensorRead {
            sensor: device.to_string(),
            reason: reason.to_string(),
        })
    }
}

impl Default for W1Bus {
    fn default() -> Self {
        Self::new(DEFAULT_W1_ROOT)
    }
}

/// Parse the two-line `w1_slave` report. The first line ends in `YES` when
/// the CRC matched; the second carries `t=<millidegrees>`.
pub fn parse_w1_slave(text: &str) -> Result<f32, &'static str> {
    let mut lines = text.lines();
    let crc_line = lines.next().ok_or("empty report")?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err("CRC check failed");
    }
    let data_line = lines.next().ok_or("missing temperature line")?;
    let (_, raw) = data_line.rsplit_once("t=").ok_or("missing t= field")?;
    let millidegrees: i32 = raw.trim().parse().map_err(|_| "malformed temperature")?;
    Ok(millidegrees as f32 / 1000.0)
}
