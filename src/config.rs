//! Rig description loaded from a TOML file.
//!
//! ```toml
//! [controller]
//! host = "192.168.254.173"
//! sensors = ["1739"]
//!
//! [stage]
//! port = "/dev/ttyACM0"
//!
//! [logger]
//! host = "192.168.254.51"
//!
//! [scan]
//! sampling_time_ms = 0.256
//! data_points = 100
//! logger_channel = 101
//! x = { start = 4.0, stop = 4.25, step = 0.0025 }
//! y = { start = 4.0, stop = 4.0, step = 0.0025 }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerSettings;
use crate::data_logger::LoggerSettings;
use crate::error::{Error, Result};
use crate::scan::ScanSettings;
use crate::transport::SerialSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    pub controller: ControllerSettings,
    pub stage: SerialSettings,
    #[serde(default)]
    pub logger: Option<LoggerSettings>,
    #[serde(default)]
    pub scan: Option<ScanSettings>,
}

impl RigConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: RigConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.sensors.is_empty() {
            return Err(Error::Config(
                "controller.sensors must name at least one sensor".to_string(),
            ));
        }
        self.controller.resolve_sensors()?;
        ensure_timeout("controller.timeout_ms", self.controller.timeout_ms)?;
        ensure_timeout("stage.timeout_ms", self.stage.timeout_ms)?;
        if let Some(logger) = &self.logger {
            ensure_timeout("logger.timeout_ms", logger.timeout_ms)?;
        }
        if let Some(scan) = &self.scan {
            scan.validate()?;
            if scan.logger_channel.is_some() && self.logger.is_none() {
                return Err(Error::Config(
                    "scan.logger_channel requires a [logger] section".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn ensure_timeout(name: &str, timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 {
        return Err(Error::Config(format!("{name} must be at least 1 ms")));
    }
    Ok(())
}
