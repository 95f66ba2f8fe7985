//! Capacitive probes used with the controller.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensor {
    pub serial_nr: &'static str,
    pub name: &'static str,
    /// Controller channel (demodulator) the probe is wired to.
    pub channel: usize,
    /// Measuring range in µm.
    pub range_um: f64,
    /// Diameter of the sensing electrode in mm.
    pub diameter_mm: f64,
}

pub const SENSORS: [Sensor; 4] = [
    Sensor {
        serial_nr: "2011",
        name: "CS2",
        channel: 0,
        range_um: 2000.0,
        diameter_mm: 7.9,
    },
    Sensor {
        serial_nr: "2012",
        name: "CS2",
        channel: 1,
        range_um: 4000.0,
        diameter_mm: 7.9,
    },
    Sensor {
        serial_nr: "1739",
        name: "CS05",
        channel: 1,
        range_um: 1000.0,
        diameter_mm: 3.9,
    },
    Sensor {
        serial_nr: "1161",
        name: "CS02",
        channel: 1,
        range_um: 400.0,
        diameter_mm: 2.3,
    },
];

/// Full scale of the controller's raw readings.
const FULL_SCALE: f64 = 0xFF_FFFF as f64;

impl Sensor {
    pub fn lookup(serial_nr: &str) -> Result<Sensor> {
        SENSORS
            .iter()
            .find(|s| s.serial_nr == serial_nr)
            .copied()
            .ok_or_else(|| Error::UnknownSensor(serial_nr.to_string()))
    }

    /// Convert a raw controller reading to a distance in µm.
    pub fn scale(&self, raw: i32) -> f64 {
        f64::from(raw) / FULL_SCALE * self.range_um
    }
}
