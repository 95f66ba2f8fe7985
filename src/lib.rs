//! Drivers for the instruments of a scanning-capacitance rig: a DT6220
//! capacitance controller, a grbl translation stage and a 34972A data
//! logger, plus the raster scan that ties them together.

pub mod command;
pub mod config;
pub mod controller;
pub mod data_logger;
pub mod error;
pub mod scan;
pub mod sensor;
pub mod session;
pub mod stage;
pub mod transport;

// Re-export the primary types so users can depend on the crate
// without knowing the internal module layout.
pub use command::{Command, Reply};
pub use config::RigConfig;
pub use controller::{Controller, ControllerSettings, TriggerMode};
pub use data_logger::{DataLogger, LoggerSettings, ScanChannel};
pub use error::{Error, Result};
pub use scan::{AxisExtent, Measurement, ScanResult, ScanSettings};
pub use sensor::Sensor;
pub use session::{Framing, Session};
pub use stage::{MachineState, MoveMode, Position, Stage, StageStatus};
pub use transport::{Connector, SerialSettings, TcpSettings, Transport};
