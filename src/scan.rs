//! Raster scans: move the stage over a grid, sample the capacitance probe
//! at every position and optionally log the temperature alongside.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RigConfig;
use crate::controller::{Controller, TriggerMode};
use crate::data_logger::{DataLogger, ScanChannel};
use crate::error::{Error, Result};
use crate::stage::{MachineState, MoveMode, PARK_MARGIN_MM, Position, Stage, on_grid};
use crate::transport::{Connector, SerialTransport, TcpSettings, TcpTransport, Transport};

/// Upper bound for a single move between two grid points to finish.
const MOTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Most grid points along one axis.
pub const MAX_POINTS_PER_AXIS: usize = 100_000;

/// `start..=stop` in increments of `step`, all in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisExtent {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl AxisExtent {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Grid coordinates from `start` up to and including `stop`.
    pub fn points(&self) -> Result<Vec<f64>> {
        for (name, value) in [("start", self.start), ("stop", self.stop), ("step", self.step)] {
            if !value.is_finite() {
                return Err(Error::out_of_range(name, value, "a finite number of mm"));
            }
        }
        if !(self.step > 0.0) {
            return Err(Error::out_of_range("step", self.step, "> 0 mm"));
        }
        if !(self.stop >= self.start) {
            return Err(Error::out_of_range(
                "stop",
                self.stop,
                format!(">= start ({} mm)", self.start),
            ));
        }
        let count = ((self.stop - self.start) / self.step + 0.5).ceil();
        if !(count <= MAX_POINTS_PER_AXIS as f64) {
            return Err(Error::out_of_range(
                "points per axis",
                count,
                format!("1..={MAX_POINTS_PER_AXIS}"),
            ));
        }
        let count = count as usize;
        Ok((0..count)
            .map(|i| self.start + i as f64 * self.step)
            .collect())
    }

    fn values(&self) -> [f64; 3] {
        [self.start, self.stop, self.step]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    pub sampling_time_ms: f64,
    /// Samples averaged at each position.
    pub data_points: usize,
    pub x: AxisExtent,
    pub y: AxisExtent,
    /// `relative` offsets the grid by the stage position at scan start.
    #[serde(default)]
    pub mode: MoveMode,
    /// Reverse the inner axis on every other row.
    #[serde(default)]
    pub serpentine: bool,
    #[serde(default)]
    pub logger_channel: Option<u16>,
}

impl ScanSettings {
    pub fn validate(&self) -> Result<()> {
        if self.data_points == 0 {
            return Err(Error::out_of_range("data points", 0, "1.."));
        }
        self.x.points()?;
        self.y.points()?;
        if let Some(channel) = self.logger_channel {
            ScanChannel::new(channel)?;
        }
        Ok(())
    }

    /// Every extent value must fall on a whole motor step.
    pub fn check_resolution(&self, steps_per_mm: [f64; 2]) -> Result<()> {
        for (extent, steps) in [self.x, self.y].iter().zip(steps_per_mm) {
            for value in extent.values() {
                if !on_grid(value, steps) {
                    return Err(Error::OffGrid {
                        value,
                        steps_per_mm: steps,
                    });
                }
            }
        }
        Ok(())
    }

    /// X and Y grid vectors shifted by `origin`.
    pub fn grid(&self, origin: Position) -> Result<(Vec<f64>, Vec<f64>)> {
        let shift = |points: Vec<f64>, by: f64| points.into_iter().map(|p| p + by).collect();
        Ok((
            shift(self.x.points()?, origin.x),
            shift(self.y.points()?, origin.y),
        ))
    }
}

/// Visiting order as `(x index, y index)`: X is the outer axis.
pub fn raster(nx: usize, ny: usize, serpentine: bool) -> Vec<(usize, usize)> {
    let mut order = Vec::with_capacity(nx * ny);
    for xi in 0..nx {
        if serpentine && xi % 2 == 1 {
            order.extend((0..ny).rev().map(|yi| (xi, yi)));
        } else {
            order.extend((0..ny).map(|yi| (xi, yi)));
        }
    }
    order
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Mean distance in µm, indexed `[y][x]`.
    pub z: Vec<Vec<f64>>,
    /// Logger readings, indexed `[y][x]`, when a logger channel is monitored.
    pub temperature: Option<Vec<Vec<f64>>>,
}

/// `H:MM:SS`, rounded to the nearest second.
pub fn format_remaining(seconds: f64) -> String {
    let total = (seconds + 0.5).max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
}

pub struct Measurement<C, D, S, L> {
    controller: Controller<C, D>,
    stage: Stage<S>,
    logger: Option<DataLogger<L>>,
    settings: ScanSettings,
    parked: Option<Position>,
}

impl Measurement<TcpTransport, TcpSettings, SerialTransport, TcpTransport> {
    /// Connect every instrument named in `config`. Needs a `[scan]` section.
    pub fn connect(config: &RigConfig) -> Result<Self> {
        let settings = config
            .scan
            .clone()
            .ok_or_else(|| Error::Config("a [scan] section is required".to_string()))?;
        let controller = Controller::connect(&config.controller)?;
        let stage = Stage::connect(&config.stage)?;
        let logger = config
            .logger
            .as_ref()
            .map(DataLogger::connect)
            .transpose()?;
        Self::new(controller, stage, logger, settings)
    }
}

impl<C, D, S, L> Measurement<C, D, S, L>
where
    C: Transport,
    D: Connector,
    S: Transport,
    L: Transport,
{
    pub fn new(
        controller: Controller<C, D>,
        stage: Stage<S>,
        logger: Option<DataLogger<L>>,
        settings: ScanSettings,
    ) -> Result<Self> {
        settings.validate()?;
        if controller.sensors().is_empty() {
            return Err(Error::Config("the controller has no sensors".to_string()));
        }
        if settings.logger_channel.is_some() && logger.is_none() {
            return Err(Error::Config(
                "logger_channel is set but no data logger is connected".to_string(),
            ));
        }
        Ok(Self {
            controller,
            stage,
            logger,
            settings,
            parked: None,
        })
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn controller(&mut self) -> &mut Controller<C, D> {
        &mut self.controller
    }

    pub fn stage(&mut self) -> &mut Stage<S> {
        &mut self.stage
    }

    /// Record the controller status, check the grid against the stepper
    /// resolution, home an alarmed stage and arm the temperature monitor.
    pub fn initialize(&mut self) -> Result<()> {
        self.controller.check_status()?;
        self.settings
            .check_resolution(self.stage.limits().steps_per_mm)?;
        if self.stage.status()?.state == MachineState::Alarm {
            info!("stage is in alarm state, homing");
            self.stage.home()?;
        }
        if let (Some(logger), Some(channel)) = (self.logger.as_mut(), self.settings.logger_channel)
        {
            logger.configure(ScanChannel::new(channel)?)?;
        }
        Ok(())
    }

    pub fn scan(&mut self) -> Result<ScanResult> {
        let Self {
            controller,
            stage,
            logger,
            settings,
            ..
        } = self;

        let origin = match settings.mode {
            MoveMode::Absolute => Position { x: 0.0, y: 0.0 },
            MoveMode::Relative => stage.position()?,
        };
        let (xs, ys) = settings.grid(origin)?;
        controller.set_sampling_time(settings.sampling_time_ms)?;
        controller.set_trigger_mode(TriggerMode::Continuous)?;

        let mut monitor = match settings.logger_channel {
            Some(_) => logger.as_mut(),
            None => None,
        };
        let mut z = vec![vec![0.0; xs.len()]; ys.len()];
        let mut temperature = monitor.as_ref().map(|_| z.clone());

        let order = raster(xs.len(), ys.len(), settings.serpentine);
        let total = order.len();
        let width = total.to_string().len();
        let started = Instant::now();
        for (i, &(xi, yi)) in order.iter().enumerate() {
            stage.move_to(xs[xi], ys[yi], MoveMode::Absolute)?;
            stage.synchronize(MOTION_TIMEOUT)?;

            let data = controller.acquire(settings.data_points)?;
            let samples = data
                .first()
                .ok_or_else(|| Error::Config("the controller has no sensors".to_string()))?;
            z[yi][xi] = samples.iter().sum::<f64>() / samples.len() as f64;

            if let (Some(logger), Some(temperature)) = (monitor.as_mut(), temperature.as_mut()) {
                temperature[yi][xi] = logger.read_monitor()?;
            }

            let done = i + 1;
            let remaining =
                started.elapsed().as_secs_f64() / done as f64 * (total - done) as f64;
            info!(
                "{done:>width$} of {total}  |  remaining: {}",
                format_remaining(remaining)
            );
        }

        Ok(ScanResult {
            x: xs,
            y: ys,
            z,
            temperature,
        })
    }

    /// Park the stage at the far end of travel so a sample can be placed,
    /// remembering where it was.
    pub fn move_away(&mut self) -> Result<Position> {
        let position = self.stage.position()?;
        let [tx, ty] = self.stage.limits().max_travel;
        self.stage
            .move_to(tx - PARK_MARGIN_MM, ty - PARK_MARGIN_MM, MoveMode::Absolute)?;
        self.parked = Some(position);
        Ok(position)
    }

    /// Return to the position saved by [`move_away`](Self::move_away).
    pub fn move_back(&mut self) -> Result<()> {
        match self.parked {
            Some(position) => self.stage.move_to(position.x, position.y, MoveMode::Absolute),
            None => {
                warn!("no parked position to move back to");
                Ok(())
            }
        }
    }

    pub fn move_to_start(&mut self) -> Result<()> {
        let origin = match self.settings.mode {
            MoveMode::Absolute => Position { x: 0.0, y: 0.0 },
            MoveMode::Relative => self.stage.position()?,
        };
        let (xs, ys) = self.settings.grid(origin)?;
        self.stage.move_to(xs[0], ys[0], MoveMode::Absolute)
    }

    /// Clear the logger display and drop every connection.
    pub fn close(self) -> Result<()> {
        if let Some(logger) = self.logger {
            logger.close()?;
        }
        Ok(())
    }
}
