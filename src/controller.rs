//! Micro-Epsilon capaNCDT DT6220 capacitance controller.
//!
//! The controller exposes two TCP ports: an ASCII control port (telnet,
//! default 23) and a binary data port (default 10001). Commands on the control
//! port are framed as `$<cmd>\r\n` and answered with `$<cmd><payload>OK`.
//! Acquisition starts as soon as the data port is connected; in continuous
//! trigger mode frames stream in at the sampling rate.

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{Command, Reply};
use crate::error::{Error, Result};
use crate::sensor::Sensor;
use crate::session::{Framing, Session};
use crate::transport::{Connector, TcpSettings, TcpTransport, Transport, open_tcp};

const DEVICE: &str = "dt6220";

const FRAMING: Framing = Framing {
    prefix: "$",
    terminator: "\r\n",
    delimiter: b'\n',
};

/// Accepted sampling times in µs.
const SAMPLING_TIME_US: std::ops::RangeInclusive<i64> = 50..=500_000;

const HEADER_LEN: usize = 32;
const SAMPLE_LEN: usize = 4;

/// Quiet period used to swallow the telnet greeting after connecting.
const GREETING_DRAIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Continuous,
    RisingEdge,
    HighLevel,
    GateRisingEdge,
}

impl TriggerMode {
    fn as_value(self) -> i64 {
        match self {
            TriggerMode::Continuous => 0,
            TriggerMode::RisingEdge => 1,
            TriggerMode::HighLevel => 2,
            TriggerMode::GateRisingEdge => 3,
        }
    }
}

/// A status field that differs from the previous `check_status` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub host: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Serial numbers of the attached probes, see [`crate::sensor::SENSORS`].
    pub sensors: Vec<String>,
}

impl ControllerSettings {
    pub fn new(host: impl Into<String>, sensors: &[&str]) -> Self {
        Self {
            host: host.into(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            timeout_ms: default_timeout_ms(),
            sensors: sensors.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn control(&self) -> TcpSettings {
        TcpSettings::new(
            &self.host,
            self.control_port,
            Duration::from_millis(self.timeout_ms),
        )
    }

    pub fn data(&self) -> TcpSettings {
        TcpSettings::new(
            &self.host,
            self.data_port,
            Duration::from_millis(self.timeout_ms),
        )
    }

    pub fn resolve_sensors(&self) -> Result<Vec<Sensor>> {
        self.sensors.iter().map(|s| Sensor::lookup(s)).collect()
    }
}

fn default_control_port() -> u16 {
    23
}

fn default_data_port() -> u16 {
    10001
}

fn default_timeout_ms() -> u64 {
    3000
}

pub struct Controller<T, D> {
    session: Session<T>,
    data: D,
    sensors: Vec<Sensor>,
    last_status: Option<String>,
}

impl Controller<TcpTransport, TcpSettings> {
    pub fn connect(settings: &ControllerSettings) -> Result<Self> {
        let sensors = settings.resolve_sensors()?;
        let control = settings.control();
        info!("connecting to DT6220 control port {}", control.address());
        let transport = open_tcp(&control)?;
        let mut controller = Self::new(transport, settings.data(), sensors);
        let greeting = controller
            .session
            .with_timeout(GREETING_DRAIN, |s| s.drain())?;
        debug!("discarded {} greeting line(s)", greeting.len());
        Ok(controller)
    }
}

impl<T: Transport, D: Connector> Controller<T, D> {
    pub fn new(control: T, data: D, sensors: Vec<Sensor>) -> Self {
        Self {
            session: Session::new(DEVICE, control, FRAMING),
            data,
            sensors,
            last_status: None,
        }
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn version(&mut self) -> Result<String> {
        self.command(&Command::new("VER"))
    }

    /// Data port as reported by the controller.
    pub fn data_port(&mut self) -> Result<u16> {
        let payload = self.command(&Command::new("GDP"))?;
        Reply::new(payload).parse("a TCP port number")
    }

    /// Request a sampling time in ms and return the time the controller
    /// actually chose.
    pub fn set_sampling_time(&mut self, sampling_time_ms: f64) -> Result<f64> {
        let micros = (sampling_time_ms * 1000.0).trunc() as i64;
        let cmd = Command::template("STI{}")
            .int("sampling time [µs]", micros, SAMPLING_TIME_US)?
            .build();
        let payload = self.command(&cmd)?;
        let actual_us = Reply::new(payload.trim_matches(',')).to_f64()?;
        let actual_ms = actual_us / 1000.0;
        info!("sampling time set to {} ms", actual_ms);
        Ok(actual_ms)
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        let cmd = Command::template("TRG{}")
            .int("trigger mode", mode.as_value(), 0..=3)?
            .build();
        self.command(&cmd)?;
        Ok(())
    }

    /// Measurement settings (`STS`) plus the linearization state (`LIN?`),
    /// `;`-separated.
    pub fn status(&mut self) -> Result<String> {
        let settings = self.command(&Command::new("STS"))?;
        let linearization = self.command(&Command::new("LIN?"))?;
        Ok(format!("{settings};LIN{linearization}"))
    }

    /// Compare the current status with the one seen on the previous call and
    /// report every field that changed in between.
    pub fn check_status(&mut self) -> Result<Vec<StatusChange>> {
        let current = self.status()?;
        let changes = match &self.last_status {
            Some(previous) => diff_status(previous, &current),
            None => Vec::new(),
        };
        for change in &changes {
            warn!(
                "DT6220 parameter changed from {} to {}",
                change.previous, change.current
            );
        }
        self.last_status = Some(current);
        Ok(changes)
    }

    /// Trigger a single measurement in the non-continuous trigger modes.
    pub fn trigger(&mut self) -> Result<()> {
        self.command(&Command::new("GMD"))?;
        Ok(())
    }

    /// Apply the optional trigger mode and sampling time ahead of an
    /// acquisition.
    pub fn configure_acquisition(
        &mut self,
        mode: Option<TriggerMode>,
        sampling_time_ms: Option<f64>,
    ) -> Result<()> {
        if let Some(mode) = mode {
            self.set_trigger_mode(mode)?;
        }
        if let Some(ms) = sampling_time_ms {
            self.set_sampling_time(ms)?;
        }
        Ok(())
    }

    /// Acquire `data_points` samples per configured sensor, scaled to µm.
    /// The outer vector follows the sensor order.
    pub fn acquire(&mut self, data_points: usize) -> Result<Vec<Vec<f64>>> {
        let channels: Vec<usize> = self.sensors.iter().map(|s| s.channel).collect();
        let raw = self.acquire_raw(data_points, &channels)?;
        Ok(raw
            .into_iter()
            .zip(&self.sensors)
            .map(|(samples, sensor)| samples.into_iter().map(|v| sensor.scale(v)).collect())
            .collect())
    }

    /// Connect to the data port, read `data_points` frames and return the raw
    /// samples of `channels`, one vector per channel.
    pub fn acquire_raw(&mut self, data_points: usize, channels: &[usize]) -> Result<Vec<Vec<i32>>> {
        if data_points == 0 {
            return Err(Error::out_of_range("data points", 0, "1.."));
        }
        if channels.is_empty() {
            return Err(Error::out_of_range("channels", "[]", "at least one channel"));
        }
        let mut stream = self.data.open()?;
        let samples = read_frames(&mut stream, data_points, channels)?;
        debug!(
            "acquired {} frame(s) on channel(s) {:?}",
            data_points, channels
        );
        Ok(samples)
    }

    pub fn close(self) -> T {
        self.session.into_inner()
    }

    fn command(&mut self, cmd: &Command) -> Result<String> {
        let reply = self.session.send(cmd)?;
        parse_control_reply(cmd, &reply)
    }
}

/// Strip the `$<cmd>` echo and `OK` trailer from a control-port reply.
fn parse_control_reply(cmd: &Command, reply: &Reply) -> Result<String> {
    let echo = format!("${}", cmd.text());
    let rest = reply
        .text()
        .trim()
        .strip_prefix(echo.as_str())
        .ok_or_else(|| reply.malformed(&format!("echo {echo:?}")))?;
    if let Some(payload) = rest.strip_suffix("OK") {
        return Ok(payload.to_string());
    }
    let message = match rest {
        "$UNKNOWN COMMAND" => "unknown command",
        "$WRONG PARAMETER" => "wrong parameter",
        _ => return Err(reply.malformed("payload terminated by OK")),
    };
    Err(Error::Rejected {
        device: DEVICE,
        command: cmd.text().to_string(),
        message: message.to_string(),
    })
}

fn diff_status(previous: &str, current: &str) -> Vec<StatusChange> {
    previous
        .split(';')
        .zip(current.split(';'))
        .filter(|(old, new)| old != new)
        .map(|(old, new)| StatusChange {
            previous: old.to_string(),
            current: new.to_string(),
        })
        .collect()
}

/// Header of one data-port packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub item_nr: i32,
    pub serial_nr: i32,
    pub channels: usize,
    pub bytes_per_frame: usize,
    pub frames: usize,
    pub frame_counter: i32,
}

impl FrameHeader {
    /// Layout (little-endian): preamble[4], item i32, serial i32, channel bit
    /// field u64 (one set bit per present channel), unused[4],
    /// bytes-per-frame i16, frame count i16, frame counter i32.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let i32_at = |at: usize| i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let i16_at = |at: usize| i16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let mut field = [0u8; 8];
        field.copy_from_slice(&bytes[12..20]);
        let channels = u64::from_le_bytes(field).count_ones() as usize;

        let bytes_per_frame = usize::try_from(i16_at(24))
            .map_err(|_| malformed_header(bytes, "non-negative bytes per frame"))?;
        let frames = usize::try_from(i16_at(26))
            .map_err(|_| malformed_header(bytes, "non-negative frame count"))?;
        if bytes_per_frame < channels * SAMPLE_LEN {
            return Err(malformed_header(bytes, "4 bytes per channel and frame"));
        }

        Ok(Self {
            item_nr: i32_at(4),
            serial_nr: i32_at(8),
            channels,
            bytes_per_frame,
            frames,
            frame_counter: i32_at(28),
        })
    }

    pub fn payload_len(&self) -> usize {
        self.bytes_per_frame * self.frames
    }
}

fn malformed_header(bytes: &[u8], expected: &str) -> Error {
    Error::malformed(format!("{bytes:02x?}"), format!("data header with {expected}"))
}

/// Read packets until `data_points` frames were collected. Frames beyond that
/// within the last packet are dropped.
pub fn read_frames<T: Transport>(
    transport: &mut T,
    data_points: usize,
    channels: &[usize],
) -> Result<Vec<Vec<i32>>> {
    let mut samples = vec![Vec::with_capacity(data_points); channels.len()];
    let mut received = 0;
    while received < data_points {
        let mut header = [0u8; HEADER_LEN];
        transport.read_exact(&mut header)?;
        let header = FrameHeader::parse(&header)?;
        if let Some(&channel) = channels.iter().find(|&&c| c >= header.channels) {
            return Err(Error::out_of_range(
                "channel",
                channel,
                format!("0..{} (channels present)", header.channels),
            ));
        }

        let mut payload = vec![0u8; header.payload_len()];
        transport.read_exact(&mut payload)?;
        for frame in payload.chunks_exact(header.bytes_per_frame) {
            if received == data_points {
                break;
            }
            for (out, &channel) in samples.iter_mut().zip(channels) {
                let at = channel * SAMPLE_LEN;
                out.push(i32::from_le_bytes([
                    frame[at],
                    frame[at + 1],
                    frame[at + 2],
                    frame[at + 3],
                ]));
            }
            received += 1;
        }
    }
    Ok(samples)
}
