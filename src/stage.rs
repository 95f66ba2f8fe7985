//! X/Y translation stage driven by an Arduino running grbl.
//!
//! grbl answers every G-code or `$` line with `ok`, `error:<msg>` or
//! `ALARM:<msg>`, possibly preceded by feedback lines. The status report is
//! requested with the real-time character `?`, which takes no line terminator
//! and is answered by a single `<...>` line. Both the grbl 0.9 and 1.1 report
//! formats are understood.

use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{Command, Reply, parse_f64};
use crate::error::{Error, Result};
use crate::session::{Framing, Session};
use crate::transport::{SerialSettings, SerialTransport, Transport, open_serial};

const DEVICE: &str = "grbl";

const HOMING_TIMEOUT: Duration = Duration::from_secs(60);

/// Distance kept from the far end of travel when parking.
pub const PARK_MARGIN_MM: f64 = 0.1;

const DECIMALS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
}

impl FromStr for MachineState {
    type Err = ();

    /// Accepts substates such as `Hold:0` or `Door:1`.
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let name = s.split(':').next().unwrap_or_default();
        match name {
            "Idle" => Ok(MachineState::Idle),
            "Run" => Ok(MachineState::Run),
            "Hold" | "Queue" => Ok(MachineState::Hold),
            "Jog" => Ok(MachineState::Jog),
            "Alarm" => Ok(MachineState::Alarm),
            "Door" => Ok(MachineState::Door),
            "Check" => Ok(MachineState::Check),
            "Home" => Ok(MachineState::Home),
            "Sleep" => Ok(MachineState::Sleep),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageStatus {
    pub state: MachineState,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    #[default]
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
        }
    }
}

/// Per-axis machine settings read from `$$`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineLimits {
    /// `$100`, `$101`
    pub steps_per_mm: [f64; 2],
    /// `$110`, `$111`, in mm/min
    pub max_rate: [f64; 2],
    /// `$130`, `$131`, in mm
    pub max_travel: [f64; 2],
}

impl MachineLimits {
    fn from_listing(lines: &[Reply]) -> Result<Self> {
        let settings: Vec<(u16, f64)> = lines.iter().filter_map(parse_setting).collect();
        let get = |key: u16| {
            settings
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .ok_or_else(|| Error::malformed("$$ listing", format!("grbl setting ${key}")))
        };
        Ok(Self {
            steps_per_mm: [get(100)?, get(101)?],
            max_rate: [get(110)?, get(111)?],
            max_travel: [get(130)?, get(131)?],
        })
    }

    /// Feed rate both axes can follow.
    pub fn max_feed(&self) -> f64 {
        self.max_rate[0].min(self.max_rate[1])
    }
}

/// `$100=250.000 (x, step/mm)` (0.9) or `$100=250.000` (1.1).
fn parse_setting(line: &Reply) -> Option<(u16, f64)> {
    let (key, rest) = line.text().trim().strip_prefix('$')?.split_once('=')?;
    let value = rest.split_whitespace().next()?;
    Some((key.parse().ok()?, value.parse().ok()?))
}

/// Whether `value` mm is a whole number of motor steps, after rounding to
/// eight decimals.
pub fn on_grid(value: f64, steps_per_mm: f64) -> bool {
    let steps = (value * steps_per_mm * 1e8).round() / 1e8;
    steps.fract() == 0.0
}

pub struct Stage<T> {
    session: Session<T>,
    limits: MachineLimits,
    work_offset: Option<Position>,
}

impl Stage<SerialTransport> {
    pub fn connect(settings: &SerialSettings) -> Result<Self> {
        info!("connecting to grbl on {}", settings.port);
        Self::new(open_serial(settings)?)
    }
}

impl<T: Transport> Stage<T> {
    /// Take over a freshly opened link: swallow the startup banner and read
    /// the machine settings.
    pub fn new(transport: T) -> Result<Self> {
        let mut session = Session::new(DEVICE, transport, Framing::LINE);
        for line in session.drain()? {
            if !line.is_empty() {
                info!("grbl: {}", line);
            }
        }
        let listing = run(&mut session, &Command::new("$$"))?;
        let limits = MachineLimits::from_listing(&listing)?;
        debug!("grbl limits: {:?}", limits);
        Ok(Self {
            session,
            limits,
            work_offset: None,
        })
    }

    pub fn limits(&self) -> &MachineLimits {
        &self.limits
    }

    pub fn status(&mut self) -> Result<StageStatus> {
        let reply = self.session.send_realtime(&Command::new("?"))?;
        let (status, offset) = parse_status(&reply, self.work_offset)?;
        if offset.is_some() {
            self.work_offset = offset;
        }
        Ok(status)
    }

    pub fn position(&mut self) -> Result<Position> {
        Ok(self.status()?.position)
    }

    /// Run the homing cycle; grbl acknowledges once it has finished.
    pub fn home(&mut self) -> Result<()> {
        info!("homing stage");
        self.session
            .with_timeout(HOMING_TIMEOUT, |s| run(s, &Command::new("$H")))?;
        Ok(())
    }

    /// Clear an alarm lock without homing.
    pub fn unlock(&mut self) -> Result<()> {
        run(&mut self.session, &Command::new("$X"))?;
        Ok(())
    }

    /// Rapid move. Absolute targets must lie within travel; relative
    /// distances within plus/minus travel.
    pub fn move_to(&mut self, x: f64, y: f64, mode: MoveMode) -> Result<()> {
        let [tx, ty] = self.limits.max_travel;
        let cmd = match mode {
            MoveMode::Absolute => Command::template("G90 G0 X{} Y{}")
                .float("x", x, DECIMALS, 0.0..=tx)?
                .float("y", y, DECIMALS, 0.0..=ty)?,
            MoveMode::Relative => Command::template("G91 G0 X{} Y{}")
                .float("dx", x, DECIMALS, -tx..=tx)?
                .float("dy", y, DECIMALS, -ty..=ty)?,
        }
        .build();
        run(&mut self.session, &cmd)?;
        Ok(())
    }

    /// Relative feed move, used for manual positioning. The feed is sent in
    /// whole mm/min and checked after rounding.
    pub fn jog(&mut self, dx: f64, dy: f64, feed: f64) -> Result<()> {
        let [tx, ty] = self.limits.max_travel;
        let cmd = Command::template("G91 G1 X{} Y{} F{}")
            .float("dx", dx, DECIMALS, -tx..=tx)?
            .float("dy", dy, DECIMALS, -ty..=ty)?
            .float(
                "feed [mm/min]",
                feed.round(),
                0,
                1.0..=self.limits.max_feed(),
            )?
            .build();
        run(&mut self.session, &cmd)?;
        Ok(())
    }

    /// Block until all queued motion has finished. grbl only acknowledges a
    /// dwell once the planner buffer is empty.
    pub fn synchronize(&mut self, timeout: Duration) -> Result<()> {
        self.session
            .with_timeout(timeout, |s| run(s, &Command::new("G4 P0.01")))?;
        Ok(())
    }

    pub fn on_grid(&self, value: f64, axis: Axis) -> bool {
        on_grid(value, self.limits.steps_per_mm[axis.index()])
    }

    pub fn close(self) -> T {
        self.session.into_inner()
    }
}

/// Send one line and wait for its `ok`. Returns the feedback lines before it.
fn run<T: Transport>(session: &mut Session<T>, cmd: &Command) -> Result<Vec<Reply>> {
    let mut lines = session.send_until(cmd, is_final)?;
    let last = lines.pop().unwrap_or_else(|| Reply::new(""));
    if last.text().trim() == "ok" {
        return Ok(lines);
    }
    Err(Error::Rejected {
        device: DEVICE,
        command: cmd.text().to_string(),
        message: last.text().trim().to_string(),
    })
}

fn is_final(reply: &Reply) -> bool {
    let text = reply.text().trim();
    text == "ok" || text.starts_with("error") || text.starts_with("ALARM")
}

/// Parse a status report. Work position is taken from `WPos` when present,
/// otherwise `MPos` minus the work offset. grbl 1.1 sends `WCO` only in some
/// reports, so the last known offset is passed in and the one seen, if any,
/// returned.
fn parse_status(
    reply: &Reply,
    known_offset: Option<Position>,
) -> Result<(StageStatus, Option<Position>)> {
    let body = reply
        .text()
        .trim()
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .ok_or_else(|| reply.malformed("status report <...>"))?;

    let state_end = body.find([',', '|']).unwrap_or(body.len());
    let state = body[..state_end]
        .parse::<MachineState>()
        .map_err(|_| reply.malformed("a grbl machine state"))?;

    let offset = coordinates(reply, body, "WCO:")?;
    let position = match coordinates(reply, body, "WPos:")? {
        Some(work) => work,
        None => {
            let machine = coordinates(reply, body, "MPos:")?
                .ok_or_else(|| reply.malformed("WPos or MPos field"))?;
            match offset.or(known_offset) {
                Some(o) => Position {
                    x: machine.x - o.x,
                    y: machine.y - o.y,
                },
                None => machine,
            }
        }
    };

    Ok((StageStatus { state, position }, offset))
}

/// X and Y of the `key` field, e.g. `MPos:1.000,2.000,0.000`.
fn coordinates(reply: &Reply, body: &str, key: &str) -> Result<Option<Position>> {
    let Some(at) = body.find(key) else {
        return Ok(None);
    };
    let mut values = body[at + key.len()..].split([',', '|']);
    let mut next = || -> Result<f64> {
        let value = values
            .next()
            .ok_or_else(|| reply.malformed("x and y coordinates"))?;
        parse_f64(value).map_err(|_| reply.malformed("numeric coordinates"))
    };
    let x = next()?;
    let y = next()?;
    Ok(Some(Position { x, y }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    pub(crate) const SETTINGS_09: &str = "$0=10 (step pulse, usec)\r\n\
        $100=800.000 (x, step/mm)\r\n\
        $101=800.000 (y, step/mm)\r\n\
        $102=250.000 (z, step/mm)\r\n\
        $110=500.000 (x max rate, mm/min)\r\n\
        $111=400.000 (y max rate, mm/min)\r\n\
        $130=200.000 (x max travel, mm)\r\n\
        $131=150.000 (y max travel, mm)\r\n\
        ok\r\n";

    /// A connected mock stage: banner drained, settings read.
    pub(crate) fn grbl() -> MockTransport {
        MockTransport::new()
            .preload(b"\r\nGrbl 0.9j ['$' for help]\r\n")
            .reply(SETTINGS_09)
    }

    fn stage(mock: MockTransport) -> Stage<MockTransport> {
        Stage::new(mock).unwrap()
    }

    #[test]
    fn connect_reads_machine_limits() {
        let s = stage(grbl());
        assert_eq!(s.limits().steps_per_mm, [800.0, 800.0]);
        assert_eq!(s.limits().max_travel, [200.0, 150.0]);
        assert_eq!(s.limits().max_feed(), 400.0);
        assert_eq!(s.session.transport().written(), ["$$\n"]);
    }

    #[test]
    fn grbl_11_settings_without_comments() {
        let listing = "$100=250.000\n$101=250.000\n$110=1000\n$111=1000\n$130=300\n$131=300\nok\n";
        let s = stage(MockTransport::new().reply(listing));
        assert_eq!(s.limits().steps_per_mm, [250.0, 250.0]);
        assert_eq!(s.limits().max_travel, [300.0, 300.0]);
    }

    #[test]
    fn missing_setting_is_malformed() {
        let listing = "$100=250.000\nok\n";
        assert!(matches!(
            Stage::new(MockTransport::new().reply(listing)),
            Err(Error::MalformedReply { .. })
        ));
    }

    #[test]
    fn absolute_move_template() {
        let mut s = stage(grbl().reply("ok\r\n"));
        s.move_to(4.0, 4.25, MoveMode::Absolute).unwrap();
        assert_eq!(s.session.transport().written()[1], "G90 G0 X4.0000 Y4.2500\n");
    }

    #[test]
    fn relative_move_template() {
        let mut s = stage(grbl().reply("ok\r\n"));
        s.move_to(-0.5, 0.0025, MoveMode::Relative).unwrap();
        assert_eq!(s.session.transport().written()[1], "G91 G0 X-0.5000 Y0.0025\n");
    }

    #[test]
    fn move_beyond_travel_is_not_sent() {
        let mut s = stage(grbl());
        let err = s.move_to(250.0, 1.0, MoveMode::Absolute).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { name: "x", .. }));
        let err = s.move_to(1.0, -1.0, MoveMode::Absolute).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { name: "y", .. }));
        assert_eq!(s.session.transport().written().len(), 1);
    }

    #[test]
    fn jog_checks_feed_against_max_rate() {
        let mut s = stage(grbl().reply("ok\r\n"));
        s.jog(0.06, 0.0, 100.0).unwrap();
        assert_eq!(s.session.transport().written()[1], "G91 G1 X0.0600 Y0.0000 F100\n");
        let err = s.jog(0.06, 0.0, 450.0).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { name: "feed [mm/min]", .. }));
    }

    #[test]
    fn feed_rounding_up_past_max_rate_is_not_sent() {
        let listing = SETTINGS_09.replace("$111=400.000", "$111=399.700");
        let mock = MockTransport::new()
            .preload(b"\r\nGrbl 0.9j ['$' for help]\r\n")
            .reply(&listing);
        let mut s = stage(mock);
        let err = s.jog(0.06, 0.0, 399.6).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { name: "feed [mm/min]", .. }));
        assert_eq!(s.session.transport().written(), ["$$\n"]);
    }

    #[test]
    fn error_reply_is_rejected() {
        let mut s = stage(grbl().reply("error: Unsupported command\r\n"));
        let err = s.unlock().unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected { device: "grbl", message, .. } if message == "error: Unsupported command"
        ));
    }

    #[test]
    fn feedback_lines_before_ok_are_skipped() {
        let mut s = stage(grbl().reply("[Caution: Unlocked]\r\nok\r\n"));
        s.unlock().unwrap();
    }

    #[test]
    fn home_waits_for_ok() {
        let mut s = stage(grbl().reply("ok\r\n"));
        s.home().unwrap();
        assert_eq!(s.session.transport().written()[1], "$H\n");
    }

    #[test]
    fn silent_grbl_times_out() {
        let mut s = stage(grbl().silent());
        assert!(matches!(
            s.synchronize(Duration::from_millis(5)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn status_report_grbl_09() {
        let mut s = stage(grbl().reply(
            "<Idle,MPos:-196.000,-146.000,0.000,WPos:4.000,4.250,0.000>\r\n",
        ));
        let status = s.status().unwrap();
        assert_eq!(status.state, MachineState::Idle);
        assert_eq!(status.position, Position { x: 4.0, y: 4.25 });
        assert_eq!(s.session.transport().written()[1], "?");
    }

    #[test]
    fn status_report_grbl_11() {
        let reply = Reply::new("<Hold:0|MPos:12.500,3.000,0.000|FS:0,0>");
        let (status, offset) = parse_status(&reply, None).unwrap();
        assert_eq!(status.state, MachineState::Hold);
        assert_eq!(status.position, Position { x: 12.5, y: 3.0 });
        assert_eq!(offset, None);
    }

    #[test]
    fn grbl_11_machine_position_is_shifted_by_work_offset() {
        let mut s = stage(
            grbl()
                .reply("<Idle|MPos:12.500,3.000,0.000|FS:0,0|WCO:2.500,1.000,0.000>\r\n")
                .reply("<Idle|MPos:13.500,3.000,0.000|FS:0,0>\r\n"),
        );
        assert_eq!(s.position().unwrap(), Position { x: 10.0, y: 2.0 });
        // Later reports omit WCO; the last offset still applies.
        assert_eq!(s.position().unwrap(), Position { x: 11.0, y: 2.0 });
    }

    #[test]
    fn alarm_state_is_recognised() {
        let reply = Reply::new("<Alarm,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>");
        assert_eq!(parse_status(&reply, None).unwrap().0.state, MachineState::Alarm);
    }

    #[test]
    fn unknown_state_is_malformed() {
        let reply = Reply::new("<Dancing,MPos:0.000,0.000,0.000>");
        assert!(matches!(parse_status(&reply, None), Err(Error::MalformedReply { .. })));
        let reply = Reply::new("ok");
        assert!(matches!(parse_status(&reply, None), Err(Error::MalformedReply { .. })));
    }

    #[test]
    fn grid_check_uses_steps_per_mm() {
        assert!(on_grid(4.25, 800.0));
        assert!(on_grid(0.0025, 800.0));
        assert!(!on_grid(0.0025, 250.0));
        assert!(!on_grid(4.0001, 800.0));
    }
}
