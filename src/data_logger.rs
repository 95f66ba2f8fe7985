//! Agilent 34972A data acquisition unit over its raw SCPI socket.
//!
//! Only a thermocouple temperature reading on one monitored channel is
//! needed on the rig. Configuration commands are not answered by the
//! instrument; only queries (ending in `?`) produce a reply line.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{Command, Reply};
use crate::error::{Error, Result};
use crate::session::{Framing, Session};
use crate::transport::{TcpSettings, TcpTransport, Transport, open_tcp};

const DEVICE: &str = "34972a";

/// Longest text the front panel shows.
pub const DISPLAY_WIDTH: usize = 13;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerSettings {
    pub host: String,
    #[serde(default = "default_scpi_port")]
    pub scpi_port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl LoggerSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scpi_port: default_scpi_port(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn tcp(&self) -> TcpSettings {
        TcpSettings::new(
            &self.host,
            self.scpi_port,
            Duration::from_millis(self.timeout_ms),
        )
    }
}

fn default_scpi_port() -> u16 {
    5025
}

fn default_timeout_ms() -> u64 {
    2000
}

/// A scan channel address `<slot><channel>`, e.g. `101` or `322`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanChannel(u16);

impl ScanChannel {
    pub fn new(address: u16) -> Result<Self> {
        let slot = address / 100;
        let channel = address % 100;
        if !(1..=3).contains(&slot) || !(1..=40).contains(&channel) {
            return Err(Error::out_of_range(
                "scan channel",
                address,
                "slot 1..=3 with channel 01..=40",
            ));
        }
        Ok(Self(address))
    }

    pub fn address(self) -> u16 {
        self.0
    }
}

/// Entry of the instrument's error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemError {
    pub code: i32,
    pub message: String,
}

impl SystemError {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

pub struct DataLogger<T> {
    session: Session<T>,
}

impl DataLogger<TcpTransport> {
    pub fn connect(settings: &LoggerSettings) -> Result<Self> {
        let tcp = settings.tcp();
        info!("connecting to data logger at {}", tcp.address());
        Ok(Self::new(open_tcp(&tcp)?))
    }
}

impl<T: Transport> DataLogger<T> {
    pub fn new(transport: T) -> Self {
        Self {
            session: Session::new(DEVICE, transport, Framing::LINE),
        }
    }

    pub fn identify(&mut self) -> Result<String> {
        Ok(self.query(&Command::new("*IDN?"))?.text().trim().to_string())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.write(&Command::new("*RST"))
    }

    /// Reset the instrument and continuously monitor a type K thermocouple
    /// on `channel`.
    pub fn configure(&mut self, channel: ScanChannel) -> Result<()> {
        let address = i64::from(channel.address());
        let on_channel = |template: &'static str| -> Result<Command> {
            Ok(Command::template(template)
                .int("scan channel", address, 101..=340)?
                .build())
        };
        self.reset()?;
        self.write(&on_channel("configure:temperature tc,k,(@{})")?)?;
        self.write(&on_channel("route:mon:chan (@{})")?)?;
        self.write(&Command::new("route:mon:stat on"))?;
        debug!("monitoring channel {}", channel.address());
        Ok(())
    }

    /// Latest reading of the monitored channel.
    pub fn read_monitor(&mut self) -> Result<f64> {
        self.query(&Command::new("route:mon:data?"))?.to_f64()
    }

    pub fn display(&mut self, text: &str) -> Result<()> {
        ensure_display_text(text)?;
        let cmd = Command::template("display:text '{}'").text(text).build();
        self.write(&cmd)
    }

    pub fn clear_display(&mut self) -> Result<()> {
        self.write(&Command::new("display:text:clear"))
    }

    /// Pop the oldest entry of the error queue (`+0,"No error"` when empty).
    pub fn system_error(&mut self) -> Result<SystemError> {
        let reply = self.query(&Command::new("SYST:ERR?"))?;
        parse_system_error(&reply)
    }

    /// Restore the default display and release the connection.
    pub fn close(mut self) -> Result<T> {
        self.clear_display()?;
        Ok(self.session.into_inner())
    }

    fn write(&mut self, cmd: &Command) -> Result<()> {
        self.session.write(cmd)
    }

    fn query(&mut self, cmd: &Command) -> Result<Reply> {
        let reply = self.session.send(cmd)?;
        if reply.is_empty() {
            return Err(reply.malformed(&format!("a reply to {cmd}")));
        }
        Ok(reply)
    }
}

fn ensure_display_text(text: &str) -> Result<()> {
    let chars = text.chars().count();
    if chars > DISPLAY_WIDTH {
        return Err(Error::out_of_range(
            "display text length",
            chars,
            format!("0..={DISPLAY_WIDTH}"),
        ));
    }
    if !text.is_ascii() || text.contains(['\'', '"']) {
        return Err(Error::out_of_range(
            "display text",
            format!("{text:?}"),
            "printable ASCII without quotes",
        ));
    }
    Ok(())
}

fn parse_system_error(reply: &Reply) -> Result<SystemError> {
    let (code, message) = reply
        .text()
        .trim()
        .split_once(',')
        .ok_or_else(|| reply.malformed("<code>,\"<message>\""))?;
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| reply.malformed("an integer error code"))?;
    Ok(SystemError {
        code,
        message: message.trim().trim_matches('"').to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn configure_writes_the_monitor_sequence_without_reading() {
        let mock = MockTransport::new().silent().silent().silent().silent();
        let mut logger = DataLogger::new(mock);
        logger.configure(ScanChannel::new(101).unwrap()).unwrap();
        assert_eq!(
            logger.session.transport().written(),
            [
                "*RST\n",
                "configure:temperature tc,k,(@101)\n",
                "route:mon:chan (@101)\n",
                "route:mon:stat on\n",
            ]
        );
    }

    #[test]
    fn monitor_reading_parses_scientific_notation() {
        let mock = MockTransport::new().reply("+2.31470000E+01\n");
        let mut logger = DataLogger::new(mock);
        assert_eq!(logger.read_monitor().unwrap(), 23.147);
    }

    #[test]
    fn non_numeric_reading_is_malformed() {
        let mock = MockTransport::new().reply("OVLD\n");
        let mut logger = DataLogger::new(mock);
        assert!(matches!(
            logger.read_monitor(),
            Err(Error::MalformedReply { .. })
        ));
    }

    #[test]
    fn missing_reading_times_out() {
        let mut logger = DataLogger::new(MockTransport::new().silent());
        assert!(matches!(logger.read_monitor(), Err(Error::Timeout(_))));
    }

    #[test]
    fn scan_channel_bounds() {
        assert!(ScanChannel::new(101).is_ok());
        assert!(ScanChannel::new(340).is_ok());
        for bad in [0, 100, 141, 401, 99] {
            assert!(
                matches!(ScanChannel::new(bad), Err(Error::OutOfRange { .. })),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn display_text_is_quoted() {
        let mut logger = DataLogger::new(MockTransport::new().silent());
        logger.display("EXAMPLE").unwrap();
        assert_eq!(logger.session.transport().written(), ["display:text 'EXAMPLE'\n"]);
    }

    #[test]
    fn long_or_quoted_display_text_is_not_sent() {
        let mut logger = DataLogger::new(MockTransport::new());
        assert!(logger.display("FOURTEEN CHARS").is_err());
        assert!(logger.display("it's").is_err());
        assert!(logger.session.transport().written().is_empty());
    }

    #[test]
    fn system_error_queue_entries() {
        let mock = MockTransport::new()
            .reply("+0,\"No error\"\n")
            .reply("-113,\"Undefined header\"\n");
        let mut logger = DataLogger::new(mock);
        let first = logger.system_error().unwrap();
        assert!(!first.is_error());
        assert_eq!(first.message, "No error");
        let second = logger.system_error().unwrap();
        assert_eq!(second.code, -113);
        assert_eq!(second.message, "Undefined header");
    }

    #[test]
    fn close_clears_the_display() {
        let logger = DataLogger::new(MockTransport::new().silent());
        let link = logger.close().unwrap();
        assert_eq!(link.written(), ["display:text:clear\n"]);
    }

    #[test]
    fn identify_trims_reply() {
        let mock = MockTransport::new().reply("Agilent Technologies,34972A,MY49000000,1.17-1.12-02-02\r\n");
        let mut logger = DataLogger::new(mock);
        assert!(logger.identify().unwrap().starts_with("Agilent Technologies,34972A"));
    }
}
