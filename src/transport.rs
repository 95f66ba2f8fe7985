//! Byte links to the instruments.
//!
//! Every instrument on the rig is reached either through a serial port or a
//! TCP socket. Both are blocking streams polled with a short OS level read
//! timeout, so a single buffered reader ([`StreamTransport`]) serves both.
//! Reads are bounded by a deadline: a reply that does not arrive in time fails
//! with [`Error::Timeout`] instead of blocking forever.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::debug;

use crate::error::{Error, Result};

const READ_CHUNK: usize = 4096;

/// OS read timeout of the underlying streams. The session deadline is
/// checked at least this often.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type SerialTransport = StreamTransport<Box<dyn SerialPort>>;
pub type TcpTransport = StreamTransport<TcpStream>;

/// A half-duplex byte link with a bounded read timeout.
pub trait Transport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to and including `delimiter`.
    fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>>;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// Drop received bytes that do not yet form a complete reply.
    fn discard_pending(&mut self) -> usize;
}

/// Something that can open a fresh [`Transport`], e.g. the settings of a port.
pub trait Connector {
    type Transport: Transport;

    fn open(&self) -> Result<Self::Transport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_serial_timeout_ms")]
    pub timeout_ms: u64,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_serial_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

impl TcpSettings {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Connector for SerialSettings {
    type Transport = SerialTransport;

    fn open(&self) -> Result<SerialTransport> {
        open_serial(self)
    }
}

impl Connector for TcpSettings {
    type Transport = TcpTransport;

    fn open(&self) -> Result<TcpTransport> {
        open_tcp(self)
    }
}

pub fn open_serial(settings: &SerialSettings) -> Result<SerialTransport> {
    let port = serialport::new(&settings.port, settings.baud_rate)
        .timeout(POLL_INTERVAL)
        .open()
        .map_err(|e| Error::ConnectionUnavailable {
            target: settings.port.clone(),
            reason: e.to_string(),
        })?;
    debug!(
        "serial port {} opened at {} baud",
        settings.port, settings.baud_rate
    );
    Ok(StreamTransport::new(
        port,
        settings.port.clone(),
        settings.timeout(),
    ))
}

pub fn open_tcp(settings: &TcpSettings) -> Result<TcpTransport> {
    let address = settings.address();
    let unavailable = |reason: String| Error::ConnectionUnavailable {
        target: address.clone(),
        reason,
    };
    let timeout = settings.timeout();

    let resolved = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| unavailable(e.to_string()))?
        .next()
        .ok_or_else(|| unavailable("host did not resolve".to_string()))?;
    let stream = TcpStream::connect_timeout(&resolved, timeout)
        .map_err(|e| unavailable(e.to_string()))?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    debug!("connected to {}", address);
    Ok(StreamTransport::new(stream, address, timeout))
}

/// Buffered line/frame reader over any blocking stream.
///
/// Bytes that arrive after a delimiter stay in the buffer for the next read.
pub struct StreamTransport<S> {
    stream: S,
    peer: String,
    timeout: Duration,
    pending: Vec<u8>,
}

impl<S: Read + Write> StreamTransport<S> {
    /// `stream` must already carry a short OS read timeout, otherwise a
    /// silent peer blocks a read past the deadline.
    pub fn new(stream: S, peer: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream,
            peer: peer.into(),
            timeout,
            pending: Vec::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn fill(&mut self, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout(self.timeout));
        }
        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(Error::ConnectionUnavailable {
                target: self.peer.clone(),
                reason: "connection closed by peer".to_string(),
            }),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                if Instant::now() >= deadline {
                    Err(Error::Timeout(self.timeout))
                } else {
                    Ok(())
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == delimiter) {
                let rest = self.pending.split_off(pos + 1);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }
            self.fill(deadline)?;
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while self.pending.len() < buf.len() {
            self.fill(deadline)?;
        }
        buf.copy_from_slice(&self.pending[..buf.len()]);
        self.pending.drain(..buf.len());
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// In-memory stream: reads from a fixed buffer, then reports a timeout.
    struct Loopback {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Loopback {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.input.read(buf)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(5));
                return Err(ErrorKind::TimedOut.into());
            }
            Ok(n)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn keeps_bytes_after_delimiter_for_next_read() {
        let mut link = StreamTransport::new(
            Loopback::new(b"first\nsecond\n"),
            "loopback",
            Duration::from_millis(50),
        );
        assert_eq!(link.read_until(b'\n').unwrap(), b"first\n");
        assert_eq!(link.read_until(b'\n').unwrap(), b"second\n");
    }

    #[test]
    fn missing_delimiter_times_out() {
        let mut link = StreamTransport::new(
            Loopback::new(b"no newline"),
            "loopback",
            Duration::from_millis(20),
        );
        let started = Instant::now();
        let err = link.read_until(b'\n').unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn read_exact_spans_line_buffer() {
        let mut link = StreamTransport::new(
            Loopback::new(b"ab\ncdef"),
            "loopback",
            Duration::from_millis(50),
        );
        assert_eq!(link.read_until(b'\n').unwrap(), b"ab\n");
        let mut buf = [0u8; 4];
        link.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cdef");
    }

    #[test]
    fn partial_line_can_be_discarded() {
        let mut link = StreamTransport::new(
            Loopback::new(b"line\nprompt>"),
            "loopback",
            Duration::from_millis(20),
        );
        assert_eq!(link.read_until(b'\n').unwrap(), b"line\n");
        assert!(matches!(link.read_until(b'\n'), Err(Error::Timeout(_))));
        assert_eq!(link.discard_pending(), 7);
        assert_eq!(link.discard_pending(), 0);
    }

    #[test]
    fn closed_peer_is_reported_as_unavailable() {
        struct Closed;
        impl Read for Closed {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }
        impl Write for Closed {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut link = StreamTransport::new(Closed, "closed", Duration::from_millis(50));
        let err = link.read_until(b'\n').unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable { .. }));
    }

    #[test]
    fn writes_reach_the_stream() {
        let mut link = StreamTransport::new(Loopback::new(b""), "loopback", Duration::ZERO);
        link.write_all(b"*IDN?\n").unwrap();
        assert_eq!(link.stream.output, b"*IDN?\n");
    }

    #[test]
    fn unreachable_serial_port_is_unavailable() {
        let settings = SerialSettings::new("/dev/kapascan-does-not-exist");
        let err = open_serial(&settings).err().unwrap();
        assert!(matches!(err, Error::ConnectionUnavailable { .. }));
    }

    #[test]
    fn serial_defaults_match_grbl() {
        let settings = SerialSettings::new("/dev/ttyACM0");
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.timeout(), Duration::from_secs(1));
    }
}
