//! Request/response discipline over one exclusively owned transport.

use std::time::Duration;

use tracing::debug;

use crate::command::{Command, Reply};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// How commands are wrapped and replies delimited for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub prefix: &'static str,
    pub terminator: &'static str,
    pub delimiter: u8,
}

impl Framing {
    /// Newline-terminated commands and replies (SCPI, grbl).
    pub const LINE: Framing = Framing {
        prefix: "",
        terminator: "\n",
        delimiter: b'\n',
    };
}

/// A live connection plus the framing of one instrument.
///
/// Every exchange borrows the session mutably, so a second command cannot be
/// issued while a reply is outstanding.
pub struct Session<T> {
    device: &'static str,
    transport: T,
    framing: Framing,
}

impl<T: Transport> Session<T> {
    pub fn new(device: &'static str, transport: T, framing: Framing) -> Self {
        Self {
            device,
            transport,
            framing,
        }
    }

    pub fn device(&self) -> &'static str {
        self.device
    }

    /// Write a command that the instrument does not answer.
    pub fn write(&mut self, command: &Command) -> Result<()> {
        self.write_framed(command, self.framing.terminator)
    }

    /// Write a command and read its single-line reply.
    pub fn send(&mut self, command: &Command) -> Result<Reply> {
        self.write(command)?;
        self.read_reply()
    }

    /// Like [`send`](Self::send) but without the line terminator, for
    /// single-byte real-time requests.
    pub fn send_realtime(&mut self, command: &Command) -> Result<Reply> {
        self.write_framed(command, "")?;
        self.read_reply()
    }

    /// Write a command and collect reply lines up to and including the first
    /// one for which `is_last` holds.
    pub fn send_until(
        &mut self,
        command: &Command,
        is_last: impl Fn(&Reply) -> bool,
    ) -> Result<Vec<Reply>> {
        self.write(command)?;
        let mut replies = Vec::new();
        loop {
            let reply = self.read_reply()?;
            let done = is_last(&reply);
            replies.push(reply);
            if done {
                return Ok(replies);
            }
        }
    }

    pub fn read_reply(&mut self) -> Result<Reply> {
        let line = self.transport.read_until(self.framing.delimiter)?;
        let reply = Reply::from_line(line)?;
        debug!("{} reply <- {}", self.device, reply);
        Ok(reply)
    }

    /// Read whatever lines are pending until the link goes quiet for one
    /// timeout period. Trailing bytes without a delimiter (prompts, telnet
    /// negotiation) are thrown away.
    pub fn drain(&mut self) -> Result<Vec<Reply>> {
        let mut replies = Vec::new();
        loop {
            match self.read_reply() {
                Ok(reply) => replies.push(reply),
                Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }
        let dropped = self.transport.discard_pending();
        if dropped > 0 {
            debug!("{} discarded {} unterminated byte(s)", self.device, dropped);
        }
        Ok(replies)
    }

    /// Run `f` with a different read timeout, restoring the previous one
    /// afterwards whatever `f` returns.
    pub fn with_timeout<R>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let previous = self.transport.timeout();
        self.transport.set_timeout(timeout);
        let result = f(self);
        self.transport.set_timeout(previous);
        result
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn write_framed(&mut self, command: &Command, terminator: &str) -> Result<()> {
        debug!("{} write -> {}", self.device, command);
        let framed = format!("{}{}{}", self.framing.prefix, command, terminator);
        self.transport.write_all(framed.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn session(mock: MockTransport) -> Session<MockTransport> {
        Session::new("test", mock, Framing::LINE)
    }

    #[test]
    fn send_is_one_write_and_one_read() {
        let mut s = session(MockTransport::new().reply("+1.0\n"));
        let reply = s.send(&Command::new("route:mon:data?")).unwrap();
        assert_eq!(reply.text(), "+1.0");
        assert_eq!(s.transport().written(), ["route:mon:data?\n"]);
    }

    #[test]
    fn prefix_and_terminator_frame_the_command() {
        let framing = Framing {
            prefix: "$",
            terminator: "\r\n",
            delimiter: b'\n',
        };
        let mut s = Session::new("dt6220", MockTransport::new().reply("$VER1.0OK\r\n"), framing);
        s.send(&Command::new("VER")).unwrap();
        assert_eq!(s.transport().written(), ["$VER\r\n"]);
    }

    #[test]
    fn silent_device_times_out() {
        let mut s = session(MockTransport::new().silent());
        let err = s.send(&Command::new("*IDN?")).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn send_until_stops_at_the_last_line() {
        let mut s = session(MockTransport::new().reply("$100=250.000\n$101=250.000\nok\n"));
        let lines = s
            .send_until(&Command::new("$$"), |r| r.text() == "ok")
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].text(), "$101=250.000");
    }

    #[test]
    fn realtime_request_has_no_terminator() {
        let mut s = session(MockTransport::new().reply("<Idle,MPos:0.000,0.000,0.000>\r\n"));
        s.send_realtime(&Command::new("?")).unwrap();
        assert_eq!(s.transport().written(), ["?"]);
    }

    #[test]
    fn drain_returns_banner_and_stops_quietly() {
        let mut s = session(MockTransport::new().preload(b"\r\nGrbl 0.9j ['$' for help]\r\n"));
        let lines = s.drain().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text(), "Grbl 0.9j ['$' for help]");
    }

    #[test]
    fn drain_drops_an_unterminated_prompt() {
        let mock = MockTransport::new()
            .preload(b"Welcome\r\nDT6220>")
            .reply("$VER1.0OK\r\n");
        let mut s = session(mock);
        let lines = s.drain().unwrap();
        assert_eq!(lines.len(), 1);
        let reply = s.send(&Command::new("$VER")).unwrap();
        assert_eq!(reply.text(), "$VER1.0OK");
    }

    #[test]
    fn with_timeout_restores_previous_timeout() {
        let mut s = session(MockTransport::new());
        let before = s.transport().timeout();
        let seen = s
            .with_timeout(Duration::from_secs(60), |s| Ok(s.transport().timeout()))
            .unwrap();
        assert_eq!(seen, Duration::from_secs(60));
        assert_eq!(s.transport().timeout(), before);
    }
}
