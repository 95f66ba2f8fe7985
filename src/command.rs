use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Command text ready to be framed and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
}

impl Command {
    /// A command without parameters. CR and LF are stripped, framing is the
    /// session's job.
    pub fn new(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self {
            text: text.chars().filter(|c| !matches!(c, '\r' | '\n')).collect(),
        }
    }

    /// Start a command from a template with `{}` placeholders.
    pub fn template(template: &'static str) -> CommandBuilder {
        CommandBuilder {
            template,
            args: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Fills a template's placeholders in order. Numeric arguments are checked
/// against their accepted range here, before anything can be transmitted.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    template: &'static str,
    args: Vec<String>,
}

impl CommandBuilder {
    pub fn int(mut self, name: &'static str, value: i64, range: RangeInclusive<i64>) -> Result<Self> {
        if !range.contains(&value) {
            return Err(Error::out_of_range(
                name,
                value,
                format!("{}..={}", range.start(), range.end()),
            ));
        }
        self.args.push(value.to_string());
        Ok(self)
    }

    pub fn float(
        mut self,
        name: &'static str,
        value: f64,
        decimals: usize,
        range: RangeInclusive<f64>,
    ) -> Result<Self> {
        if !range.contains(&value) {
            return Err(Error::out_of_range(
                name,
                value,
                format!("{}..={}", range.start(), range.end()),
            ));
        }
        self.args.push(format!("{value:.decimals$}"));
        Ok(self)
    }

    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn build(self) -> Command {
        debug_assert_eq!(
            self.template.matches("{}").count(),
            self.args.len(),
            "argument count does not match template {:?}",
            self.template
        );
        let mut text = String::with_capacity(self.template.len() + 16);
        let mut args = self.args.into_iter();
        let mut pieces = self.template.split("{}");
        if let Some(first) = pieces.next() {
            text.push_str(first);
        }
        for piece in pieces {
            text.push_str(&args.next().unwrap_or_default());
            text.push_str(piece);
        }
        Command::new(text)
    }
}

/// One reply line with the line terminator removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    text: String,
}

impl Reply {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub(crate) fn from_line(line: Vec<u8>) -> Result<Self> {
        let text = String::from_utf8(line)
            .map_err(|e| Error::malformed(String::from_utf8_lossy(e.as_bytes()), "ASCII text"))?;
        Ok(Self::new(text.trim_end_matches(['\r', '\n'])))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Parse the trimmed reply; anything that does not parse is malformed,
    /// never a default.
    pub fn parse<F: FromStr>(&self, expected: &str) -> Result<F> {
        self.text
            .trim()
            .parse::<F>()
            .map_err(|_| self.malformed(expected))
    }

    pub fn to_f64(&self) -> Result<f64> {
        parse_f64(&self.text)
    }

    pub fn to_i64(&self) -> Result<i64> {
        self.parse("an integer")
    }

    pub fn malformed(&self, expected: &str) -> Error {
        Error::malformed(self.text.clone(), expected)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Finite float in plain or scientific notation (`+2.31000000E+01`).
pub(crate) fn parse_f64(input: &str) -> Result<f64> {
    match input.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(Error::malformed(input, "a finite number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_fills_placeholders_in_order() {
        let cmd = Command::template("G90 G0 X{} Y{}")
            .float("x", 4.0, 3, 0.0..=200.0)
            .unwrap()
            .float("y", 4.25, 3, 0.0..=200.0)
            .unwrap()
            .build();
        assert_eq!(cmd.text(), "G90 G0 X4.000 Y4.250");
    }

    #[test]
    fn out_of_range_argument_never_builds() {
        let err = Command::template("TRG{}").int("trigger mode", 4, 0..=3).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { name: "trigger mode", .. }));
    }

    #[test]
    fn nan_is_out_of_range() {
        let err = Command::template("X{}")
            .float("x", f64::NAN, 3, 0.0..=1.0)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn line_breaks_are_stripped_from_commands() {
        assert_eq!(Command::new("VER\r\n").text(), "VER");
        let cmd = Command::template("display:text '{}'").text("A\nB").build();
        assert_eq!(cmd.text(), "display:text 'AB'");
    }

    #[test]
    fn reply_strips_terminator_only() {
        let reply = Reply::from_line(b"  ok\r\n".to_vec()).unwrap();
        assert_eq!(reply.text(), "  ok");
    }

    #[test]
    fn scientific_notation_parses() {
        assert_eq!(Reply::new("+2.31000000E+01").to_f64().unwrap(), 23.1);
        assert_eq!(Reply::new("-1.5e-3\r").to_f64().unwrap(), -0.0015);
    }

    #[test]
    fn garbage_is_malformed_not_zero() {
        assert!(matches!(
            Reply::new("ERR").to_f64(),
            Err(Error::MalformedReply { .. })
        ));
        assert!(matches!(
            Reply::new("nan").to_f64(),
            Err(Error::MalformedReply { .. })
        ));
        assert!(matches!(
            Reply::new("12a").to_i64(),
            Err(Error::MalformedReply { .. })
        ));
    }

    #[test]
    fn non_ascii_bytes_are_malformed() {
        let err = Reply::from_line(vec![0xff, 0xfe, b'\n']).unwrap_err();
        assert!(matches!(err, Error::MalformedReply { .. }));
    }
}
