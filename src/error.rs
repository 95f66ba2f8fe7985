use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{target} unavailable: {reason}")]
    ConnectionUnavailable { target: String, reason: String },

    #[error("no complete reply within {0:?}")]
    Timeout(Duration),

    #[error("malformed reply {reply:?}, expected {expected}")]
    MalformedReply { reply: String, expected: String },

    #[error("{name} = {value} is outside the accepted range {allowed}")]
    OutOfRange {
        name: &'static str,
        value: String,
        allowed: String,
    },

    /// The instrument understood the framing but refused the command.
    #[error("{device} rejected {command:?}: {message}")]
    Rejected {
        device: &'static str,
        command: String,
        message: String,
    },

    #[error("{value} mm is not a whole number of steps at {steps_per_mm} steps/mm")]
    OffGrid { value: f64, steps_per_mm: f64 },

    #[error("unknown sensor {0:?}")]
    UnknownSensor(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn out_of_range(
        name: &'static str,
        value: impl ToString,
        allowed: impl ToString,
    ) -> Self {
        Error::OutOfRange {
            name,
            value: value.to_string(),
            allowed: allowed.to_string(),
        }
    }

    pub(crate) fn malformed(reply: impl Into<String>, expected: impl Into<String>) -> Self {
        Error::MalformedReply {
            reply: reply.into(),
            expected: expected.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_message_names_the_parameter() {
        let err = Error::out_of_range("sampling time [µs]", 12, "50..=500000");
        assert_eq!(
            err.to_string(),
            "sampling time [µs] = 12 is outside the accepted range 50..=500000"
        );
    }

    #[test]
    fn timeout_message_carries_duration() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "no complete reply within 250ms");
    }
}
