//! Line-oriented wire contract between the master and the client agents.
//!
//! Every round a client opens a new connection, writes one report line and
//! reads back one response line before the master closes the connection:
//!
//! ```text
//! client -> master: <clientName>_<messagesDelivered>_<averageDeliveryDelay>\n
//! master -> client: <pacingDelayNanos>\n   or   STOP!\n
//! ```

use std::{fmt::Display, str::FromStr};

/// Field separator in report lines.
pub const REPORT_SEPARATOR: char = '_';
/// Response telling a client to leave its round loop.
pub const STOP: &str = "STOP!";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected `<name>_<delivered>_<delay>`")]
    MissingFields,
    #[error("client name is empty")]
    EmptyClientName,
    #[error("invalid delivered message count `{0}`")]
    InvalidCount(String),
    #[error("invalid delivery delay `{0}`")]
    InvalidDelay(String),
    #[error("invalid response `{0}`")]
    InvalidResponse(String),
}

/// Per-round statistics reported by a single client.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub client_name: String,
    pub messages_delivered: u64,
    pub average_delivery_delay: f64,
}

impl RoundReport {
    pub fn new(client_name: impl Into<String>, delivered: u64, delay: f64) -> Self {
        Self {
            client_name: client_name.into(),
            messages_delivered: delivered,
            average_delivery_delay: delay,
        }
    }

    /// Publishers have no deliveries of their own and report neutral values.
    pub fn neutral(client_name: impl Into<String>) -> Self {
        Self::new(client_name, 0, 0.0)
    }
}

impl Display for RoundReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{REPORT_SEPARATOR}{}{REPORT_SEPARATOR}{}",
            self.client_name, self.messages_delivered, self.average_delivery_delay
        )
    }
}

impl FromStr for RoundReport {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        // split from the right so client names may themselves contain separators
        let mut fields = line.rsplitn(3, REPORT_SEPARATOR);
        let (Some(delay), Some(delivered), Some(name)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(ProtocolError::MissingFields);
        };
        if name.is_empty() {
            return Err(ProtocolError::EmptyClientName);
        }
        let messages_delivered = delivered
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidCount(delivered.to_owned()))?;
        let average_delivery_delay = delay
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidDelay(delay.to_owned()))?;
        Ok(Self {
            client_name: name.to_owned(),
            messages_delivered,
            average_delivery_delay,
        })
    }
}

/// The master's answer to a report, identical for every client of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Keep going, sending one message every `pacing_delay_ns` nanoseconds.
    Continue { pacing_delay_ns: u64 },
    Stop,
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Continue { pacing_delay_ns } => write!(f, "{pacing_delay_ns}"),
            Response::Stop => write!(f, "{STOP}"),
        }
    }
}

impl FromStr for Response {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line == STOP {
            return Ok(Response::Stop);
        }
        line.parse()
            .map(|pacing_delay_ns| Response::Continue { pacing_delay_ns })
            .map_err(|_| ProtocolError::InvalidResponse(line.to_owned()))
    }
}
