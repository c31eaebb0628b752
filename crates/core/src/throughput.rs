//! Adaptive throughput controller.
//!
//! The [`ExperimentMaster`] runs a round based barrier protocol with every
//! client agent, feeds the aggregated reports of each round to the
//! [`RateController`] and records the outcome of every round in a
//! [`Diary`](crate::diary::Diary).

use std::{io, net::SocketAddr};

mod controller;
mod handler;
mod master;
pub mod protocol;
mod window;

pub use controller::{pacing_delay_ns, replay, ControllerSettings, RateController};
pub use master::ExperimentMaster;
pub use protocol::{ProtocolError, Response, RoundReport, STOP};

pub(crate) const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Fatal conditions of a throughput run.
///
/// None of them are retried: every round must account for every participant,
/// so a failure anywhere invalidates the experiment.
#[derive(Debug, thiserror::Error)]
pub enum ThroughputError {
    #[error("failed binding the listening socket on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("round {round}: failed accepting a client connection: {source}")]
    Accept { round: u32, source: io::Error },
    #[error("round {round}: connection error with {peer}: {source}")]
    Connection {
        round: u32,
        peer: SocketAddr,
        source: io::Error,
    },
    #[error("round {round}: {peer} closed the connection before reporting")]
    ClosedBeforeReport { round: u32, peer: SocketAddr },
    #[error("round {round}: malformed report {raw:?} from {peer}: {source}")]
    MalformedReport {
        round: u32,
        peer: SocketAddr,
        raw: String,
        source: ProtocolError,
    },
    #[error("round {round}: report {raw:?} from unknown client `{client}`")]
    UnknownClient {
        round: u32,
        client: String,
        raw: String,
    },
    #[error("round {round}: client `{client}` reported more than once ({raw:?})")]
    DuplicateReport {
        round: u32,
        client: String,
        raw: String,
    },
    #[error(
        "round {round}: undefined secant between ({}, {}) and ({}, {})",
        .start.x, .start.y, .end.x, .end.y
    )]
    UndefinedSecant {
        round: u32,
        start: crate::diary::RatePoint,
        end: crate::diary::RatePoint,
    },
    #[error(
        "round {round}: {delivered} messages reported by `{client}` overflow the round's delivered count"
    )]
    DeliveredOverflow {
        round: u32,
        client: String,
        delivered: u64,
    },
    #[error("round {round}: the rate window is empty")]
    EmptyWindow { round: u32 },
    #[error("round {round}: the master stopped listening before publishing a decision")]
    MasterGone { round: u32 },
    #[error("round {round}: a connection handler finished before the decision was published")]
    HandlerExitedEarly { round: u32 },
    #[error("round {round}: connection handler aborted: {source}")]
    HandlerAborted {
        round: u32,
        source: tokio::task::JoinError,
    },
}

impl ThroughputError {
    /// Round in which the failure happened, if it is tied to one.
    pub fn round(&self) -> Option<u32> {
        match self {
            ThroughputError::Bind { .. } => None,
            ThroughputError::Accept { round, .. }
            | ThroughputError::Connection { round, .. }
            | ThroughputError::ClosedBeforeReport { round, .. }
            | ThroughputError::MalformedReport { round, .. }
            | ThroughputError::UnknownClient { round, .. }
            | ThroughputError::DuplicateReport { round, .. }
            | ThroughputError::UndefinedSecant { round, .. }
            | ThroughputError::DeliveredOverflow { round, .. }
            | ThroughputError::EmptyWindow { round }
            | ThroughputError::MasterGone { round }
            | ThroughputError::HandlerExitedEarly { round }
            | ThroughputError::HandlerAborted { round, .. } => Some(*round),
        }
    }
}
