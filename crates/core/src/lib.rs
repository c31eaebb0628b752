/// Client agents taking part in the round protocol on behalf of the engine under test.
pub mod client;

/// Harness configuration.
pub mod config;

/// Persistent record of a throughput run.
pub mod diary;

/// Clients taking part in an experiment and their roles.
pub mod participant;

/// Saturation search: rate controller, round protocol and the master driving it.
pub mod throughput;

/// Tracing and logging infrastructure.
pub mod tracing;

/// Exports to run a master.
pub mod master {
    pub use crate::config::{MasterConfig, RunContext};
    pub use crate::diary::{Diary, DiaryEntry, RoundRecord};
    pub use crate::throughput::{ControllerSettings, ExperimentMaster, ThroughputError};
}
