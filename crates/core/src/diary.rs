//! Round-by-round record of a throughput experiment.
//!
//! The diary is append-only: the master appends one [`RoundRecord`] per
//! processed round and closes it with a single [`DiaryEntry::Final`] entry.
//! It is persisted with `bincode`, which keeps every `f64` bit-exact
//! (including the NaN written for inconclusive runs).

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::config::RunContext;

/// File extension used for persisted diaries.
pub const DIARY_EXTENSION: &str = "dia";

#[derive(Debug, thiserror::Error)]
pub enum DiaryError {
    #[error("diary I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode or decode diary {path}: {source}")]
    Codec {
        path: PathBuf,
        source: bincode::Error,
    },
}

/// A point on the throughput-vs-rate curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    /// Offered rate (messages per second).
    pub x: f64,
    /// Measured throughput (messages per second).
    pub y: f64,
}

impl RatePoint {
    pub const ORIGIN: RatePoint = RatePoint { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Outcome of one processed round.
///
/// Fields only computed when the round carried a usable signal are optional:
/// a round whose throughput was not positive only records the aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    /// Offered rate in effect during the round, before any update.
    pub offered_rate: f64,
    pub delivered_count: u64,
    pub round_latency: f64,
    pub current_throughput: f64,
    pub current_ratio: Option<f64>,
    pub secant: Option<f64>,
    pub window_start: Option<RatePoint>,
    pub window_end: Option<RatePoint>,
    pub moving_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiaryEntry {
    Round(RoundRecord),
    /// Closing entry; NaN when the experiment was inconclusive.
    Final { final_throughput: f64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diary {
    entries: Vec<DiaryEntry>,
}

impl Diary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&mut self, record: RoundRecord) {
        debug_assert!(
            !self.is_finished(),
            "cannot append rounds to a finished diary"
        );
        self.entries.push(DiaryEntry::Round(record));
    }

    pub fn finish(&mut self, final_throughput: f64) {
        debug_assert!(!self.is_finished(), "diary already finished");
        self.entries.push(DiaryEntry::Final { final_throughput });
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.entries.last(), Some(DiaryEntry::Final { .. }))
    }

    pub fn entries(&self) -> &[DiaryEntry] {
        &self.entries
    }

    pub fn rounds(&self) -> impl Iterator<Item = &RoundRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            DiaryEntry::Round(record) => Some(record),
            DiaryEntry::Final { .. } => None,
        })
    }

    pub fn final_throughput(&self) -> Option<f64> {
        self.entries.iter().rev().find_map(|entry| match entry {
            DiaryEntry::Final { final_throughput } => Some(*final_throughput),
            DiaryEntry::Round(_) => None,
        })
    }

    /// Writes the diary to `<dir>/<context>.dia`, returning the file path.
    pub fn save(&self, dir: &Path, context: &RunContext) -> Result<PathBuf, DiaryError> {
        let path = dir.join(format!("{context}.{DIARY_EXTENSION}"));
        let io_err = |source| DiaryError::Io {
            path: path.clone(),
            source,
        };
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut writer = BufWriter::new(File::create(&path).map_err(io_err)?);
        bincode::serialize_into(&mut writer, self).map_err(|source| DiaryError::Codec {
            path: path.clone(),
            source,
        })?;
        writer.flush().map_err(io_err)?;
        tracing::debug!(path = %path.display(), entries = self.entries.len(), "Diary recorded");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, DiaryError> {
        let file = File::open(path).map_err(|source| DiaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| DiaryError::Codec {
            path: path.to_path_buf(),
            source,
        })
    }
}
