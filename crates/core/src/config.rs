use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    participant::{Participant, Roster, RosterError},
    throughput::ControllerSettings,
};

/// Offered rate, in messages per second across all publishers, of the first period.
pub const DEFAULT_INITIAL_RATE: f64 = 10.0;
/// Secant under which the system is considered saturated.
pub const DEFAULT_TOLERANCE: f64 = 0.1;
/// Gain applied to the secant when raising the offered rate.
pub const DEFAULT_RATE_STEP: f64 = 20.0;
/// Rounds without any delivered message tolerated before the run is declared
/// inconclusive.
pub const DEFAULT_BAD_ROUND_LIMIT: u32 = 4;
/// Number of (rate, throughput) points kept in the sliding window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 10;
/// A window of one point gives up its only point to every secant and leaves
/// nothing to average at saturation.
pub const MIN_WINDOW_CAPACITY: usize = 2;
pub const DEFAULT_DIARY_DIR: &str = "diary";
/// Name this process signs its diaries with.
pub const DEFAULT_PROCESS_NAME: &str = "TPMaster";

const CONTEXT_SEPARATOR: &str = "_";

pub const fn default_listening_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Roster(#[from] RosterError),
}

#[derive(clap::Parser, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// TOML file with the experiment settings. Values given on the command
    /// line or through the environment take precedence over the file.
    #[arg(long, env = "PSTB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub controller: ControllerArgs,

    #[command(flatten)]
    pub roster: RosterArgs,

    #[command(flatten)]
    pub context: ContextArgs,

    /// Directory where the diary of the run is written, default is ./diary
    #[arg(long, env = "PSTB_DIARY_DIR")]
    pub diary_dir: Option<PathBuf>,

    #[arg(long, env = "PSTB_LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkArgs {
    /// Address the master listens on, default is 0.0.0.0
    #[arg(long, env = "PSTB_ADDRESS")]
    pub address: Option<IpAddr>,

    /// Port the master listens on, default lets the OS pick one.
    #[arg(long, env = "PSTB_PORT")]
    pub port: Option<u16>,

    /// File the bound port is written to once the master is listening.
    #[arg(long, env = "PSTB_PORT_FILE")]
    pub port_file: Option<PathBuf>,
}

impl NetworkArgs {
    fn merge(&mut self, other: NetworkArgs) {
        if let Some(address) = other.address {
            self.address.get_or_insert(address);
        }
        if let Some(port) = other.port {
            self.port.get_or_insert(port);
        }
        if let Some(path) = other.port_file {
            self.port_file.get_or_insert(path);
        }
    }
}

#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ControllerArgs {
    /// Length of each load period, in milliseconds.
    #[arg(long, env = "PSTB_PERIOD_LENGTH_MS")]
    pub period_length_ms: Option<u64>,

    /// Offered rate of the first period, in messages per second.
    #[arg(long, env = "PSTB_INITIAL_RATE")]
    pub initial_rate: Option<f64>,

    #[arg(long, env = "PSTB_TOLERANCE")]
    pub tolerance: Option<f64>,

    #[arg(long, env = "PSTB_RATE_STEP")]
    pub rate_step: Option<f64>,

    #[arg(long, env = "PSTB_BAD_ROUND_LIMIT")]
    pub bad_round_limit: Option<u32>,

    #[arg(long, env = "PSTB_WINDOW_CAPACITY")]
    pub window_capacity: Option<usize>,

    /// Abort the whole run after this many seconds.
    #[arg(long, env = "PSTB_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
}

impl ControllerArgs {
    fn merge(&mut self, other: ControllerArgs) {
        self.period_length_ms = self.period_length_ms.or(other.period_length_ms);
        self.initial_rate = self.initial_rate.or(other.initial_rate);
        self.tolerance = self.tolerance.or(other.tolerance);
        self.rate_step = self.rate_step.or(other.rate_step);
        self.bad_round_limit = self.bad_round_limit.or(other.bad_round_limit);
        self.window_capacity = self.window_capacity.or(other.window_capacity);
        self.timeout_secs = self.timeout_secs.or(other.timeout_secs);
    }

    fn build(&self) -> Result<ControllerSettings, ConfigError> {
        let period_length_ms = self
            .period_length_ms
            .ok_or(ConfigError::Missing("period-length-ms"))?;
        if period_length_ms == 0 {
            return Err(invalid("period-length-ms", "must be positive"));
        }
        let mut settings = ControllerSettings::new(Duration::from_millis(period_length_ms));
        if let Some(rate) = self.initial_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(invalid("initial-rate", format!("{rate} is not positive")));
            }
            settings.initial_rate = rate;
        }
        if let Some(tolerance) = self.tolerance {
            if !(tolerance.is_finite() && tolerance > 0.0) {
                return Err(invalid("tolerance", format!("{tolerance} is not positive")));
            }
            settings.tolerance = tolerance;
        }
        if let Some(step) = self.rate_step {
            if !step.is_finite() {
                return Err(invalid("rate-step", format!("{step} is not finite")));
            }
            settings.rate_step = step;
        }
        if let Some(limit) = self.bad_round_limit {
            settings.bad_round_limit = limit;
        }
        if let Some(capacity) = self.window_capacity {
            if capacity < MIN_WINDOW_CAPACITY {
                return Err(invalid(
                    "window-capacity",
                    format!("must hold at least {MIN_WINDOW_CAPACITY} points"),
                ));
            }
            settings.window_capacity = capacity;
        }
        Ok(settings)
    }
}

#[derive(clap::Parser, Debug, Default, Clone)]
pub struct RosterArgs {
    /// Name of a publishing client, repeat for every publisher.
    #[arg(long = "publisher", value_name = "NAME")]
    pub publishers: Vec<String>,

    /// Name of a subscribing client, repeat for every subscriber.
    #[arg(long = "subscriber", value_name = "NAME")]
    pub subscribers: Vec<String>,
}

/// Parameters of the benchmark the run belongs to. They only name the diary.
#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContextArgs {
    /// Identifier shared by all the runs of a benchmark, default is the start time.
    #[arg(long, env = "PSTB_BENCHMARK_ID")]
    pub benchmark_id: Option<String>,

    /// Pub/sub engine under test.
    #[arg(long, env = "PSTB_ENGINE")]
    pub engine: Option<String>,

    /// Topology file of the brokers, only its stem is used.
    #[arg(long, env = "PSTB_TOPOLOGY")]
    pub topology: Option<PathBuf>,

    #[arg(long, env = "PSTB_DISTRIBUTED")]
    pub distributed: Option<bool>,

    #[arg(long, env = "PSTB_PROTOCOL")]
    pub protocol: Option<String>,

    #[arg(long, env = "PSTB_MESSAGE_SIZE")]
    pub message_size: Option<String>,

    #[arg(long, env = "PSTB_NUM_ATTRIBUTES")]
    pub num_attributes: Option<u32>,

    #[arg(long, env = "PSTB_ATTRIBUTE_RATIO")]
    pub attribute_ratio: Option<String>,

    #[arg(long, env = "PSTB_RUN_NUMBER")]
    pub run_number: Option<u32>,

    #[arg(long = "process-name", env = "PSTB_PROCESS_NAME")]
    pub name: Option<String>,
}

impl ContextArgs {
    fn merge(&mut self, other: ContextArgs) {
        self.benchmark_id = self.benchmark_id.take().or(other.benchmark_id);
        self.engine = self.engine.take().or(other.engine);
        self.topology = self.topology.take().or(other.topology);
        self.distributed = self.distributed.or(other.distributed);
        self.protocol = self.protocol.take().or(other.protocol);
        self.message_size = self.message_size.take().or(other.message_size);
        self.num_attributes = self.num_attributes.or(other.num_attributes);
        self.attribute_ratio = self.attribute_ratio.take().or(other.attribute_ratio);
        self.run_number = self.run_number.or(other.run_number);
        self.name = self.name.take().or(other.name);
    }

    fn build(self, period_length_ms: u64) -> RunContext {
        let topology = self
            .topology
            .as_deref()
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "topology".into());
        RunContext {
            benchmark_id: self
                .benchmark_id
                .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()),
            engine: self.engine.unwrap_or_else(|| "padres".into()),
            topology,
            distributed: self.distributed.unwrap_or(false),
            protocol: self.protocol.unwrap_or_else(|| "socket".into()),
            period_length_ms,
            message_size: self.message_size.unwrap_or_else(|| "small".into()),
            num_attributes: self.num_attributes.unwrap_or(1),
            attribute_ratio: self.attribute_ratio.unwrap_or_else(|| "1".into()),
            run_number: self.run_number.unwrap_or(0),
            name: self.name.unwrap_or_else(|| DEFAULT_PROCESS_NAME.into()),
        }
    }
}

/// Layout of the TOML configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkArgs,
    controller: ControllerArgs,
    context: ContextArgs,
    diary_dir: Option<PathBuf>,
    participants: Vec<Participant>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "Reading configuration file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

impl ConfigArgs {
    /// Resolves the arguments, and the configuration file if one was given,
    /// into the settings of a master run.
    pub fn build(mut self) -> Result<MasterConfig, ConfigError> {
        let mut participants = Vec::new();
        if let Some(path) = self.config.as_deref() {
            let file = ConfigFile::read(path)?;
            self.network.merge(file.network);
            self.controller.merge(file.controller);
            self.context.merge(file.context);
            self.diary_dir = self.diary_dir.take().or(file.diary_dir);
            participants = file.participants;
        }

        let settings = self.controller.build()?;
        let participants = self
            .roster
            .publishers
            .into_iter()
            .map(Participant::publisher)
            .chain(self.roster.subscribers.into_iter().map(Participant::subscriber))
            .chain(participants);
        let roster = Roster::new(participants)?;

        let address = self.network.address.unwrap_or(default_listening_address());
        let port = self.network.port.unwrap_or(0);
        let period_length_ms = settings.period_length.as_millis() as u64;

        Ok(MasterConfig {
            listen_addr: SocketAddr::new(address, port),
            port_file: self.network.port_file,
            diary_dir: self
                .diary_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DIARY_DIR)),
            timeout: self.controller.timeout_secs.map(Duration::from_secs),
            settings,
            roster,
            context: self.context.build(period_length_ms),
            log_level: self.log_level,
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Resolved settings of a master run.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    pub port_file: Option<PathBuf>,
    pub diary_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub settings: ControllerSettings,
    pub roster: Roster,
    pub context: RunContext,
    pub log_level: Option<LevelFilter>,
}

/// Identifies a run among all the runs of a benchmark.
///
/// Its display form joins every field with `_` and names the diary file,
/// so the same parameters always produce the same file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub benchmark_id: String,
    pub engine: String,
    pub topology: String,
    pub distributed: bool,
    pub protocol: String,
    pub period_length_ms: u64,
    pub message_size: String,
    pub num_attributes: u32,
    pub attribute_ratio: String,
    pub run_number: u32,
    pub name: String,
}

impl RunContext {
    fn distributed_flag(&self) -> &'static str {
        if self.distributed {
            "D"
        } else {
            "L"
        }
    }
}

impl Display for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let period = self.period_length_ms.to_string();
        let num_attributes = self.num_attributes.to_string();
        let run_number = self.run_number.to_string();
        let fields = [
            self.benchmark_id.as_str(),
            self.engine.as_str(),
            self.topology.as_str(),
            self.distributed_flag(),
            self.protocol.as_str(),
            period.as_str(),
            self.message_size.as_str(),
            num_attributes.as_str(),
            self.attribute_ratio.as_str(),
            run_number.as_str(),
            self.name.as_str(),
        ];
        write!(f, "{}", fields.join(CONTEXT_SEPARATOR))
    }
}

pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        crate::tracing::tracer::init_tracer(level).expect("failed tracing initialization")
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;
    use crate::participant::Role;

    fn args(cli: &[&str]) -> ConfigArgs {
        ConfigArgs::parse_from(std::iter::once("pstb").chain(cli.iter().copied()))
    }

    #[test]
    fn build_from_cli() -> testresult::TestResult {
        let config = args(&[
            "--period-length-ms",
            "1500",
            "--port",
            "4444",
            "--publisher",
            "pub0",
            "--subscriber",
            "sub0",
            "--subscriber",
            "sub1",
            "--benchmark-id",
            "bench",
        ])
        .build()?;

        assert_eq!(config.listen_addr.port(), 4444);
        assert_eq!(config.listen_addr.ip(), default_listening_address());
        assert_eq!(config.settings.period_length, Duration::from_millis(1500));
        assert_eq!(config.settings.initial_rate, DEFAULT_INITIAL_RATE);
        assert_eq!(config.settings.window_capacity, DEFAULT_WINDOW_CAPACITY);
        assert_eq!(config.roster.num_publishers(), 1);
        assert_eq!(config.roster.num_subscribers(), 2);
        assert_eq!(config.roster.role_of("sub1"), Some(Role::Subscriber));
        assert_eq!(config.diary_dir, PathBuf::from(DEFAULT_DIARY_DIR));
        assert!(config.timeout.is_none());
        assert_eq!(
            config.context.to_string(),
            "bench_padres_topology_L_socket_1500_small_1_1_0_TPMaster"
        );
        Ok(())
    }

    #[test]
    fn cli_overrides_file() -> testresult::TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
diary_dir = "/tmp/diaries"

[network]
address = "127.0.0.1"
port = 9000

[controller]
period-length-ms = 2000
tolerance = 0.25
bad-round-limit = 2

[context]
engine = "siena"
topology = "topologies/star.txt"
distributed = true

[[participants]]
name = "pub0"
role = "publisher"

[[participants]]
name = "sub0"
role = "subscriber"
"#
        )?;
        let path = file.path().to_string_lossy().into_owned();
        let config = args(&["--config", &path, "--port", "9100", "--tolerance", "0.5"]).build()?;

        assert_eq!(
            config.listen_addr,
            "127.0.0.1:9100".parse::<SocketAddr>()?
        );
        assert_eq!(config.settings.period_length, Duration::from_secs(2));
        assert_eq!(config.settings.tolerance, 0.5);
        assert_eq!(config.settings.bad_round_limit, 2);
        assert_eq!(config.diary_dir, PathBuf::from("/tmp/diaries"));
        assert_eq!(config.roster.len(), 2);
        assert_eq!(config.context.engine, "siena");
        assert_eq!(config.context.topology, "star");
        assert!(config.context.distributed);
        Ok(())
    }

    #[test]
    fn period_is_required() {
        let err = args(&["--publisher", "pub0"]).build().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("period-length-ms")));
    }

    #[test]
    fn reject_invalid_settings() {
        let err = args(&["--period-length-ms", "0", "--publisher", "p"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "period-length-ms", .. }));

        let err = args(&["--period-length-ms", "10", "--tolerance", "0", "--publisher", "p"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "tolerance", .. }));

        let err = args(&["--period-length-ms", "10", "--window-capacity", "0", "--publisher", "p"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "window-capacity", .. }));
    }

    #[test]
    fn single_point_window_is_rejected() -> testresult::TestResult {
        let err = args(&["--period-length-ms", "10", "--window-capacity", "1", "--publisher", "p"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "window-capacity", .. }));

        let config = args(&["--period-length-ms", "10", "--window-capacity", "2", "--publisher", "p"])
            .build()?;
        assert_eq!(config.settings.window_capacity, MIN_WINDOW_CAPACITY);
        Ok(())
    }

    #[test]
    fn empty_roster_is_rejected() {
        let err = args(&["--period-length-ms", "10"]).build().unwrap_err();
        assert!(matches!(err, ConfigError::Roster(RosterError::Empty)));
    }

    #[test]
    fn distributed_context_name() {
        let context = RunContext {
            benchmark_id: "2024-01-01".into(),
            engine: "siena".into(),
            topology: "line".into(),
            distributed: true,
            protocol: "tcp".into(),
            period_length_ms: 500,
            message_size: "large".into(),
            num_attributes: 4,
            attribute_ratio: "0.5".into(),
            run_number: 3,
            name: "TPMaster".into(),
        };
        assert_eq!(
            context.to_string(),
            "2024-01-01_siena_line_D_tcp_500_large_4_0.5_3_TPMaster"
        );
    }
}
