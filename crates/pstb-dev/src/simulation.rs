use std::{
    fmt::Display,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use pstb::{
    client::{ClientConfig, ClientError, ClientRoundAgent, Delivery, PubSubEngine},
    config::{RunContext, DEFAULT_INITIAL_RATE},
    participant::{Participant, Role, Roster},
    throughput::{ControllerSettings, ExperimentMaster},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::task::JoinSet;

/// Runs the master and every client agent in this process against an
/// in-memory broker with a bounded forwarding capacity.
#[derive(clap::Parser, Clone, Debug)]
pub struct SimulateConfig {
    /// Number of publishing clients.
    #[arg(long, default_value_t = 1)]
    publishers: usize,
    /// Number of subscribing clients.
    #[arg(long, default_value_t = 1)]
    subscribers: usize,
    /// Messages per second the broker forwards, anything above is dropped.
    #[arg(long, default_value_t = 100.0, value_parser = parse_capacity)]
    capacity: f64,
    /// Probability of a forwarded message getting lost on its way to each subscriber.
    #[arg(long, default_value_t = 0.0, value_parser = parse_probability)]
    loss: f64,
    /// Seed to use when generating random data. If not provided, a random seed will be used.
    #[arg(long)]
    seed: Option<u64>,
    /// Length of each load period, in milliseconds.
    #[arg(long, default_value_t = 200)]
    period_length_ms: u64,
    #[arg(long, default_value_t = DEFAULT_INITIAL_RATE)]
    initial_rate: f64,
    /// If provided, the diary of the run is saved in this directory.
    #[arg(long)]
    diary_dir: Option<PathBuf>,
}

fn parse_capacity(s: &str) -> Result<f64, String> {
    let capacity: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if capacity.is_finite() && capacity > 0.0 {
        Ok(capacity)
    } else {
        Err(format!("{capacity} is not a positive rate"))
    }
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let p: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{p} is not within [0, 1]"))
    }
}

/// Refills at `rate` tokens per second up to `burst`.
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        let burst = (rate / 10.0).max(1.0);
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct BrokerState {
    bucket: TokenBucket,
    rng: StdRng,
    loss: f64,
    inboxes: Vec<Vec<Delivery>>,
    forwarded: u64,
    dropped: u64,
}

/// Forwards every publication to every subscriber inbox while it has capacity left.
#[derive(Clone)]
struct SimBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl SimBroker {
    fn new(capacity: f64, loss: f64, seed: u64, subscribers: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                bucket: TokenBucket::new(capacity),
                rng: StdRng::seed_from_u64(seed),
                loss,
                inboxes: vec![Vec::new(); subscribers],
                forwarded: 0,
                dropped: 0,
            })),
        }
    }

    fn publish(&self) {
        let mut state = self.state.lock();
        if !state.bucket.try_take() {
            state.dropped += 1;
            return;
        }
        state.forwarded += 1;
        let sent_at = Utc::now();
        let BrokerState {
            rng, loss, inboxes, ..
        } = &mut *state;
        for inbox in inboxes.iter_mut() {
            if *loss > 0.0 && rng.gen_bool(*loss) {
                continue;
            }
            inbox.push(Delivery {
                sent_at,
                received_at: Utc::now(),
            });
        }
    }

    fn drain(&self, inbox: usize) -> Vec<Delivery> {
        std::mem::take(&mut self.state.lock().inboxes[inbox])
    }

    fn stats(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.forwarded, state.dropped)
    }
}

struct SimClient {
    broker: SimBroker,
    inbox: Option<usize>,
}

impl PubSubEngine for SimClient {
    async fn publish(&mut self) -> Result<(), ClientError> {
        self.broker.publish();
        Ok(())
    }

    fn drain_deliveries(&mut self) -> Vec<Delivery> {
        self.inbox
            .map(|inbox| self.broker.drain(inbox))
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct SimulationSummary {
    pub seed: u64,
    pub rounds: usize,
    pub final_throughput: Option<f64>,
    pub forwarded: u64,
    pub dropped: u64,
    pub diary_path: Option<PathBuf>,
}

impl Display for SimulationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "seed: {}", self.seed)?;
        writeln!(f, "rounds: {}", self.rounds)?;
        match self.final_throughput {
            Some(throughput) if throughput.is_nan() => writeln!(f, "final throughput: inconclusive")?,
            Some(throughput) => writeln!(f, "final throughput: {throughput:.3} msg/s")?,
            None => writeln!(f, "final throughput: -")?,
        }
        write!(
            f,
            "broker: {} forwarded, {} dropped",
            self.forwarded, self.dropped
        )?;
        if let Some(path) = &self.diary_path {
            write!(f, "\ndiary: {}", path.display())?;
        }
        Ok(())
    }
}

pub async fn run(config: SimulateConfig) -> anyhow::Result<SimulationSummary> {
    anyhow::ensure!(config.publishers > 0, "at least one publisher is required");
    anyhow::ensure!(config.subscribers > 0, "at least one subscriber is required");
    anyhow::ensure!(config.period_length_ms > 0, "the period length must be positive");
    anyhow::ensure!(
        config.initial_rate.is_finite() && config.initial_rate > 0.0,
        "the initial rate must be positive"
    );

    let seed = config.seed.unwrap_or_else(rand::random);
    let period_length = Duration::from_millis(config.period_length_ms);
    let clients: Vec<(String, Role, Option<usize>)> = (0..config.publishers)
        .map(|i| (format!("pub{i}"), Role::Publisher, None))
        .chain((0..config.subscribers).map(|i| (format!("sub{i}"), Role::Subscriber, Some(i))))
        .collect();
    let roster = Roster::new(
        clients
            .iter()
            .map(|(name, role, _)| Participant::new(name.as_str(), *role)),
    )?;

    let mut settings = ControllerSettings::new(period_length);
    settings.initial_rate = config.initial_rate;
    let master =
        ExperimentMaster::bind(SocketAddr::from(([127, 0, 0, 1], 0)), roster, settings).await?;
    let master_addr = master.local_addr();
    tracing::info!(
        %master_addr,
        seed,
        publishers = config.publishers,
        subscribers = config.subscribers,
        capacity = config.capacity,
        loss = config.loss,
        "Starting simulation"
    );

    let broker = SimBroker::new(config.capacity, config.loss, seed, config.subscribers);
    let master = tokio::spawn(master.run());
    let mut agents = JoinSet::new();
    for (name, role, inbox) in clients {
        let mut agent = ClientRoundAgent::new(
            ClientConfig {
                name,
                role,
                master_addr,
                period_length,
            },
            SimClient {
                broker: broker.clone(),
                inbox,
            },
        );
        agents.spawn(async move { agent.run().await });
    }

    let diary = master.await?.context("master failed")?;
    while let Some(agent) = agents.join_next().await {
        agent?.context("client agent failed")?;
    }

    let diary_path = match &config.diary_dir {
        Some(dir) => {
            let context = RunContext {
                benchmark_id: format!("sim-{seed}"),
                engine: "simulated".into(),
                topology: "in-memory".into(),
                distributed: false,
                protocol: "memory".into(),
                period_length_ms: config.period_length_ms,
                message_size: "small".into(),
                num_attributes: 1,
                attribute_ratio: "1".into(),
                run_number: 0,
                name: pstb::config::DEFAULT_PROCESS_NAME.into(),
            };
            Some(diary.save(dir, &context)?)
        }
        None => None,
    };

    let (forwarded, dropped) = broker.stats();
    Ok(SimulationSummary {
        seed,
        rounds: diary.rounds().count(),
        final_throughput: diary.final_throughput(),
        forwarded,
        dropped,
        diary_path,
    })
}
