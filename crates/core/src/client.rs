//! Client side of the round protocol.
//!
//! A [`ClientRoundAgent`] wraps one publishing or subscribing client of the
//! engine under test. Every round it reports the statistics of the previous
//! load period to the master and, unless told to stop, runs the next period
//! at the pacing the master asked for.

use std::{future::Future, net::SocketAddr, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::Instant,
};

use crate::{
    participant::Role,
    throughput::{ProtocolError, Response, RoundReport},
};

/// A message received by a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// Time the message spent in the system, in milliseconds.
    pub fn delay_ms(&self) -> f64 {
        let delay = self.received_at - self.sent_at;
        match delay.num_microseconds() {
            Some(micros) => micros as f64 / 1_000.0,
            None => delay.num_milliseconds() as f64,
        }
    }
}

/// The pub/sub engine under test, as seen from one client.
pub trait PubSubEngine: Send {
    /// Performs one load action, usually publishing a single message.
    fn publish(&mut self) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Returns every delivery received since the previous call.
    fn drain_deliveries(&mut self) -> Vec<Delivery>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed connecting to the master at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("round {round}: connection error with the master: {source}")]
    Io { round: u32, source: std::io::Error },
    #[error("round {round}: the master closed the connection without responding")]
    ClosedWithoutResponse { round: u32 },
    #[error("round {round}: {source}")]
    Protocol { round: u32, source: ProtocolError },
    #[error("engine failure: {0}")]
    Engine(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name the client reports under, must be part of the master's roster.
    pub name: String,
    pub role: Role,
    pub master_addr: SocketAddr,
    pub period_length: Duration,
}

pub struct ClientRoundAgent<E> {
    config: ClientConfig,
    engine: E,
}

impl<E: PubSubEngine> ClientRoundAgent<E> {
    pub fn new(config: ClientConfig, engine: E) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Takes part in rounds until the master answers `STOP!`, returning the
    /// number of load periods run.
    pub async fn run(&mut self) -> Result<u32, ClientError> {
        let mut round = 0;
        let mut report = RoundReport::neutral(self.config.name.as_str());
        loop {
            let response = self.exchange(round, &report).await?;
            let pacing_delay_ns = match response {
                Response::Stop => {
                    tracing::info!(client = %self.config.name, rounds = round, "Stopped by the master");
                    return Ok(round);
                }
                Response::Continue { pacing_delay_ns } => pacing_delay_ns,
            };
            round += 1;
            report = match self.config.role {
                Role::Publisher => {
                    self.publish_period(Duration::from_nanos(pacing_delay_ns))
                        .await?
                }
                Role::Subscriber => self.subscribe_period().await,
            };
        }
    }

    async fn exchange(&self, round: u32, report: &RoundReport) -> Result<Response, ClientError> {
        let addr = self.config.master_addr;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        let io_err = |source| ClientError::Io { round, source };

        let mut stream = BufReader::new(stream);
        stream
            .get_mut()
            .write_all(format!("{report}\n").as_bytes())
            .await
            .map_err(io_err)?;
        stream.get_mut().flush().await.map_err(io_err)?;
        tracing::debug!(round, client = %self.config.name, %report, "Report sent");

        let mut line = String::new();
        if stream.read_line(&mut line).await.map_err(io_err)? == 0 {
            return Err(ClientError::ClosedWithoutResponse { round });
        }
        let response = line
            .parse::<Response>()
            .map_err(|source| ClientError::Protocol { round, source })?;
        tracing::debug!(round, client = %self.config.name, %response, "Response received");
        Ok(response)
    }

    async fn publish_period(&mut self, delay: Duration) -> Result<RoundReport, ClientError> {
        let deadline = Instant::now() + self.config.period_length;
        let mut published = 0u64;
        while Instant::now() < deadline {
            self.engine.publish().await?;
            published += 1;
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep_until((Instant::now() + delay).min(deadline)).await;
            }
        }
        tracing::debug!(client = %self.config.name, published, "Load period finished");
        Ok(RoundReport::neutral(self.config.name.as_str()))
    }

    async fn subscribe_period(&mut self) -> RoundReport {
        // deliveries from before this period do not count
        let stale = self.engine.drain_deliveries().len();
        if stale > 0 {
            tracing::debug!(client = %self.config.name, stale, "Purged stale deliveries");
        }
        tokio::time::sleep(self.config.period_length).await;

        let deliveries = self.engine.drain_deliveries();
        let delivered = deliveries.len() as u64;
        let average_delay = if deliveries.is_empty() {
            0.0
        } else {
            deliveries.iter().map(Delivery::delay_ms).sum::<f64>() / deliveries.len() as f64
        };
        tracing::debug!(client = %self.config.name, delivered, average_delay, "Load period finished");
        RoundReport::new(self.config.name.as_str(), delivered, average_delay)
    }
}
