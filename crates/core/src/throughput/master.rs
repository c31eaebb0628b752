use std::{collections::HashSet, net::SocketAddr};

use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinSet,
};

use crate::{diary::Diary, participant::Roster};

use super::{
    controller::{ControllerSettings, RateController},
    handler::{ReceivedReport, RoundConnectionHandler},
    Response, RoundReport, ThroughputError,
};

type HandlerResult = Result<Result<(), ThroughputError>, tokio::task::JoinError>;

/// Drives every participant through the round protocol until the
/// [`RateController`] stops the experiment.
///
/// Each round the master accepts exactly one connection per participant,
/// waits for all of their reports, evaluates the round, publishes a single
/// decision to every connection at once and waits for all of them to be
/// answered and closed before accepting the next round's connections.
pub struct ExperimentMaster {
    listener: TcpListener,
    local_addr: SocketAddr,
    roster: Roster,
    controller: RateController,
}

impl ExperimentMaster {
    /// Binds the listening socket. Use port 0 to let the OS pick one and
    /// publish [`Self::local_addr`] to the clients.
    pub async fn bind(
        addr: SocketAddr,
        roster: Roster,
        settings: ControllerSettings,
    ) -> Result<Self, ThroughputError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ThroughputError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ThroughputError::Bind { addr, source })?;
        let controller = RateController::new(settings, &roster);
        Ok(Self {
            listener,
            local_addr,
            roster,
            controller,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Runs rounds until the experiment converges or is declared
    /// inconclusive, returning the finished diary.
    ///
    /// Any failure aborts the whole run; the listening socket is closed
    /// before the error is returned.
    pub async fn run(self) -> Result<Diary, ThroughputError> {
        let Self {
            listener,
            local_addr,
            roster,
            mut controller,
        } = self;
        tracing::info!(
            %local_addr,
            participants = roster.len(),
            publishers = roster.num_publishers(),
            subscribers = roster.num_subscribers(),
            "Throughput master started"
        );

        let mut diary = Diary::new();
        let result = run_rounds(&listener, &roster, &mut controller, &mut diary).await;
        drop(listener);

        match result {
            Ok(()) => {
                let final_throughput = controller.final_throughput();
                diary.finish(final_throughput);
                tracing::info!(
                    rounds = controller.round(),
                    final_throughput,
                    "Throughput master finished"
                );
                Ok(diary)
            }
            Err(err) => {
                tracing::error!(round = ?err.round(), "Throughput master failed: {err}");
                Err(err)
            }
        }
    }
}

async fn run_rounds(
    listener: &TcpListener,
    roster: &Roster,
    controller: &mut RateController,
    diary: &mut Diary,
) -> Result<(), ThroughputError> {
    let num_participants = roster.len();
    loop {
        let round = controller.round();
        tracing::info!(round, "Beginning round");

        let (report_tx, mut report_rx) = mpsc::channel(num_participants);
        let (decision_tx, decision_rx) = watch::channel::<Option<Response>>(None);
        let mut handlers = JoinSet::new();

        let mut accepted = 0;
        while accepted < num_participants {
            tracing::debug!(
                round,
                missing = num_participants - accepted,
                "Waiting for connections"
            );
            tokio::select! {
                conn = listener.accept() => {
                    let (stream, peer) =
                        conn.map_err(|source| ThroughputError::Accept { round, source })?;
                    tracing::debug!(round, %peer, "Client connected");
                    let handler = RoundConnectionHandler::new(
                        round,
                        stream,
                        peer,
                        report_tx.clone(),
                        decision_rx.clone(),
                    );
                    handlers.spawn(handler.run());
                    accepted += 1;
                }
                Some(joined) = handlers.join_next() => {
                    return Err(premature_exit(round, joined));
                }
            }
        }
        drop(report_tx);
        drop(decision_rx);
        tracing::debug!(round, "All clients connected");

        let reports = collect_reports(round, roster, &mut report_rx, &mut handlers).await?;
        tracing::info!(round, "All reports received");

        if round != 0 {
            let record = controller.step(&reports)?;
            diary.record_round(record);
        }
        drop(reports);

        let decision = controller.decision();
        decision_tx.send_replace(Some(decision));
        tracing::debug!(round, %decision, "Decision published");

        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(source) => return Err(ThroughputError::HandlerAborted { round, source }),
            }
        }
        tracing::info!(round, "Round complete");

        controller.finish_round();
        if !controller.is_running() {
            return Ok(());
        }
    }
}

async fn collect_reports(
    round: u32,
    roster: &Roster,
    report_rx: &mut mpsc::Receiver<ReceivedReport>,
    handlers: &mut JoinSet<Result<(), ThroughputError>>,
) -> Result<Vec<RoundReport>, ThroughputError> {
    let mut reports = Vec::with_capacity(roster.len());
    let mut reported = HashSet::with_capacity(roster.len());
    while reports.len() < roster.len() {
        tokio::select! {
            Some(received) = report_rx.recv() => {
                let ReceivedReport { report, raw, peer } = received;
                if !roster.contains(&report.client_name) {
                    return Err(ThroughputError::UnknownClient {
                        round,
                        client: report.client_name,
                        raw,
                    });
                }
                if !reported.insert(report.client_name.clone()) {
                    return Err(ThroughputError::DuplicateReport {
                        round,
                        client: report.client_name,
                        raw,
                    });
                }
                tracing::debug!(
                    round,
                    %peer,
                    client = %report.client_name,
                    missing = roster.len() - reports.len() - 1,
                    "Report accepted"
                );
                reports.push(report);
            }
            Some(joined) = handlers.join_next() => {
                return Err(premature_exit(round, joined));
            }
            else => return Err(ThroughputError::HandlerExitedEarly { round }),
        }
    }
    Ok(reports)
}

/// A handler can only finish after the decision is published, so finishing
/// earlier means it failed.
fn premature_exit(round: u32, joined: HandlerResult) -> ThroughputError {
    match joined {
        Ok(Err(err)) => err,
        Ok(Ok(())) => ThroughputError::HandlerExitedEarly { round },
        Err(source) => ThroughputError::HandlerAborted { round, source },
    }
}
