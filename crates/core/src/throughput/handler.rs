use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{mpsc, watch},
};

use super::{Response, RoundReport, ThroughputError};

/// A parsed report together with where it came from, for error reporting.
#[derive(Debug)]
pub(super) struct ReceivedReport {
    pub report: RoundReport,
    pub raw: String,
    pub peer: SocketAddr,
}

/// Serves a single client connection for the duration of one round.
///
/// Reads exactly one report, hands it to the master, waits for the round's
/// decision and writes exactly one response before closing the connection.
pub(super) struct RoundConnectionHandler {
    round: u32,
    peer: SocketAddr,
    stream: BufReader<TcpStream>,
    reports: mpsc::Sender<ReceivedReport>,
    decision: watch::Receiver<Option<Response>>,
}

impl RoundConnectionHandler {
    pub fn new(
        round: u32,
        stream: TcpStream,
        peer: SocketAddr,
        reports: mpsc::Sender<ReceivedReport>,
        decision: watch::Receiver<Option<Response>>,
    ) -> Self {
        Self {
            round,
            peer,
            stream: BufReader::new(stream),
            reports,
            decision,
        }
    }

    fn connection_error(&self, source: std::io::Error) -> ThroughputError {
        ThroughputError::Connection {
            round: self.round,
            peer: self.peer,
            source,
        }
    }

    pub async fn run(mut self) -> Result<(), ThroughputError> {
        let (round, peer) = (self.round, self.peer);

        // awaiting report
        let mut line = String::new();
        let read = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| self.connection_error(e))?;
        if read == 0 {
            return Err(ThroughputError::ClosedBeforeReport { round, peer });
        }
        let raw = line.trim_end().to_owned();
        tracing::debug!(round, %peer, %raw, "Received report");

        // reporting
        let report = raw
            .parse::<RoundReport>()
            .map_err(|source| ThroughputError::MalformedReport {
                round,
                peer,
                raw: raw.clone(),
                source,
            })?;
        let client = report.client_name.clone();
        self.reports
            .send(ReceivedReport { report, raw, peer })
            .await
            .map_err(|_| ThroughputError::MasterGone { round })?;

        // awaiting decision
        let decision = *self
            .decision
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ThroughputError::MasterGone { round })?;
        let Some(response) = decision else {
            return Err(ThroughputError::MasterGone { round });
        };

        // responding
        tracing::debug!(round, %peer, %client, %response, "Sending decision");
        let stream = self.stream.get_mut();
        let result = async {
            stream
                .write_all(format!("{response}\n").as_bytes())
                .await?;
            stream.flush().await?;
            stream.shutdown().await
        }
        .await;
        result.map_err(|e| self.connection_error(e))?;
        tracing::debug!(round, %peer, %client, "Connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// Handler for the accepted side of a loopback connection, plus the client side.
    async fn connected_handler(
        round: u32,
        reports: mpsc::Sender<ReceivedReport>,
        decision: watch::Receiver<Option<Response>>,
    ) -> std::io::Result<(RoundConnectionHandler, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let client = TcpStream::connect(listener.local_addr()?).await?;
        let (stream, peer) = listener.accept().await?;
        Ok((
            RoundConnectionHandler::new(round, stream, peer, reports, decision),
            client,
        ))
    }

    #[tokio::test]
    async fn report_after_master_left() -> testresult::TestResult {
        let (report_tx, report_rx) = mpsc::channel(1);
        let (_decision_tx, decision_rx) = watch::channel(None);
        drop(report_rx);
        let (handler, mut client) = connected_handler(3, report_tx, decision_rx).await?;
        client.write_all(b"pub0_0_0\n").await?;

        let err = handler.run().await.unwrap_err();
        assert!(matches!(err, ThroughputError::MasterGone { round: 3 }), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn decision_never_published() -> testresult::TestResult {
        let (report_tx, mut report_rx) = mpsc::channel(1);
        let (decision_tx, decision_rx) = watch::channel(None);
        let (handler, mut client) = connected_handler(1, report_tx, decision_rx).await?;
        client.write_all(b"sub0_4_1.5\n").await?;

        let handler = tokio::spawn(handler.run());
        let received = report_rx.recv().await.expect("report forwarded");
        assert_eq!(received.report, RoundReport::new("sub0", 4, 1.5));
        drop(decision_tx);

        let err = handler.await?.unwrap_err();
        assert!(matches!(err, ThroughputError::MasterGone { round: 1 }), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn answers_with_the_published_decision() -> testresult::TestResult {
        let (report_tx, mut report_rx) = mpsc::channel(1);
        let (decision_tx, decision_rx) = watch::channel(None);
        let (handler, client) = connected_handler(0, report_tx, decision_rx).await?;
        let mut client = BufReader::new(client);
        client.get_mut().write_all(b"pub0_0_0\n").await?;

        let handler = tokio::spawn(handler.run());
        report_rx.recv().await.expect("report forwarded");
        decision_tx.send_replace(Some(Response::Stop));
        handler.await??;

        let mut line = String::new();
        client.read_line(&mut line).await?;
        assert_eq!(line, "STOP!\n");
        Ok(())
    }
}
