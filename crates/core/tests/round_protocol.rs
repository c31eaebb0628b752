use std::{net::SocketAddr, time::Duration};

use pstb::{
    config::RunContext,
    diary::Diary,
    participant::{Participant, Roster},
    throughput::{pacing_delay_ns, ControllerSettings, ExperimentMaster, ThroughputError, STOP},
};
use testresult::TestResult;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    task::JoinHandle,
};

/// Plays one client: one connection per scripted report line, collecting the
/// master's responses until it answers `STOP!`, the script runs out or the
/// master goes away.
fn scripted_client(addr: SocketAddr, reports: Vec<String>) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut responses = Vec::new();
        for report in reports {
            let Ok(stream) = TcpStream::connect(addr).await else {
                break;
            };
            let mut stream = BufReader::new(stream);
            if stream
                .get_mut()
                .write_all(format!("{report}\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let response = line.trim_end().to_owned();
            let stop = response == STOP;
            responses.push(response);
            if stop {
                break;
            }
        }
        responses
    })
}

fn lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|l| l.to_string()).collect()
}

fn roster() -> Roster {
    Roster::new([Participant::publisher("pub0"), Participant::subscriber("sub0")])
        .expect("valid roster")
}

async fn start_master(
    settings: ControllerSettings,
) -> Result<(SocketAddr, JoinHandle<Result<Diary, ThroughputError>>), ThroughputError> {
    let master = ExperimentMaster::bind("127.0.0.1:0".parse().unwrap(), roster(), settings).await?;
    let addr = master.local_addr();
    Ok((addr, tokio::spawn(master.run())))
}

fn context() -> RunContext {
    RunContext {
        benchmark_id: "it".into(),
        engine: "padres".into(),
        topology: "pair".into(),
        distributed: false,
        protocol: "socket".into(),
        period_length_ms: 1000,
        message_size: "small".into(),
        num_attributes: 1,
        attribute_ratio: "1".into(),
        run_number: 0,
        name: "TPMaster".into(),
    }
}

#[test_log::test(tokio::test)]
async fn converges_to_window_average() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let publisher = scripted_client(addr, lines(&["pub0_0_0"; 5]));
    let subscriber = scripted_client(
        addr,
        lines(&["sub0_0_0", "sub0_10_1.5", "sub0_60_2", "sub0_12_3", "sub0_99_9"]),
    );

    let diary = master.await??;
    let expected = vec![
        pacing_delay_ns(10.0, 1).to_string(),
        pacing_delay_ns(30.0, 1).to_string(),
        pacing_delay_ns(50.0, 1).to_string(),
        STOP.to_owned(),
    ];
    assert_eq!(expected[0], "100000000");
    // every client sees the same decision in every round, stop included
    assert_eq!(publisher.await?, expected);
    assert_eq!(subscriber.await?, expected);

    let rounds: Vec<_> = diary.rounds().collect();
    assert_eq!(
        rounds.iter().map(|r| r.round).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        rounds.iter().map(|r| r.current_throughput).collect::<Vec<_>>(),
        vec![10.0, 30.0, 4.0]
    );
    assert_eq!(rounds[0].round_latency, 1.5);
    assert_eq!(rounds[2].secant, Some(4.0 / 50.0));
    let final_throughput = diary.final_throughput().expect("finished diary");
    assert!((final_throughput - 40.0 / 3.0).abs() < 1e-9);

    let dir = tempfile::tempdir()?;
    let path = diary.save(dir.path(), &context())?;
    assert_eq!(
        path.file_name().and_then(|n| n.to_str()),
        Some("it_padres_pair_L_socket_1000_small_1_1_0_TPMaster.dia")
    );
    assert_eq!(Diary::load(&path)?, diary);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn inconclusive_after_bad_rounds() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let publisher = scripted_client(addr, lines(&["pub0_0_0"; 8]));
    let subscriber = scripted_client(addr, lines(&["sub0_0_0"; 8]));

    let diary = master.await??;
    let mut expected = vec![pacing_delay_ns(10.0, 1).to_string(); 5];
    expected.push(STOP.to_owned());
    assert_eq!(publisher.await?, expected);
    assert_eq!(subscriber.await?, expected);

    let rounds: Vec<_> = diary.rounds().collect();
    assert_eq!(rounds.len(), 5);
    assert!(rounds[..4].iter().all(|r| r.moving_average.is_none()));
    assert!(rounds[4].moving_average.is_some_and(f64::is_nan));
    assert!(diary.final_throughput().is_some_and(f64::is_nan));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn malformed_report_aborts_the_run() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let publisher = scripted_client(addr, lines(&["pub0_0_0"]));
    let subscriber = scripted_client(addr, lines(&["sub0 reporting in"]));

    let err = master.await?.unwrap_err();
    assert!(
        matches!(err, ThroughputError::MalformedReport { round: 0, .. }),
        "{err}"
    );
    // nobody gets a decision for an aborted round
    assert!(publisher.await?.is_empty());
    assert!(subscriber.await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_client_aborts_the_run() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let _publisher = scripted_client(addr, lines(&["pub0_0_0"]));
    let _intruder = scripted_client(addr, lines(&["sub9_0_0"]));

    let err = master.await?.unwrap_err();
    assert!(
        matches!(
            err,
            ThroughputError::UnknownClient { round: 0, ref client, .. } if client == "sub9"
        ),
        "{err}"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn duplicate_report_aborts_the_run() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let _first = scripted_client(addr, lines(&["pub0_0_0"]));
    let _second = scripted_client(addr, lines(&["pub0_0_0"]));

    let err = master.await?.unwrap_err();
    assert!(
        matches!(err, ThroughputError::DuplicateReport { round: 0, .. }),
        "{err}"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn client_closing_before_reporting_aborts_the_run() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let publisher = scripted_client(addr, lines(&["pub0_0_0"]));
    let silent = TcpStream::connect(addr).await?;
    drop(silent);

    let err = master.await?.unwrap_err();
    assert!(
        matches!(err, ThroughputError::ClosedBeforeReport { round: 0, .. }),
        "{err}"
    );
    assert!(publisher.await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn client_vanishing_in_a_later_round_aborts_the_run() -> TestResult {
    let (addr, master) = start_master(ControllerSettings::new(Duration::from_secs(1))).await?;

    let publisher = scripted_client(addr, lines(&["pub0_0_0"; 2]));
    let subscriber = scripted_client(addr, lines(&["sub0_0_0"]));
    assert_eq!(
        subscriber.await?,
        vec![pacing_delay_ns(10.0, 1).to_string()]
    );
    // the subscriber shows up for round 1 but hangs up without a report
    drop(TcpStream::connect(addr).await?);

    let err = master.await?.unwrap_err();
    assert!(
        matches!(err, ThroughputError::ClosedBeforeReport { round: 1, .. }),
        "{err}"
    );
    assert_eq!(publisher.await?, vec![pacing_delay_ns(10.0, 1).to_string()]);
    Ok(())
}
