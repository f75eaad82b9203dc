use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use distributed_lottery::{
    client::{BatchRunner, ClientConfig, ClientError, ClientReport},
    server::{Server, ServerConfig},
    shutdown::{self, Outcome},
    store::MemoryBetStore,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::oneshot,
    time::timeout,
};

const AGENCY_ONE: &str = "\
Santiago Lionel,Lorca,30904465,1999-03-17,7574
Joaquin,Barrios,21312312,1998-01-02,12
Maria,Suarez,33444555,2001-07-08,7574
";

const AGENCY_TWO: &str = "Laura,Diaz,40111222,2003-11-30,99\n";

fn write_dataset(dir: &Path, name: &str, contents: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents).with_context(|| format!("writing {name}"))?;
    Ok(path)
}

fn config(agency: u32, server: String, dataset: std::path::PathBuf) -> ClientConfig {
    let mut config = ClientConfig::new(agency, server);
    config.max_batch_size = 2;
    config.poll_interval = Duration::from_millis(20);
    config.dataset = dataset;
    config
}

#[tokio::test]
async fn agencies_receive_their_winners_from_a_live_server() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let server = Server::new(listener, &ServerConfig::new(2, 7574), MemoryBetStore::new());
    let ledger = server.ledger();

    let (stop, stopped) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run_until(async move {
        let _ = stopped.await;
    }));

    let (_trigger, shutdown) = shutdown::channel();
    let one = BatchRunner::open(config(
        1,
        addr.clone(),
        write_dataset(dir.path(), "agency-1.csv", AGENCY_ONE)?,
    ))
    .await?;
    let two = BatchRunner::open(config(
        2,
        addr,
        write_dataset(dir.path(), "agency-2.csv", AGENCY_TWO)?,
    ))
    .await?;

    let (one, two) = timeout(
        Duration::from_secs(5),
        async { tokio::join!(one.run(shutdown.clone()), two.run(shutdown.clone())) },
    )
    .await
    .context("clients did not finish")?;

    assert_eq!(
        one?,
        Outcome::Completed(ClientReport {
            batches: 2,
            bets: 3,
            winners: vec![30_904_465, 33_444_555],
        })
    );
    assert_eq!(
        two?,
        Outcome::Completed(ClientReport {
            batches: 1,
            bets: 1,
            winners: Vec::new(),
        })
    );
    assert_eq!(ledger.load_all()?.len(), 4);

    let _ = stop.send(());
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn shutdown_while_waiting_for_winners_closes_the_socket() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    // Acknowledges every batch, never draws, and reports whether the client
    // hung up.
    let (finished_tx, finished_rx) = oneshot::channel::<()>();
    let fake = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut stream = BufReader::new(stream);
        let mut finished = Some(finished_tx);
        let mut line = String::new();
        loop {
            line.clear();
            if stream.read_line(&mut line).await.expect("read") == 0 {
                return finished.is_none();
            }
            match line.trim_end() {
                "FINISH" => {
                    if let Some(finished) = finished.take() {
                        let _ = finished.send(());
                    }
                }
                record if record.starts_with("BATCH") => {
                    let size: usize = record["BATCH,".len()..].parse().expect("size");
                    for _ in 0..size {
                        line.clear();
                        stream.read_line(&mut line).await.expect("bet");
                    }
                    stream.write_all(b"OK\n").await.expect("ack");
                }
                _ => {}
            }
        }
    });

    let runner = BatchRunner::open(config(
        1,
        addr,
        write_dataset(dir.path(), "agency-1.csv", AGENCY_ONE)?,
    ))
    .await?;
    let (trigger, shutdown) = shutdown::channel();
    let client = tokio::spawn(runner.run(shutdown));

    timeout(Duration::from_secs(2), finished_rx)
        .await
        .context("client never finished sending")??;
    tokio::time::sleep(Duration::from_millis(60)).await;
    trigger.trigger();

    let outcome = timeout(Duration::from_secs(1), client)
        .await
        .context("client ignored shutdown")??;
    assert_eq!(outcome?, Outcome::Cancelled);

    let hung_up = timeout(Duration::from_secs(1), fake)
        .await
        .context("socket left open")??;
    assert!(hung_up, "client closed its socket after FINISH");
    Ok(())
}

#[tokio::test]
async fn rejected_batch_ends_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        while stream.read_line(&mut line).await.expect("read") > 0 {
            if line.starts_with("BATCH") {
                stream.write_all(b"ERR\n").await.expect("reject");
            }
            line.clear();
        }
    });

    let runner = BatchRunner::open(config(
        3,
        addr,
        write_dataset(dir.path(), "agency-3.csv", AGENCY_TWO)?,
    ))
    .await?;
    let (_trigger, shutdown) = shutdown::channel();

    let err = timeout(Duration::from_secs(2), runner.run(shutdown))
        .await
        .context("client hung")?
        .expect_err("server rejected the batch");
    assert!(matches!(err, ClientError::BatchRejected { batch: 1 }));
    Ok(())
}

#[tokio::test]
async fn unreachable_server_is_a_connect_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);

    let runner = BatchRunner::open(config(
        1,
        addr,
        write_dataset(dir.path(), "agency-1.csv", AGENCY_TWO)?,
    ))
    .await?;
    let (_trigger, shutdown) = shutdown::channel();

    let err = runner.run(shutdown).await.expect_err("nobody listens");
    assert!(matches!(err, ClientError::Connect { .. }));
    Ok(())
}
