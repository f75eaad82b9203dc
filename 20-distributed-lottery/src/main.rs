use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, info_span, warn, Instrument};

use distributed_lottery::{
    cli::{Cli, Command},
    client::{BatchRunner, ClientConfig},
    server::{Server, ServerConfig},
    shutdown::{self, Outcome},
};

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Server(args) => run_server(args.into()).await,
        Command::Client(args) => run_client(args.into()).await,
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Server::bind(&config).await?;
    let addr = server.local_addr()?;
    info!("server listening on {}", addr);
    info!(
        agencies = config.agencies,
        winning_number = config.winning_number,
        ledger = %config.ledger.display(),
        hello_timeout = ?config.hello_timeout,
        shutdown_grace = ?config.shutdown_grace,
        "server configured"
    );

    if let Err(err) = server.run_until_signal().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    let span = info_span!("client", agency = config.agency);
    async move {
        info!(
            server = %config.server,
            batch_max_amount = config.max_batch_size,
            batch_period = ?config.batch_period,
            dataset = %config.dataset.display(),
            "client configured"
        );

        let (trigger, shutdown) = shutdown::channel();
        tokio::spawn(async move {
            shutdown::signal().await;
            info!("shutdown requested");
            trigger.trigger();
        });

        let runner = BatchRunner::open(config).await.context("failed to load bets")?;
        match runner.run(shutdown).await.context("client run failed")? {
            Outcome::Completed(report) => info!(
                batches = report.batches,
                bets = report.bets,
                winners = report.winners.len(),
                "draw results received"
            ),
            Outcome::Cancelled => info!("client stopped before the draw"),
        }
        Ok(())
    }
    .instrument(span)
    .await
}
