use std::{
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, field, info, info_span, warn, Instrument};

use crate::{
    bet::AgencyId,
    coordinator::DrawCoordinator,
    handler::{ConnectionHandler, HandlerContext},
    message::TcpConnection,
    registry::AgencyRegistry,
    shutdown::{self, Outcome, Shutdown, ShutdownTrigger},
    store::{BetStore, FileBetStore, Ledger},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub agencies: AgencyId,
    pub winning_number: u32,
    pub ledger: PathBuf,
    pub hello_timeout: Duration,
    /// How long connections get to unwind after shutdown before they are aborted.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn new(agencies: AgencyId, winning_number: u32) -> Self {
        Self {
            listen: "0.0.0.0:12345".to_string(),
            agencies,
            winning_number,
            ledger: PathBuf::from("./bets.csv"),
            hello_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    context: HandlerContext,
    shutdown_grace: Duration,
}

impl Server {
    /// Binds the configured address and keeps bets in the configured ledger file.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config, FileBetStore::new(&config.ledger)))
    }

    pub fn new(listener: TcpListener, config: &ServerConfig, store: impl BetStore + 'static) -> Self {
        let ledger = Arc::new(Ledger::new(store));
        let coordinator = DrawCoordinator::new(
            config.agencies,
            config.winning_number,
            Arc::clone(&ledger),
        );
        Self {
            listener,
            context: HandlerContext {
                coordinator: Arc::new(coordinator),
                ledger,
                registry: Arc::new(AgencyRegistry::new(config.agencies)),
                hello_timeout: config.hello_timeout,
            },
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.context.ledger)
    }

    /// Accepts agencies until `shutdown` completes, then cancels every
    /// connection and waits for all of them to close.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            context,
            shutdown_grace,
        } = self;
        let (trigger, cancel) = shutdown::channel();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context, &cancel, &mut connections);
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "connection task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(
            open = connections.len(),
            agencies = ?context.registry.connected(),
            finished = context.coordinator.finished(),
            drawn = context.coordinator.result().is_some(),
            "server shutting down"
        );
        stop_connections(trigger, connections, shutdown_grace).await;
        Ok(())
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown::signal()).await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &HandlerContext,
    cancel: &Shutdown,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, context, cancel, connections),
        Err(err) => warn!(error = %err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    context: &HandlerContext,
    cancel: &Shutdown,
    connections: &mut JoinSet<()>,
) {
    debug!(%peer, "connection accepted");
    let handler = ConnectionHandler::new(
        TcpConnection::from_stream(stream),
        context.clone(),
        cancel.clone(),
        Some(peer),
    );
    let span = info_span!("connection", %peer, agency = field::Empty);

    connections.spawn(
        async move {
            match handler.run().await {
                Ok(Outcome::Completed(report)) => {
                    info!(batches = report.batches, bets = report.bets, "connection finished");
                }
                Ok(Outcome::Cancelled) => {}
                Err(err) if err.is_disconnect() => info!("{err}"),
                Err(err) => warn!(error = %err, "connection closed with error"),
            }
        }
        .instrument(span),
    );
}

/// Cancels every connection and waits up to `grace` for them to unwind.
/// Whatever is still running afterwards is aborted, which drops its socket.
async fn stop_connections(trigger: ShutdownTrigger, mut connections: JoinSet<()>, grace: Duration) {
    trigger.trigger();

    let drained = timeout(grace, async {
        while let Some(joined) = connections.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "connection task failed");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            ?grace,
            "connections ignored shutdown; aborting them"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
    info!("all connections closed");
}
