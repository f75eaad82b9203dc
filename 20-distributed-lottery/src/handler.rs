//! Server side of one agency connection.
//!
//! A connection moves through [`HandlerState`]: it waits for `HELLO`,
//! stores batches of bets until `FINISH`, waits for the draw, sends
//! `WINNERS` and closes. Every exit path, including errors and shutdown,
//! closes the socket once and gives the agency id back to the registry.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, error, info, warn, Span};

use crate::{
    bet::{AgencyId, Bet},
    coordinator::{DrawCoordinator, DrawError},
    message::{
        Ack, Batch, Connection, Hello, Message, MessageError, MessageKind, Nack, Payload, Winners,
    },
    registry::{AgencyLease, AgencyRegistry, RegistrationError},
    shutdown::{Outcome, Shutdown},
    store::{Ledger, StorageError},
};

/// Shared server state every connection handler works against.
#[derive(Clone)]
pub struct HandlerContext {
    pub coordinator: Arc<DrawCoordinator>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<AgencyRegistry>,
    pub hello_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingHello,
    Active,
    AwaitingDraw,
    Closed,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handshake failed: {0}")]
    Handshake(#[source] MessageError),
    #[error("no HELLO within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("batch ended after {received} of {expected} bets")]
    TruncatedBatch { expected: usize, received: usize },
    #[error("agency {0} disconnected before finishing")]
    Disconnected(AgencyId),
    #[error("unexpected {0} message")]
    UnexpectedMessage(MessageKind),
    #[error(transparent)]
    Protocol(#[from] MessageError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Draw(#[from] DrawError),
}

impl HandlerError {
    /// The agency simply went away; it may reconnect later.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// What a connection accomplished before it closed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandlerReport {
    pub agency: Option<AgencyId>,
    pub batches: usize,
    pub bets: usize,
    pub winners: usize,
}

pub struct ConnectionHandler<R, W> {
    connection: Connection<R, W>,
    context: HandlerContext,
    shutdown: Shutdown,
    peer: Option<SocketAddr>,
    state: HandlerState,
    lease: Option<AgencyLease>,
    report: HandlerReport,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        connection: Connection<R, W>,
        context: HandlerContext,
        shutdown: Shutdown,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            connection,
            context,
            shutdown,
            peer,
            state: HandlerState::AwaitingHello,
            lease: None,
            report: HandlerReport::default(),
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Serves the connection to the end, then releases the agency
    /// registration and closes the connection. A peer that sees the close can
    /// reconnect under the same agency right away. After shutdown the socket
    /// is dropped without flushing.
    pub async fn run(mut self) -> Result<Outcome<HandlerReport>, HandlerError> {
        let result = self.drive().await;

        self.state = HandlerState::Closed;
        self.lease = None;
        if let Outcome::Completed(Err(err)) = self.shutdown.run(self.connection.close()).await {
            debug!(error = %err, "closing connection failed");
        }

        result.map(|outcome| outcome.map(|()| self.report))
    }

    async fn drive(&mut self) -> Result<Outcome<()>, HandlerError> {
        loop {
            let step = match self.state {
                HandlerState::AwaitingHello => self.await_hello().await?,
                HandlerState::Active => self.serve_next().await?,
                HandlerState::AwaitingDraw => self.deliver_winners().await?,
                HandlerState::Closed => return Ok(Outcome::Completed(())),
            };
            if step.is_cancelled() {
                info!(state = ?self.state, "connection cancelled by shutdown");
                return Ok(Outcome::Cancelled);
            }
        }
    }

    async fn await_hello(&mut self) -> Result<Outcome<()>, HandlerError> {
        let hello_timeout = self.context.hello_timeout;
        let received = self
            .shutdown
            .run(tokio::time::timeout(
                hello_timeout,
                self.connection.receive_expected::<Hello>(),
            ))
            .await;

        let hello = match received {
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Completed(Err(_elapsed)) => {
                return Err(HandlerError::HandshakeTimeout(hello_timeout));
            }
            Outcome::Completed(Ok(Err(err))) => {
                if !err.is_end_of_stream() {
                    self.reject().await;
                }
                return Err(HandlerError::Handshake(err));
            }
            Outcome::Completed(Ok(Ok(hello))) => hello,
        };

        let lease = match self.context.registry.register(hello.agency, self.peer) {
            Ok(lease) => lease,
            Err(err) => {
                if let RegistrationError::DuplicateAgency(agency) = err {
                    warn!(
                        agency,
                        holder = ?self.context.registry.peer(agency),
                        "agency is already connected"
                    );
                }
                self.reject().await;
                return Err(err.into());
            }
        };

        Span::current().record("agency", hello.agency);
        info!(agency = hello.agency, "agency registered");
        self.report.agency = Some(lease.agency());
        self.lease = Some(lease);
        self.state = HandlerState::Active;
        Ok(Outcome::Completed(()))
    }

    async fn serve_next(&mut self) -> Result<Outcome<()>, HandlerError> {
        let agency = self.agency();
        let received = match self.shutdown.run(self.connection.receive_any()).await {
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Completed(received) => received,
        };

        match received {
            Ok(Message::Batch(Batch { size })) => self.store_batch(agency, size as usize).await,
            Ok(Message::Finish) => {
                self.context.coordinator.signal_finish(agency).await;
                self.state = HandlerState::AwaitingDraw;
                Ok(Outcome::Completed(()))
            }
            Ok(other) => {
                self.reject().await;
                Err(HandlerError::UnexpectedMessage(other.kind()))
            }
            Err(err) if err.is_connection_closed() => Err(HandlerError::Disconnected(agency)),
            Err(err) => {
                if !err.is_end_of_stream() {
                    self.reject().await;
                }
                Err(err.into())
            }
        }
    }

    /// Reads exactly `size` bets and stores them as one unit.
    async fn store_batch(&mut self, agency: AgencyId, size: usize) -> Result<Outcome<()>, HandlerError> {
        let mut bets = Vec::with_capacity(size.min(1024));
        while bets.len() < size {
            let received = match self.shutdown.run(self.connection.receive_any()).await {
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
                Outcome::Completed(received) => received,
            };

            let truncated = HandlerError::TruncatedBatch {
                expected: size,
                received: bets.len(),
            };
            match received {
                Ok(Message::Bet(entry)) => bets.push(Bet::new(agency, entry)),
                Ok(other) => {
                    debug!(kind = %other.kind(), "batch interrupted by another message");
                    self.reject().await;
                    return Err(truncated);
                }
                Err(err) if err.is_end_of_stream() => return Err(truncated),
                Err(err) => {
                    self.reject().await;
                    return Err(err.into());
                }
            }
        }

        let count = bets.len();
        if count > 0 {
            let stored = self
                .context
                .ledger
                .offload(move |ledger| ledger.store_batch(&bets))
                .await;
            if let Err(err) = stored {
                error!(error = %err, bets = count, "failed to store batch");
                self.reject().await;
                return Err(err.into());
            }
        }
        if self.reply(&Ack).await?.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        self.report.batches += 1;
        self.report.bets += count;
        debug!(bets = count, total = self.report.bets, "batch stored");
        Ok(Outcome::Completed(()))
    }

    async fn deliver_winners(&mut self) -> Result<Outcome<()>, HandlerError> {
        let agency = self.agency();
        let documents = match self
            .context
            .coordinator
            .await_result(agency, &mut self.shutdown)
            .await?
        {
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Completed(documents) => documents,
        };

        let winners = documents.len();
        if self.reply(&Winners { documents }).await?.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        info!(winners, "winners sent");

        self.report.winners = winners;
        self.state = HandlerState::Closed;
        Ok(Outcome::Completed(()))
    }

    fn agency(&self) -> AgencyId {
        self.lease.as_ref().map_or(0, AgencyLease::agency)
    }

    /// Sends one message unless shutdown arrives first. A peer that stopped
    /// reading cannot hold the handler past shutdown.
    async fn reply<P: Payload>(&mut self, payload: &P) -> Result<Outcome<()>, HandlerError> {
        match self.shutdown.run(self.connection.send_flush(payload)).await {
            Outcome::Cancelled => Ok(Outcome::Cancelled),
            Outcome::Completed(sent) => Ok(Outcome::Completed(sent?)),
        }
    }

    /// Best-effort `ERR` reply ahead of closing.
    async fn reject(&mut self) {
        if let Err(err) = self.reply(&Nack).await {
            debug!(error = %err, "could not deliver ERR");
        }
    }
}
