//! Agency side of the protocol: stream a dataset to the server in batches,
//! announce the end and wait for the agency's winners.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, trace};

use crate::{
    bet::{AgencyId, Document},
    dataset::{Dataset, DatasetError},
    message::{Batch, Connection, Finish, Hello, Message, MessageError, MessageKind, TcpConnection},
    shutdown::{Outcome, Shutdown},
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub agency: AgencyId,
    pub server: String,
    pub max_batch_size: u32,
    pub batch_period: Duration,
    pub poll_interval: Duration,
    pub dataset: PathBuf,
}

impl ClientConfig {
    pub fn new(agency: AgencyId, server: impl Into<String>) -> Self {
        Self {
            agency,
            server: server.into(),
            max_batch_size: 100,
            batch_period: Duration::ZERO,
            poll_interval: Duration::from_millis(500),
            dataset: default_dataset(agency),
        }
    }
}

/// Where an agency's bets live unless configured otherwise.
pub fn default_dataset(agency: AgencyId) -> PathBuf {
    PathBuf::from(format!("./.data/agency-{agency}.csv"))
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("server rejected batch {batch}")]
    BatchRejected { batch: usize },
    #[error("server replied with an unexpected {0} message")]
    UnexpectedReply(MessageKind),
    #[error(transparent)]
    Protocol(#[from] MessageError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub batches: usize,
    pub bets: usize,
    pub winners: Vec<Document>,
}

pub struct BatchRunner<R> {
    config: ClientConfig,
    dataset: Dataset<R>,
}

impl BatchRunner<BufReader<File>> {
    /// Opens the configured dataset.
    pub async fn open(config: ClientConfig) -> Result<Self, ClientError> {
        let dataset = Dataset::open(&config.dataset).await?;
        Ok(Self::new(config, dataset))
    }
}

impl<R> BatchRunner<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(config: ClientConfig, dataset: Dataset<R>) -> Self {
        Self { config, dataset }
    }

    /// Connects, submits every bet and waits for the draw. Shutdown at any
    /// point closes the socket and yields [`Outcome::Cancelled`].
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<Outcome<ClientReport>, ClientError> {
        let address = self.config.server.clone();
        let stream = match shutdown.run(TcpStream::connect(&address)).await {
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Completed(stream) => {
                stream.map_err(|source| ClientError::Connect { address: address.clone(), source })?
            }
        };
        info!(server = %address, "connected");

        let mut connection = TcpConnection::from_stream(stream);
        let result = self.exchange(&mut connection, &mut shutdown).await;
        // After shutdown the socket is dropped without waiting on the peer.
        if let Outcome::Completed(Err(err)) = shutdown.run(connection.close()).await {
            debug!(error = %err, "closing connection failed");
        }
        result
    }

    async fn exchange<S, W>(
        &mut self,
        connection: &mut Connection<S, W>,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome<ClientReport>, ClientError>
    where
        S: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello = Hello {
            agency: self.config.agency,
        };
        match shutdown.run(connection.send_flush(&hello)).await {
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Completed(sent) => sent?,
        }

        let mut report = ClientReport::default();
        loop {
            let bets = self
                .dataset
                .next_chunk(self.config.max_batch_size as usize)
                .await?;
            if bets.is_empty() {
                break;
            }

            if report.batches > 0 && shutdown.sleep(self.config.batch_period).await.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let sent = shutdown
                .run(async {
                    connection
                        .send(&Batch {
                            size: bets.len() as u32,
                        })
                        .await?;
                    for bet in &bets {
                        connection.send(bet).await?;
                    }
                    connection.flush().await
                })
                .await;
            match sent {
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
                Outcome::Completed(sent) => sent?,
            }

            let batch = report.batches + 1;
            match self.poll_reply(connection, shutdown).await? {
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
                Outcome::Completed(Message::Ok) => {
                    info!(batch, bets = bets.len(), "batch accepted");
                }
                Outcome::Completed(Message::Err) => return Err(ClientError::BatchRejected { batch }),
                Outcome::Completed(other) => return Err(ClientError::UnexpectedReply(other.kind())),
            }
            report.batches = batch;
            report.bets += bets.len();
        }

        match shutdown.run(connection.send_flush(&Finish)).await {
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Completed(sent) => sent?,
        }
        info!(
            batches = report.batches,
            bets = report.bets,
            "all bets sent; waiting for the draw"
        );

        match self.poll_reply(connection, shutdown).await? {
            Outcome::Cancelled => Ok(Outcome::Cancelled),
            Outcome::Completed(Message::Winners(winners)) => {
                report.winners = winners.documents;
                Ok(Outcome::Completed(report))
            }
            Outcome::Completed(other) => Err(ClientError::UnexpectedReply(other.kind())),
        }
    }

    /// Waits for the next server message in `poll_interval` slices so a
    /// shutdown is noticed while the server is silent.
    async fn poll_reply<S, W>(
        &self,
        connection: &mut Connection<S, W>,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome<Message>, MessageError>
    where
        S: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let polled = shutdown
                .run(timeout(self.config.poll_interval, connection.receive_any()))
                .await;
            match polled {
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
                Outcome::Completed(Ok(received)) => return received.map(Outcome::Completed),
                Outcome::Completed(Err(_elapsed)) => trace!("no reply yet"),
            }
        }
    }
}
