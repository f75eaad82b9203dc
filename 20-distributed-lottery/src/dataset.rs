//! Lazily read bet datasets, one `first,last,document,birthdate,number`
//! line per bet.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncBufRead, BufReader},
};

use crate::{
    bet::BetEntry,
    codec::{decode, CodecError},
    framer::{FrameError, FrameReader},
};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot open dataset {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset line {line} is malformed: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    Read(#[from] FrameError),
}

pub struct Dataset<R> {
    reader: FrameReader<R>,
    line: usize,
    exhausted: bool,
}

impl Dataset<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|source| DatasetError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R> Dataset<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: FrameReader::new(reader),
            line: 0,
            exhausted: false,
        }
    }

    /// The next bet, or `None` once the dataset is exhausted. Blank lines are
    /// skipped and a final line without a newline still counts.
    pub async fn next_bet(&mut self) -> Result<Option<BetEntry>, DatasetError> {
        while !self.exhausted {
            let fields = match self.reader.read().await {
                Ok(fields) => fields,
                Err(FrameError::ConnectionClosed) => {
                    self.exhausted = true;
                    break;
                }
                Err(FrameError::UnexpectedEof { .. }) => {
                    self.exhausted = true;
                    match self.reader.take_partial() {
                        Some(fields) => fields?,
                        None => break,
                    }
                }
                Err(err) => return Err(err.into()),
            };
            self.line += 1;

            if fields.len() == 1 && fields[0].trim().is_empty() {
                continue;
            }
            let line = self.line;
            return decode::<BetEntry>(&fields)
                .map(Some)
                .map_err(|source| DatasetError::Malformed { line, source });
        }
        Ok(None)
    }

    /// Collects up to `max` bets; fewer only when the dataset runs out.
    pub async fn next_chunk(&mut self, max: usize) -> Result<Vec<BetEntry>, DatasetError> {
        let mut chunk = Vec::with_capacity(max.min(1024));
        while chunk.len() < max {
            match self.next_bet().await? {
                Some(bet) => chunk.push(bet),
                None => break,
            }
        }
        Ok(chunk)
    }
}
