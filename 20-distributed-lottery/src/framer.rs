//! Newline-delimited, comma-separated record framing over async byte streams.
//!
//! [`FrameWriter`] buffers outgoing records in a packet-sized buffer and
//! flushes on its own whenever a record would not fit, so a record of any
//! length reaches the peer intact while no single write exceeds the packet
//! size. [`FrameReader`] yields one record at a time, keeping any partially
//! received record across calls so a read abandoned by a timeout can simply
//! be retried.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FIELD_DELIMITER: char = ',';
pub const RECORD_TERMINATOR: char = '\n';

/// Largest number of bytes handed to the underlying stream in one write.
pub const MAX_PACKET_SIZE: usize = 8000;

/// Largest record the reader accepts before giving up on the stream.
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream closed")]
    ConnectionClosed,
    #[error("stream ended in the middle of a record ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },
    #[error("record exceeds {max} bytes")]
    RecordTooLarge { max: usize },
    #[error("record is not valid UTF-8")]
    InvalidUtf8,
    #[error("writer is closed")]
    Closed,
    #[error("writer is unusable after an earlier {0:?} error")]
    Failed(io::ErrorKind),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the peer went away, cleanly or mid-record.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::UnexpectedEof { .. })
    }
}

pub struct FrameWriter<W> {
    inner: W,
    buffer: Vec<u8>,
    capacity: usize,
    failed: Option<io::ErrorKind>,
    closed: bool,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self::with_capacity(inner, MAX_PACKET_SIZE)
    }

    pub fn with_capacity(inner: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buffer: Vec::with_capacity(capacity),
            capacity,
            failed: None,
            closed: false,
        }
    }

    /// Queues one record. May flush, possibly several times, if the record
    /// does not fit in what is left of the buffer.
    pub async fn write<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), FrameError> {
        self.check_writable()?;

        let mut delimiter = [0u8; 4];
        let delimiter = FIELD_DELIMITER.encode_utf8(&mut delimiter).as_bytes();
        for (position, field) in fields.iter().enumerate() {
            if position > 0 {
                self.append(delimiter).await?;
            }
            self.append(field.as_ref().as_bytes()).await?;
        }

        let mut terminator = [0u8; 4];
        let terminator = RECORD_TERMINATOR.encode_utf8(&mut terminator).as_bytes();
        self.append(terminator).await
    }

    /// Pushes every buffered byte to the underlying stream.
    ///
    /// The first I/O failure is remembered: from then on every write and
    /// flush reports [`FrameError::Failed`] without touching the stream.
    pub async fn flush(&mut self) -> Result<(), FrameError> {
        self.check_writable()?;

        if let Err(err) = self.inner.write_all(&self.buffer).await {
            return Err(self.fail(err));
        }
        self.buffer.clear();

        if let Err(err) = self.inner.flush().await {
            return Err(self.fail(err));
        }
        Ok(())
    }

    /// Flushes what is buffered and shuts the stream down. Calling it again
    /// does nothing.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        if self.closed {
            return Ok(());
        }

        let flushed = match self.failed {
            Some(_) => Ok(()),
            None => self.flush().await,
        };
        self.closed = true;
        self.buffer.clear();
        let shutdown = self.inner.shutdown().await;

        flushed?;
        shutdown?;
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn check_writable(&self) -> Result<(), FrameError> {
        if self.closed {
            return Err(FrameError::Closed);
        }
        match self.failed {
            Some(kind) => Err(FrameError::Failed(kind)),
            None => Ok(()),
        }
    }

    async fn append(&mut self, mut data: &[u8]) -> Result<(), FrameError> {
        loop {
            let room = self.capacity - self.buffer.len();
            let taken = room.min(data.len());
            self.buffer.extend_from_slice(&data[..taken]);
            data = &data[taken..];

            if data.is_empty() {
                return Ok(());
            }
            self.flush().await?;
        }
    }

    fn fail(&mut self, err: io::Error) -> FrameError {
        self.failed = Some(err.kind());
        self.buffer.clear();
        FrameError::Io(err)
    }
}

pub struct FrameReader<R> {
    inner: R,
    pending: Vec<u8>,
    max_record: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_max_record(inner, MAX_RECORD_SIZE)
    }

    pub fn with_max_record(inner: R, max_record: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            max_record,
        }
    }

    /// Waits for the next complete record and splits it into fields.
    ///
    /// Cancel safe: bytes of a record that has not fully arrived stay
    /// buffered and the next call continues where this one stopped.
    pub async fn read(&mut self) -> Result<Vec<String>, FrameError> {
        let terminator = RECORD_TERMINATOR as u8;
        let limit = (self.max_record + 1).saturating_sub(self.pending.len()) as u64;
        let mut limited = (&mut self.inner).take(limit);
        limited.read_until(terminator, &mut self.pending).await?;

        if self.pending.last() == Some(&terminator) {
            self.pending.pop();
            if self.pending.last() == Some(&b'\r') {
                self.pending.pop();
            }
            let record = std::mem::take(&mut self.pending);
            return split_record(record);
        }

        if self.pending.len() > self.max_record {
            self.pending.clear();
            return Err(FrameError::RecordTooLarge {
                max: self.max_record,
            });
        }

        if self.pending.is_empty() {
            Err(FrameError::ConnectionClosed)
        } else {
            Err(FrameError::UnexpectedEof {
                buffered: self.pending.len(),
            })
        }
    }

    /// Hands out an unterminated trailing record, if the stream ended with one.
    ///
    /// Useful for files whose last line lacks a newline; sockets should treat
    /// such a tail as a broken record instead.
    pub fn take_partial(&mut self) -> Option<Result<Vec<String>, FrameError>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut record = std::mem::take(&mut self.pending);
        if record.last() == Some(&b'\r') {
            record.pop();
        }
        Some(split_record(record))
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

fn split_record(record: Vec<u8>) -> Result<Vec<String>, FrameError> {
    let line = String::from_utf8(record).map_err(|_| FrameError::InvalidUtf8)?;
    Ok(line.split(FIELD_DELIMITER).map(str::to_owned).collect())
}
