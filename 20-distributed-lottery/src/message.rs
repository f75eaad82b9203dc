//! Lottery messages and the connection wrapper that sends and receives them.
//!
//! Every record on the wire starts with a discriminant code naming the
//! message kind, followed by the fields of that kind's schema:
//!
//! ```text
//! HELLO,<agency>
//! BATCH,<size>
//! BET,<first name>,<last name>,<document>,<birthdate>,<number>
//! OK
//! ERR
//! FINISH
//! WINNERS,<count>,<document>...
//! ```

use std::fmt;

use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

use crate::{
    bet::{AgencyId, BetEntry, Document},
    codec::{decode, encode, CodecError, Field, FieldKind, Record, Schema, Value, Values},
    framer::{FrameError, FrameReader, FrameWriter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Batch,
    Bet,
    Ok,
    Err,
    Finish,
    Winners,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        Self::Hello,
        Self::Batch,
        Self::Bet,
        Self::Ok,
        Self::Err,
        Self::Finish,
        Self::Winners,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Batch => "BATCH",
            Self::Bet => "BET",
            Self::Ok => "OK",
            Self::Err => "ERR",
            Self::Finish => "FINISH",
            Self::Winners => "WINNERS",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// First message of every connection: which agency is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub agency: AgencyId,
}

/// Announces that exactly `size` bets follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub size: u32,
}

/// Batch stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Batch or handshake refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nack;

/// The agency has no more bets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finish;

/// Documents of the agency's winning bets, in the order they were stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Winners {
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Batch(Batch),
    Bet(BetEntry),
    Ok,
    Err,
    Finish,
    Winners(Winners),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello(_) => MessageKind::Hello,
            Self::Batch(_) => MessageKind::Batch,
            Self::Bet(_) => MessageKind::Bet,
            Self::Ok => MessageKind::Ok,
            Self::Err => MessageKind::Err,
            Self::Finish => MessageKind::Finish,
            Self::Winners(_) => MessageKind::Winners,
        }
    }

    fn decode(kind: MessageKind, fields: &[String]) -> Result<Self, CodecError> {
        Ok(match kind {
            MessageKind::Hello => decode::<Hello>(fields)?.into_message(),
            MessageKind::Batch => decode::<Batch>(fields)?.into_message(),
            MessageKind::Bet => decode::<BetEntry>(fields)?.into_message(),
            MessageKind::Ok => decode::<Ack>(fields)?.into_message(),
            MessageKind::Err => decode::<Nack>(fields)?.into_message(),
            MessageKind::Finish => decode::<Finish>(fields)?.into_message(),
            MessageKind::Winners => decode::<Winners>(fields)?.into_message(),
        })
    }
}

/// A record that travels as the body of one message kind.
pub trait Payload: Record {
    const KIND: MessageKind;

    fn into_message(self) -> Message;
}

impl Record for Hello {
    const SCHEMA: Schema = &[Field::new("agency", FieldKind::Integer)];

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Integer(u64::from(self.agency))]
    }

    fn from_values(mut values: Values) -> Result<Self, CodecError> {
        Ok(Self {
            agency: values.integer()?,
        })
    }
}

impl Payload for Hello {
    const KIND: MessageKind = MessageKind::Hello;

    fn into_message(self) -> Message {
        Message::Hello(self)
    }
}

impl Record for Batch {
    const SCHEMA: Schema = &[Field::new("size", FieldKind::Integer)];

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Integer(u64::from(self.size))]
    }

    fn from_values(mut values: Values) -> Result<Self, CodecError> {
        Ok(Self {
            size: values.integer()?,
        })
    }
}

impl Payload for Batch {
    const KIND: MessageKind = MessageKind::Batch;

    fn into_message(self) -> Message {
        Message::Batch(self)
    }
}

impl Payload for BetEntry {
    const KIND: MessageKind = MessageKind::Bet;

    fn into_message(self) -> Message {
        Message::Bet(self)
    }
}

macro_rules! empty_payload {
    ($payload:ident, $kind:ident) => {
        impl Record for $payload {
            const SCHEMA: Schema = &[];

            fn to_values(&self) -> Vec<Value> {
                Vec::new()
            }

            fn from_values(_values: Values) -> Result<Self, CodecError> {
                Ok(Self)
            }
        }

        impl Payload for $payload {
            const KIND: MessageKind = MessageKind::$kind;

            fn into_message(self) -> Message {
                Message::$kind
            }
        }
    };
}

empty_payload!(Ack, Ok);
empty_payload!(Nack, Err);
empty_payload!(Finish, Finish);

impl Record for Winners {
    const SCHEMA: Schema = &[Field::new("documents", FieldKind::IntegerSequence)];

    fn to_values(&self) -> Vec<Value> {
        vec![Value::IntegerSequence(self.documents.clone())]
    }

    fn from_values(mut values: Values) -> Result<Self, CodecError> {
        Ok(Self {
            documents: values.integer_sequence()?,
        })
    }
}

impl Payload for Winners {
    const KIND: MessageKind = MessageKind::Winners;

    fn into_message(self) -> Message {
        Message::Winners(self)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: MessageKind,
        #[source]
        source: CodecError,
    },
    #[error("unknown message kind '{0}'")]
    UnknownMessageKind(String),
    #[error("expected {expected} message, got {got}")]
    UnexpectedMessageKind {
        expected: MessageKind,
        got: MessageKind,
    },
}

impl MessageError {
    /// The peer closed the stream, cleanly or in the middle of a record.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Frame(err) if err.is_end_of_stream())
    }

    /// The peer closed the stream between two records.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Frame(FrameError::ConnectionClosed))
    }
}

/// Typed message exchange over one framed byte stream.
pub struct Connection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

pub type TcpConnection = Connection<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

impl TcpConnection {
    pub fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(BufReader::new(reader), writer)
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// Queues a message; it reaches the peer on the next flush.
    pub async fn send<P: Payload>(&mut self, payload: &P) -> Result<(), MessageError> {
        let mut fields = Vec::with_capacity(P::SCHEMA.len() + 1);
        fields.push(P::KIND.code().to_owned());
        fields.extend(encode(payload));
        self.writer.write(&fields).await?;
        Ok(())
    }

    pub async fn send_flush<P: Payload>(&mut self, payload: &P) -> Result<(), MessageError> {
        self.send(payload).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), MessageError> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next message, whatever its kind. Cancel safe.
    pub async fn receive_any(&mut self) -> Result<Message, MessageError> {
        let fields = self.reader.read().await?;
        let kind = parse_kind(&fields)?;
        Message::decode(kind, &fields[1..]).map_err(|source| MessageError::Malformed { kind, source })
    }

    /// Reads the next message and insists it is of kind `P`. Cancel safe.
    pub async fn receive_expected<P: Payload>(&mut self) -> Result<P, MessageError> {
        let fields = self.reader.read().await?;
        let kind = parse_kind(&fields)?;
        if kind != P::KIND {
            return Err(MessageError::UnexpectedMessageKind {
                expected: P::KIND,
                got: kind,
            });
        }
        decode::<P>(&fields[1..]).map_err(|source| MessageError::Malformed { kind, source })
    }

    /// Flushes and shuts down the write side. Idempotent.
    pub async fn close(&mut self) -> Result<(), MessageError> {
        self.writer.close().await?;
        Ok(())
    }
}

fn parse_kind(fields: &[String]) -> Result<MessageKind, MessageError> {
    let code = fields.first().map(String::as_str).unwrap_or_default();
    MessageKind::from_code(code).ok_or_else(|| MessageError::UnknownMessageKind(code.to_owned()))
}
