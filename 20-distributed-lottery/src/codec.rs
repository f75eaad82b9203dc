//! Schema-driven conversion between typed records and ordered string fields.
//!
//! Every record type declares a static [`Schema`]: the ordered list of its
//! fields and their kinds. One generic pair of routines, [`encode`] and
//! [`decode`], walks that schema, so the wire layout of a type is visible
//! (and testable) without running any code that inspects values.

use chrono::NaiveDate;
use thiserror::Error;

/// Textual layout of dates on the wire and in the ledger.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Text,
    Date,
    /// A length field followed by that many integers.
    IntegerSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

pub type Schema = &'static [Field];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(u64),
    Text(String),
    Date(NaiveDate),
    IntegerSequence(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("expected {expected} fields, got {got}")]
    FieldCountMismatch { expected: usize, got: usize },
    #[error("field {index} is not a valid {kind:?}")]
    FieldTypeError { index: usize, kind: FieldKind },
    #[error("sequence declares {declared} elements but only {available} fields follow")]
    SequenceLengthMismatch { declared: usize, available: usize },
    #[error("record does not follow its schema at field '{name}'")]
    SchemaViolation { name: &'static str },
}

/// A type with a fixed, ordered field layout.
pub trait Record: Sized {
    const SCHEMA: Schema;

    /// Values in schema order.
    fn to_values(&self) -> Vec<Value>;

    fn from_values(values: Values) -> Result<Self, CodecError>;
}

/// Decoded values handed to [`Record::from_values`], consumed in schema order.
pub struct Values {
    schema: Schema,
    entries: std::vec::IntoIter<(usize, Value)>,
    position: usize,
}

impl Values {
    fn new(schema: Schema, entries: Vec<(usize, Value)>) -> Self {
        Self {
            schema,
            entries: entries.into_iter(),
            position: 0,
        }
    }

    /// Takes the next integer, narrowing it to `T`.
    ///
    /// A value that does not fit `T` is reported as a type error on the wire
    /// field it came from.
    pub fn integer<T: TryFrom<u64>>(&mut self) -> Result<T, CodecError> {
        match self.next_entry()? {
            (index, Value::Integer(value)) => T::try_from(value).map_err(|_| {
                CodecError::FieldTypeError {
                    index,
                    kind: FieldKind::Integer,
                }
            }),
            _ => Err(self.violation()),
        }
    }

    pub fn text(&mut self) -> Result<String, CodecError> {
        match self.next_entry()? {
            (_, Value::Text(value)) => Ok(value),
            _ => Err(self.violation()),
        }
    }

    pub fn date(&mut self) -> Result<NaiveDate, CodecError> {
        match self.next_entry()? {
            (_, Value::Date(value)) => Ok(value),
            _ => Err(self.violation()),
        }
    }

    pub fn integer_sequence(&mut self) -> Result<Vec<u64>, CodecError> {
        match self.next_entry()? {
            (_, Value::IntegerSequence(values)) => Ok(values),
            _ => Err(self.violation()),
        }
    }

    fn next_entry(&mut self) -> Result<(usize, Value), CodecError> {
        self.position += 1;
        self.entries.next().ok_or_else(|| self.violation())
    }

    fn violation(&self) -> CodecError {
        let name = self
            .schema
            .get(self.position.saturating_sub(1))
            .map_or("<end>", |field| field.name);
        CodecError::SchemaViolation { name }
    }
}

pub fn encode<T: Record>(record: &T) -> Vec<String> {
    let values = record.to_values();
    debug_assert_eq!(values.len(), T::SCHEMA.len());

    let mut fields = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Integer(value) => fields.push(value.to_string()),
            Value::Text(value) => fields.push(value),
            Value::Date(value) => fields.push(value.format(DATE_FORMAT).to_string()),
            Value::IntegerSequence(values) => {
                fields.push(values.len().to_string());
                fields.extend(values.iter().map(u64::to_string));
            }
        }
    }
    fields
}

pub fn decode<T: Record>(fields: &[String]) -> Result<T, CodecError> {
    let entries = parse_fields(T::SCHEMA, fields)?;
    T::from_values(Values::new(T::SCHEMA, entries))
}

fn parse_fields(schema: Schema, fields: &[String]) -> Result<Vec<(usize, Value)>, CodecError> {
    let variable_length = schema
        .iter()
        .any(|field| field.kind == FieldKind::IntegerSequence);
    if !variable_length && fields.len() != schema.len() {
        return Err(CodecError::FieldCountMismatch {
            expected: schema.len(),
            got: fields.len(),
        });
    }

    let mut entries = Vec::with_capacity(schema.len());
    let mut cursor = 0;
    for field in schema {
        let Some(raw) = fields.get(cursor) else {
            return Err(CodecError::FieldCountMismatch {
                expected: cursor + (schema.len() - entries.len()),
                got: fields.len(),
            });
        };

        let start = cursor;
        let value = match field.kind {
            FieldKind::Integer => Value::Integer(parse_integer(raw, cursor)?),
            FieldKind::Text => Value::Text(raw.clone()),
            FieldKind::Date => Value::Date(parse_date(raw, cursor)?),
            FieldKind::IntegerSequence => {
                let declared = usize::try_from(parse_integer(raw, cursor)?).map_err(|_| {
                    CodecError::FieldTypeError {
                        index: cursor,
                        kind: FieldKind::Integer,
                    }
                })?;
                let available = fields.len() - cursor - 1;
                if declared > available {
                    return Err(CodecError::SequenceLengthMismatch {
                        declared,
                        available,
                    });
                }
                let elements = fields[cursor + 1..cursor + 1 + declared]
                    .iter()
                    .enumerate()
                    .map(|(offset, raw)| parse_integer(raw, cursor + 1 + offset))
                    .collect::<Result<Vec<_>, _>>()?;
                cursor += declared;
                Value::IntegerSequence(elements)
            }
        };
        cursor += 1;
        entries.push((start, value));
    }

    if cursor != fields.len() {
        return Err(CodecError::FieldCountMismatch {
            expected: cursor,
            got: fields.len(),
        });
    }

    Ok(entries)
}

fn parse_integer(raw: &str, index: usize) -> Result<u64, CodecError> {
    raw.parse().map_err(|_| CodecError::FieldTypeError {
        index,
        kind: FieldKind::Integer,
    })
}

fn parse_date(raw: &str, index: usize) -> Result<NaiveDate, CodecError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| CodecError::FieldTypeError {
        index,
        kind: FieldKind::Date,
    })
}
