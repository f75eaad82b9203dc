use chrono::NaiveDate;

use crate::codec::{CodecError, Field, FieldKind, Record, Schema, Value, Values};

pub type AgencyId = u32;
pub type Document = u64;

/// A bet as an agency knows it, before the server attributes it to an agency.
///
/// This is the payload of `BET` messages and the row format of the client
/// datasets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetEntry {
    pub first_name: String,
    pub last_name: String,
    pub document: Document,
    pub birthdate: NaiveDate,
    pub number: u32,
}

/// A bet attributed to the agency that submitted it, as kept in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: AgencyId,
    pub first_name: String,
    pub last_name: String,
    pub document: Document,
    pub birthdate: NaiveDate,
    pub number: u32,
}

impl Bet {
    pub fn new(agency: AgencyId, entry: BetEntry) -> Self {
        let BetEntry {
            first_name,
            last_name,
            document,
            birthdate,
            number,
        } = entry;
        Self {
            agency,
            first_name,
            last_name,
            document,
            birthdate,
            number,
        }
    }

    pub fn has_won(&self, winning_number: u32) -> bool {
        self.number == winning_number
    }
}

impl Record for BetEntry {
    const SCHEMA: Schema = &[
        Field::new("first_name", FieldKind::Text),
        Field::new("last_name", FieldKind::Text),
        Field::new("document", FieldKind::Integer),
        Field::new("birthdate", FieldKind::Date),
        Field::new("number", FieldKind::Integer),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.first_name.clone()),
            Value::Text(self.last_name.clone()),
            Value::Integer(self.document),
            Value::Date(self.birthdate),
            Value::Integer(u64::from(self.number)),
        ]
    }

    fn from_values(mut values: Values) -> Result<Self, CodecError> {
        Ok(Self {
            first_name: values.text()?,
            last_name: values.text()?,
            document: values.integer()?,
            birthdate: values.date()?,
            number: values.integer()?,
        })
    }
}

impl Record for Bet {
    const SCHEMA: Schema = &[
        Field::new("agency", FieldKind::Integer),
        Field::new("first_name", FieldKind::Text),
        Field::new("last_name", FieldKind::Text),
        Field::new("document", FieldKind::Integer),
        Field::new("birthdate", FieldKind::Date),
        Field::new("number", FieldKind::Integer),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(u64::from(self.agency)),
            Value::Text(self.first_name.clone()),
            Value::Text(self.last_name.clone()),
            Value::Integer(self.document),
            Value::Date(self.birthdate),
            Value::Integer(u64::from(self.number)),
        ]
    }

    fn from_values(mut values: Values) -> Result<Self, CodecError> {
        Ok(Self {
            agency: values.integer()?,
            first_name: values.text()?,
            last_name: values.text()?,
            document: values.integer()?,
            birthdate: values.date()?,
            number: values.integer()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn entry() -> BetEntry {
        BetEntry {
            first_name: "Santiago Lionel".into(),
            last_name: "Lorca".into(),
            document: 30_904_465,
            birthdate: NaiveDate::from_ymd_opt(1999, 3, 17).expect("valid date"),
            number: 7574,
        }
    }

    #[test]
    fn ledger_row_leads_with_agency() {
        let bet = Bet::new(1, entry());
        assert_eq!(
            encode(&bet),
            vec!["1", "Santiago Lionel", "Lorca", "30904465", "1999-03-17", "7574"]
        );
        assert_eq!(decode::<Bet>(&encode(&bet)), Ok(bet));
    }

    #[test]
    fn dataset_row_decodes_into_entry() {
        let row: Vec<String> = ["Santiago Lionel", "Lorca", "30904465", "1999-03-17", "7574"]
            .iter()
            .map(|field| field.to_string())
            .collect();
        assert_eq!(decode::<BetEntry>(&row), Ok(entry()));
    }

    #[test]
    fn winning_is_an_exact_number_match() {
        let bet = Bet::new(3, entry());
        assert!(bet.has_won(7574));
        assert!(!bet.has_won(7575));
    }
}
