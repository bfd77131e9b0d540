// Accounting data (dati contabili) - yearly balances and movement totals
// of one relationship

use serde::{Deserialize, Serialize};

use super::{FieldCursor, RecordKeys};
use crate::normalize::{canonical_key, display_key};

pub const COLUMNS: &[&str] = &[
    "intermediary",
    "relationship_key",
    "reference_year",
    "currency",
    "opening_balance",
    "closing_balance",
    "total_credits",
    "total_debits",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingData {
    pub intermediary: String,
    pub relationship_key: String,
    pub reference_year: String,
    pub currency: String,
    pub opening_balance: String,
    pub closing_balance: String,
    pub total_credits: String,
    pub total_debits: String,
}

impl AccountingData {
    pub fn from_fields(fields: Vec<String>) -> Self {
        let mut f = FieldCursor::new(fields);
        AccountingData {
            intermediary: f.next_field(),
            relationship_key: f.next_field(),
            reference_year: f.next_field(),
            currency: f.next_field(),
            opening_balance: f.next_field(),
            closing_balance: f.next_field(),
            total_credits: f.next_field(),
            total_debits: f.next_field(),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        vec![
            self.intermediary.as_str(),
            self.relationship_key.as_str(),
            self.reference_year.as_str(),
            self.currency.as_str(),
            self.opening_balance.as_str(),
            self.closing_balance.as_str(),
            self.total_credits.as_str(),
            self.total_debits.as_str(),
        ]
    }

    /// One row per relationship and year; parent is the relationship's Link.
    pub fn keys(&self) -> RecordKeys {
        RecordKeys {
            key: canonical_key(&[
                &self.intermediary,
                &self.relationship_key,
                &self.reference_year,
            ]),
            alt_key: None,
            parent: Some(canonical_key(&[&self.intermediary, &self.relationship_key])),
            display: display_key(&[
                &self.intermediary,
                &self.relationship_key,
                &self.reference_year,
            ]),
        }
    }
}
