// Relationship (rapporto) - an account or contract held at an intermediary

use serde::{Deserialize, Serialize};

use super::{FieldCursor, RecordKeys};
use crate::normalize::{canonical_key, display_key};

pub const COLUMNS: &[&str] = &[
    "intermediary",
    "relationship_key",
    "relationship_type",
    "opening_date",
    "closing_date",
    "currency",
    "branch_code",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub intermediary: String,
    /// Relationship key (chiave rapporto)
    pub relationship_key: String,
    pub relationship_type: String,
    pub opening_date: String,
    /// Empty while the relationship is open
    pub closing_date: String,
    pub currency: String,
    /// Optional 5-digit branch code
    pub branch_code: String,
}

impl Relationship {
    pub fn from_fields(fields: Vec<String>) -> Self {
        let mut f = FieldCursor::new(fields);
        Relationship {
            intermediary: f.next_field(),
            relationship_key: f.next_field(),
            relationship_type: f.next_field(),
            opening_date: f.next_field(),
            closing_date: f.next_field(),
            currency: f.next_field(),
            branch_code: f.next_field(),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        vec![
            self.intermediary.as_str(),
            self.relationship_key.as_str(),
            self.relationship_type.as_str(),
            self.opening_date.as_str(),
            self.closing_date.as_str(),
            self.currency.as_str(),
            self.branch_code.as_str(),
        ]
    }

    pub fn keys(&self) -> RecordKeys {
        let key = canonical_key(&[&self.intermediary, &self.relationship_key]);
        RecordKeys {
            parent: Some(key.clone()),
            key,
            alt_key: None,
            display: display_key(&[&self.intermediary, &self.relationship_key]),
        }
    }
}
