// Link (collegamento) - ties a subject to a relationship
//
// Parent of Subject, Relationship and AccountingData. A Link row is unique
// under either projection: intermediary + ndg, or intermediary +
// relationship_key. Two rows matching on either are duplicates.

use serde::{Deserialize, Serialize};

use super::{FieldCursor, RecordKeys};
use crate::normalize::{canonical_key, display_key};

pub const COLUMNS: &[&str] = &[
    "intermediary",
    "relationship_key",
    "ndg",
    "role",
    "role_start_date",
    "role_end_date",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub intermediary: String,
    pub relationship_key: String,
    pub ndg: String,
    /// Role code of the subject in the relationship (holder, delegate, ...)
    pub role: String,
    pub role_start_date: String,
    pub role_end_date: String,
}

impl Link {
    pub fn from_fields(fields: Vec<String>) -> Self {
        let mut f = FieldCursor::new(fields);
        Link {
            intermediary: f.next_field(),
            relationship_key: f.next_field(),
            ndg: f.next_field(),
            role: f.next_field(),
            role_start_date: f.next_field(),
            role_end_date: f.next_field(),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        vec![
            self.intermediary.as_str(),
            self.relationship_key.as_str(),
            self.ndg.as_str(),
            self.role.as_str(),
            self.role_start_date.as_str(),
            self.role_end_date.as_str(),
        ]
    }

    /// `key` is the subject projection, `alt_key` the relationship projection.
    pub fn keys(&self) -> RecordKeys {
        RecordKeys {
            key: canonical_key(&[&self.intermediary, &self.ndg]),
            alt_key: Some(canonical_key(&[&self.intermediary, &self.relationship_key])),
            parent: None,
            display: display_key(&[&self.intermediary, &self.ndg, &self.relationship_key]),
        }
    }
}
