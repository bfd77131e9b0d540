// Identifier change (cambio NDG) - an intermediary renumbering a subject

use serde::{Deserialize, Serialize};

use super::{FieldCursor, RecordKeys};
use crate::normalize::{canonical_key, display_key};

pub const COLUMNS: &[&str] = &["intermediary", "old_ndg", "new_ndg", "change_date"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierChange {
    pub intermediary: String,
    pub old_ndg: String,
    pub new_ndg: String,
    pub change_date: String,
}

impl IdentifierChange {
    pub fn from_fields(fields: Vec<String>) -> Self {
        let mut f = FieldCursor::new(fields);
        IdentifierChange {
            intermediary: f.next_field(),
            old_ndg: f.next_field(),
            new_ndg: f.next_field(),
            change_date: f.next_field(),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        vec![
            self.intermediary.as_str(),
            self.old_ndg.as_str(),
            self.new_ndg.as_str(),
            self.change_date.as_str(),
        ]
    }

    pub fn keys(&self) -> RecordKeys {
        RecordKeys {
            key: canonical_key(&[&self.intermediary, &self.old_ndg]),
            alt_key: None,
            parent: None,
            display: display_key(&[&self.intermediary, &self.old_ndg]),
        }
    }
}
