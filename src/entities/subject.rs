// Subject (soggetto) - a natural or legal person known to an intermediary
//
// Identified by intermediary + ndg. Only stored when a Link row for the
// same intermediary + ndg exists in the submission.

use serde::{Deserialize, Serialize};

use super::{FieldCursor, RecordKeys};
use crate::normalize::{canonical_key, display_key};

pub const COLUMNS: &[&str] = &[
    "intermediary",
    "ndg",
    "subject_type",
    "tax_code",
    "surname",
    "first_name",
    "gender",
    "birth_date",
    "birth_place",
];

/// Natural person
pub const TYPE_NATURAL: &str = "PF";
/// Legal person (company, association, ...)
pub const TYPE_LEGAL: &str = "PNF";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub intermediary: String,
    /// Subject identifier assigned by the intermediary
    pub ndg: String,
    pub subject_type: String,
    pub tax_code: String,
    /// Surname, or company name for legal persons
    pub surname: String,
    pub first_name: String,
    pub gender: String,
    pub birth_date: String,
    pub birth_place: String,
}

impl Subject {
    pub fn from_fields(fields: Vec<String>) -> Self {
        let mut f = FieldCursor::new(fields);
        Subject {
            intermediary: f.next_field(),
            ndg: f.next_field(),
            subject_type: f.next_field(),
            tax_code: f.next_field(),
            surname: f.next_field(),
            first_name: f.next_field(),
            gender: f.next_field(),
            birth_date: f.next_field(),
            birth_place: f.next_field(),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        vec![
            self.intermediary.as_str(),
            self.ndg.as_str(),
            self.subject_type.as_str(),
            self.tax_code.as_str(),
            self.surname.as_str(),
            self.first_name.as_str(),
            self.gender.as_str(),
            self.birth_date.as_str(),
            self.birth_place.as_str(),
        ]
    }

    pub fn is_natural_person(&self) -> bool {
        self.subject_type.eq_ignore_ascii_case(TYPE_NATURAL)
    }

    pub fn keys(&self) -> RecordKeys {
        let key = canonical_key(&[&self.intermediary, &self.ndg]);
        RecordKeys {
            parent: Some(key.clone()),
            key,
            alt_key: None,
            display: display_key(&[&self.intermediary, &self.ndg]),
        }
    }
}
