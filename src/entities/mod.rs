// Entity Models
// Five record kinds share one shape: business columns in file order, a
// canonical business key, and (for dependents) a canonical parent key that
// must exist among the Link rows of the same submission.
//
// Link is the parent. Subject, Relationship and AccountingData depend on it;
// IdentifierChange stands alone.

pub mod accounting;
pub mod identifier_change;
pub mod link;
pub mod relationship;
pub mod subject;

pub use accounting::AccountingData;
pub use identifier_change::IdentifierChange;
pub use link::Link;
pub use relationship::Relationship;
pub use subject::Subject;

use serde::{Deserialize, Serialize};

// ============================================================================
// RECORD KIND (table/column descriptor)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Subject,
    Relationship,
    AccountingData,
    Link,
    IdentifierChange,
}

/// Which canonical key of a Link row a dependent record points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKey {
    /// intermediary + ndg (Link `key_norm`)
    BySubject,
    /// intermediary + relationship_key (Link `alt_key_norm`)
    ByRelationship,
}

impl ParentKey {
    /// Column of the Link tables holding this key
    pub fn link_column(&self) -> &'static str {
        match self {
            ParentKey::BySubject => "key_norm",
            ParentKey::ByRelationship => "alt_key_norm",
        }
    }
}

impl RecordKind {
    /// Parents first, so dependents find finalized Link rows.
    pub const PROCESSING_ORDER: [RecordKind; 5] = [
        RecordKind::Link,
        RecordKind::Subject,
        RecordKind::Relationship,
        RecordKind::AccountingData,
        RecordKind::IdentifierChange,
    ];

    /// Human-readable name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Subject => "Subject",
            RecordKind::Relationship => "Relationship",
            RecordKind::AccountingData => "AccountingData",
            RecordKind::Link => "Link",
            RecordKind::IdentifierChange => "IdentifierChange",
        }
    }

    /// Stable code persisted on ingestion rows
    pub fn code(&self) -> &'static str {
        match self {
            RecordKind::Subject => "SUBJECT",
            RecordKind::Relationship => "RELATIONSHIP",
            RecordKind::AccountingData => "ACCOUNTING_DATA",
            RecordKind::Link => "LINK",
            RecordKind::IdentifierChange => "IDENTIFIER_CHANGE",
        }
    }

    pub fn from_code(code: &str) -> Option<RecordKind> {
        RecordKind::PROCESSING_ORDER
            .into_iter()
            .find(|k| k.code() == code)
    }

    pub fn staging_table(&self) -> &'static str {
        match self {
            RecordKind::Subject => "stg_subject",
            RecordKind::Relationship => "stg_relationship",
            RecordKind::AccountingData => "stg_accounting_data",
            RecordKind::Link => "stg_link",
            RecordKind::IdentifierChange => "stg_identifier_change",
        }
    }

    pub fn production_table(&self) -> &'static str {
        match self {
            RecordKind::Subject => "subject",
            RecordKind::Relationship => "relationship",
            RecordKind::AccountingData => "accounting_data",
            RecordKind::Link => "link",
            RecordKind::IdentifierChange => "identifier_change",
        }
    }

    /// Business columns, in the order they appear on a line
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Subject => subject::COLUMNS,
            RecordKind::Relationship => relationship::COLUMNS,
            RecordKind::AccountingData => accounting::COLUMNS,
            RecordKind::Link => link::COLUMNS,
            RecordKind::IdentifierChange => identifier_change::COLUMNS,
        }
    }

    /// Number of delimited fields a line of this kind must have
    pub fn field_count(&self) -> usize {
        self.columns().len()
    }

    /// Columns forming the business key, used to render messages
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Subject => &["intermediary", "ndg"],
            RecordKind::Relationship => &["intermediary", "relationship_key"],
            RecordKind::AccountingData => &["intermediary", "relationship_key", "reference_year"],
            RecordKind::Link => &["intermediary", "ndg", "relationship_key"],
            RecordKind::IdentifierChange => &["intermediary", "old_ndg"],
        }
    }

    /// Columns forming the parent key, used to render missing-parent messages
    pub fn parent_columns(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Subject => &["intermediary", "ndg"],
            RecordKind::Relationship | RecordKind::AccountingData => {
                &["intermediary", "relationship_key"]
            }
            RecordKind::Link | RecordKind::IdentifierChange => &[],
        }
    }

    pub fn parent(&self) -> Option<ParentKey> {
        match self {
            RecordKind::Subject => Some(ParentKey::BySubject),
            RecordKind::Relationship | RecordKind::AccountingData => {
                Some(ParentKey::ByRelationship)
            }
            RecordKind::Link | RecordKind::IdentifierChange => None,
        }
    }

    /// Link rows are unique under two projections
    pub fn has_alt_key(&self) -> bool {
        matches!(self, RecordKind::Link)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// TYPED RECORD
// ============================================================================

/// Canonical keys of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKeys {
    pub key: String,
    pub alt_key: Option<String>,
    pub parent: Option<String>,
    /// Original key text for messages, e.g. `IT01/NDG123`
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityData {
    Subject(Subject),
    Relationship(Relationship),
    AccountingData(AccountingData),
    Link(Link),
    IdentifierChange(IdentifierChange),
}

/// One parsed line: entity attributes plus where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRecord {
    pub line_number: u64,
    pub raw_line: String,
    pub data: EntityData,
}

impl TypedRecord {
    /// Build from already arity-checked fields (see `parser`)
    pub fn from_fields(
        kind: RecordKind,
        fields: Vec<String>,
        line_number: u64,
        raw_line: String,
    ) -> Self {
        let data = match kind {
            RecordKind::Subject => EntityData::Subject(Subject::from_fields(fields)),
            RecordKind::Relationship => {
                EntityData::Relationship(Relationship::from_fields(fields))
            }
            RecordKind::AccountingData => {
                EntityData::AccountingData(AccountingData::from_fields(fields))
            }
            RecordKind::Link => EntityData::Link(Link::from_fields(fields)),
            RecordKind::IdentifierChange => {
                EntityData::IdentifierChange(IdentifierChange::from_fields(fields))
            }
        };

        TypedRecord {
            line_number,
            raw_line,
            data,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match &self.data {
            EntityData::Subject(_) => RecordKind::Subject,
            EntityData::Relationship(_) => RecordKind::Relationship,
            EntityData::AccountingData(_) => RecordKind::AccountingData,
            EntityData::Link(_) => RecordKind::Link,
            EntityData::IdentifierChange(_) => RecordKind::IdentifierChange,
        }
    }

    /// Business values in `RecordKind::columns()` order
    pub fn values(&self) -> Vec<&str> {
        match &self.data {
            EntityData::Subject(r) => r.values(),
            EntityData::Relationship(r) => r.values(),
            EntityData::AccountingData(r) => r.values(),
            EntityData::Link(r) => r.values(),
            EntityData::IdentifierChange(r) => r.values(),
        }
    }

    pub fn keys(&self) -> RecordKeys {
        match &self.data {
            EntityData::Subject(r) => r.keys(),
            EntityData::Relationship(r) => r.keys(),
            EntityData::AccountingData(r) => r.keys(),
            EntityData::Link(r) => r.keys(),
            EntityData::IdentifierChange(r) => r.keys(),
        }
    }
}

/// Pull fields positionally; missing trailing fields read as empty.
pub(crate) struct FieldCursor {
    inner: std::vec::IntoIter<String>,
}

impl FieldCursor {
    pub(crate) fn new(fields: Vec<String>) -> Self {
        FieldCursor {
            inner: fields.into_iter(),
        }
    }

    pub(crate) fn next_field(&mut self) -> String {
        self.inner.next().unwrap_or_default()
    }
}
