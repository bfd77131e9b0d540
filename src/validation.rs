// Field Validator
// Mandatory fields, per-field formats, cross-field consistency and the
// in-file duplicate check. Returns an ordered list of causes; empty = valid.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::entities::subject::{TYPE_LEGAL, TYPE_NATURAL};
use crate::entities::{
    AccountingData, EntityData, IdentifierChange, Link, RecordKeys, Relationship, Subject,
    TypedRecord,
};
use crate::normalize::canonical_part;

/// Date layout used by every file
pub const DATE_FORMAT: &str = "%Y%m%d";

// ============================================================================
// ERROR CODES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Line could not be split into the expected fields
    InvalidFormat,
    MissingField,
    InvalidValue,
    InconsistentFields,
    /// Business key already seen earlier in the same file
    DuplicateInSubmission,
    /// Staging row flagged as duplicate (status 2)
    AlreadyExists,
    /// Staging row without Link parent (status 3)
    MissingParent,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::InvalidFormat,
        ErrorCode::MissingField,
        ErrorCode::InvalidValue,
        ErrorCode::InconsistentFields,
        ErrorCode::DuplicateInSubmission,
        ErrorCode::AlreadyExists,
        ErrorCode::MissingParent,
    ];

    /// Code persisted on error causes
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::MissingField => "MISSING_FIELD",
            ErrorCode::InvalidValue => "INVALID_VALUE",
            ErrorCode::InconsistentFields => "INCONSISTENT_FIELDS",
            ErrorCode::DuplicateInSubmission => "DUPLICATE_IN_SUBMISSION",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::MissingParent => "MISSING_PARENT",
        }
    }

    pub fn from_code(code: &str) -> Option<ErrorCode> {
        ErrorCode::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Foreign-key class errors
    pub fn is_referential(&self) -> bool {
        matches!(self, ErrorCode::MissingParent)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCause {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorCause {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorCause {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// SEEN KEYS (in-file duplicate detection)
// ============================================================================

/// Canonical keys of the records accepted so far in one file.
///
/// Lives for the whole file pass; the batch loader must never clear it
/// between chunks, otherwise duplicates straddling a chunk boundary slip
/// through.
#[derive(Debug, Default)]
pub struct SeenKeys {
    keys: HashSet<String>,
    alt_keys: HashSet<String>,
}

impl SeenKeys {
    pub fn new() -> Self {
        SeenKeys::default()
    }

    /// True when the primary key, or the alternative key if any, was seen
    pub fn contains(&self, keys: &RecordKeys) -> bool {
        if self.keys.contains(&keys.key) {
            return true;
        }
        match &keys.alt_key {
            Some(alt) => self.alt_keys.contains(alt),
            None => false,
        }
    }

    pub fn insert(&mut self, keys: &RecordKeys) {
        self.keys.insert(keys.key.clone());
        if let Some(alt) = &keys.alt_key {
            self.alt_keys.insert(alt.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ============================================================================
// FIELD VALIDATOR
// ============================================================================

pub struct FieldValidator {
    /// Reference date for "not in the future" checks
    today: NaiveDate,
}

impl FieldValidator {
    pub fn new() -> Self {
        FieldValidator {
            today: Utc::now().date_naive(),
        }
    }

    pub fn with_today(today: NaiveDate) -> Self {
        FieldValidator { today }
    }

    /// Validate one record. On success its key joins `seen`.
    pub fn validate(&self, record: &TypedRecord, seen: &mut SeenKeys) -> Vec<ErrorCause> {
        let mut causes = Vec::new();

        match &record.data {
            EntityData::Subject(r) => self.validate_subject(r, &mut causes),
            EntityData::Relationship(r) => self.validate_relationship(r, &mut causes),
            EntityData::AccountingData(r) => self.validate_accounting(r, &mut causes),
            EntityData::Link(r) => self.validate_link(r, &mut causes),
            EntityData::IdentifierChange(r) => self.validate_identifier_change(r, &mut causes),
        }

        let keys = record.keys();
        if seen.contains(&keys) {
            causes.push(ErrorCause::new(
                ErrorCode::DuplicateInSubmission,
                format!("duplicate within submission: {}", keys.display),
            ));
        }

        if causes.is_empty() {
            seen.insert(&keys);
        }

        causes
    }

    fn validate_subject(&self, s: &Subject, causes: &mut Vec<ErrorCause>) {
        require(causes, "intermediary", &s.intermediary);
        require(causes, "ndg", &s.ndg);
        require(causes, "subject_type", &s.subject_type);
        require(causes, "tax_code", &s.tax_code);
        require(causes, "surname", &s.surname);
        check_intermediary(causes, &s.intermediary);

        let birth_date = check_date(causes, "birth_date", &s.birth_date);

        if s.subject_type.is_empty() {
            return;
        }

        if s.is_natural_person() {
            if !s.tax_code.is_empty()
                && !(s.tax_code.len() == 16 && s.tax_code.chars().all(|c| c.is_ascii_alphanumeric()))
            {
                causes.push(ErrorCause::new(
                    ErrorCode::InvalidValue,
                    "tax_code of a natural person must be 16 alphanumeric characters",
                ));
            }
            for (field, value) in [
                ("first_name", &s.first_name),
                ("gender", &s.gender),
                ("birth_date", &s.birth_date),
            ] {
                if value.is_empty() {
                    causes.push(ErrorCause::new(
                        ErrorCode::InconsistentFields,
                        format!("{} is mandatory for subject type {}", field, TYPE_NATURAL),
                    ));
                }
            }
            if !s.gender.is_empty() && s.gender != "M" && s.gender != "F" {
                causes.push(ErrorCause::new(
                    ErrorCode::InvalidValue,
                    format!("gender must be M or F, got '{}'", s.gender),
                ));
            }
            if let Some(date) = birth_date {
                if date > self.today {
                    causes.push(ErrorCause::new(
                        ErrorCode::InconsistentFields,
                        "birth_date is in the future",
                    ));
                }
            }
        } else if s.subject_type.eq_ignore_ascii_case(TYPE_LEGAL) {
            if !s.tax_code.is_empty() && !is_digits(&s.tax_code, 11, 11) {
                causes.push(ErrorCause::new(
                    ErrorCode::InvalidValue,
                    "tax_code of a legal person must be 11 digits",
                ));
            }
            for (field, value) in [
                ("first_name", &s.first_name),
                ("gender", &s.gender),
                ("birth_date", &s.birth_date),
            ] {
                if !value.is_empty() {
                    causes.push(ErrorCause::new(
                        ErrorCode::InconsistentFields,
                        format!("{} must be empty for subject type {}", field, TYPE_LEGAL),
                    ));
                }
            }
        } else {
            causes.push(ErrorCause::new(
                ErrorCode::InvalidValue,
                format!(
                    "subject_type must be {} or {}, got '{}'",
                    TYPE_NATURAL, TYPE_LEGAL, s.subject_type
                ),
            ));
        }
    }

    fn validate_relationship(&self, r: &Relationship, causes: &mut Vec<ErrorCause>) {
        require(causes, "intermediary", &r.intermediary);
        require(causes, "relationship_key", &r.relationship_key);
        require(causes, "relationship_type", &r.relationship_type);
        require(causes, "opening_date", &r.opening_date);
        require(causes, "currency", &r.currency);
        check_intermediary(causes, &r.intermediary);
        check_code(causes, "relationship_type", &r.relationship_type);
        check_currency(causes, &r.currency);

        if !r.branch_code.is_empty() && !is_digits(&r.branch_code, 5, 5) {
            causes.push(ErrorCause::new(
                ErrorCode::InvalidValue,
                format!("branch_code must be 5 digits, got '{}'", r.branch_code),
            ));
        }

        let opening = check_date(causes, "opening_date", &r.opening_date);
        let closing = check_date(causes, "closing_date", &r.closing_date);
        check_order(causes, ("opening_date", opening), ("closing_date", closing));
    }

    fn validate_accounting(&self, a: &AccountingData, causes: &mut Vec<ErrorCause>) {
        require(causes, "intermediary", &a.intermediary);
        require(causes, "relationship_key", &a.relationship_key);
        require(causes, "reference_year", &a.reference_year);
        require(causes, "currency", &a.currency);
        check_intermediary(causes, &a.intermediary);
        check_currency(causes, &a.currency);

        if !a.reference_year.is_empty() {
            let in_range = is_digits(&a.reference_year, 4, 4)
                && a.reference_year
                    .parse::<i32>()
                    .map(|y| (1900..=2999).contains(&y))
                    .unwrap_or(false);
            if !in_range {
                causes.push(ErrorCause::new(
                    ErrorCode::InvalidValue,
                    format!("reference_year is not a valid year: '{}'", a.reference_year),
                ));
            }
        }

        for (field, value, signed) in [
            ("opening_balance", &a.opening_balance, true),
            ("closing_balance", &a.closing_balance, true),
            ("total_credits", &a.total_credits, false),
            ("total_debits", &a.total_debits, false),
        ] {
            require(causes, field, value);
            if value.is_empty() {
                continue;
            }
            if !is_amount(value) {
                causes.push(ErrorCause::new(
                    ErrorCode::InvalidValue,
                    format!("{} is not a valid amount: '{}'", field, value),
                ));
            } else if !signed && value.starts_with('-') {
                causes.push(ErrorCause::new(
                    ErrorCode::InvalidValue,
                    format!("{} cannot be negative", field),
                ));
            }
        }
    }

    fn validate_link(&self, l: &Link, causes: &mut Vec<ErrorCause>) {
        require(causes, "intermediary", &l.intermediary);
        require(causes, "relationship_key", &l.relationship_key);
        require(causes, "ndg", &l.ndg);
        require(causes, "role", &l.role);
        require(causes, "role_start_date", &l.role_start_date);
        check_intermediary(causes, &l.intermediary);
        check_code(causes, "role", &l.role);

        let start = check_date(causes, "role_start_date", &l.role_start_date);
        let end = check_date(causes, "role_end_date", &l.role_end_date);
        check_order(causes, ("role_start_date", start), ("role_end_date", end));
    }

    fn validate_identifier_change(&self, c: &IdentifierChange, causes: &mut Vec<ErrorCause>) {
        require(causes, "intermediary", &c.intermediary);
        require(causes, "old_ndg", &c.old_ndg);
        require(causes, "new_ndg", &c.new_ndg);
        require(causes, "change_date", &c.change_date);
        check_intermediary(causes, &c.intermediary);
        check_date(causes, "change_date", &c.change_date);

        if !c.old_ndg.is_empty() && canonical_part(&c.old_ndg) == canonical_part(&c.new_ndg) {
            causes.push(ErrorCause::new(
                ErrorCode::InconsistentFields,
                "old_ndg and new_ndg are the same identifier",
            ));
        }
    }
}

impl Default for FieldValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// RULE HELPERS
// ============================================================================

fn require(causes: &mut Vec<ErrorCause>, field: &str, value: &str) {
    if value.trim().is_empty() {
        causes.push(ErrorCause::new(
            ErrorCode::MissingField,
            format!("{} is mandatory", field),
        ));
    }
}

fn check_intermediary(causes: &mut Vec<ErrorCause>, value: &str) {
    if value.is_empty() {
        return;
    }
    let ok = (2..=11).contains(&value.len()) && value.chars().all(|c| c.is_ascii_alphanumeric());
    if !ok {
        causes.push(ErrorCause::new(
            ErrorCode::InvalidValue,
            format!("intermediary must be 2-11 alphanumeric characters, got '{}'", value),
        ));
    }
}

/// Numeric code of 1 to 3 digits (relationship type, role)
fn check_code(causes: &mut Vec<ErrorCause>, field: &str, value: &str) {
    if !value.is_empty() && !is_digits(value, 1, 3) {
        causes.push(ErrorCause::new(
            ErrorCode::InvalidValue,
            format!("{} must be a numeric code of 1-3 digits, got '{}'", field, value),
        ));
    }
}

fn check_currency(causes: &mut Vec<ErrorCause>, value: &str) {
    if !value.is_empty() && !(value.len() == 3 && value.chars().all(|c| c.is_ascii_uppercase())) {
        causes.push(ErrorCause::new(
            ErrorCode::InvalidValue,
            format!("currency must be a 3-letter ISO code, got '{}'", value),
        ));
    }
}

/// Parse an optional date; empty is fine here, mandatory-ness is checked apart.
fn check_date(causes: &mut Vec<ErrorCause>, field: &str, value: &str) -> Option<NaiveDate> {
    if value.is_empty() {
        return None;
    }
    match NaiveDate::parse_from_str(value, DATE_FORMAT) {
        Ok(date) => Some(date),
        Err(_) => {
            causes.push(ErrorCause::new(
                ErrorCode::InvalidValue,
                format!("{} is not a valid YYYYMMDD date: '{}'", field, value),
            ));
            None
        }
    }
}

fn check_order(
    causes: &mut Vec<ErrorCause>,
    (start_field, start): (&str, Option<NaiveDate>),
    (end_field, end): (&str, Option<NaiveDate>),
) {
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            causes.push(ErrorCause::new(
                ErrorCode::InconsistentFields,
                format!("{} is after {}", start_field, end_field),
            ));
        }
    }
}

fn is_digits(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit())
}

/// Signed decimal with at most two fractional digits: `-123`, `10.5`, `0.25`
fn is_amount(value: &str) -> bool {
    let unsigned = value.strip_prefix('-').unwrap_or(value);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    match frac_part {
        Some(f) => (1..=2).contains(&f.len()) && f.chars().all(|c| c.is_ascii_digit()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::RecordKind;
    use crate::parser::{get_parser, DEFAULT_DELIMITER};

    fn record(kind: RecordKind, line: &str) -> TypedRecord {
        get_parser(kind, DEFAULT_DELIMITER).parse(1, line).unwrap()
    }

    fn validator() -> FieldValidator {
        FieldValidator::with_today(NaiveDate::from_ymd_opt(2025, 6, 30).unwrap())
    }

    fn codes(causes: &[ErrorCause]) -> Vec<ErrorCode> {
        causes.iter().map(|c| c.code).collect()
    }

    #[test]
    fn test_valid_natural_person() {
        let mut seen = SeenKeys::new();
        let r = record(
            RecordKind::Subject,
            "IT01|NDG123|PF|RSSMRA80A01H501U|Rossi|Mario|M|19800101|Roma",
        );
        assert!(validator().validate(&r, &mut seen).is_empty());
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_valid_legal_person() {
        let mut seen = SeenKeys::new();
        let r = record(RecordKind::Subject, "IT01|NDG9|PNF|01234567890|ACME SPA||||Milano");
        assert!(validator().validate(&r, &mut seen).is_empty());
    }

    #[test]
    fn test_missing_mandatory_fields() {
        let mut seen = SeenKeys::new();
        let r = record(RecordKind::Subject, "IT01||PF|RSSMRA80A01H501U||Mario|M|19800101|Roma");
        let causes = validator().validate(&r, &mut seen);

        assert_eq!(
            codes(&causes),
            vec![ErrorCode::MissingField, ErrorCode::MissingField]
        );
        assert!(causes[0].message.contains("ndg"));
        assert!(causes[1].message.contains("surname"));
        assert!(seen.is_empty(), "invalid records never enter the seen-set");
    }

    #[test]
    fn test_legal_person_with_birth_data_is_inconsistent() {
        let mut seen = SeenKeys::new();
        let r = record(
            RecordKind::Subject,
            "IT01|NDG9|PNF|01234567890|ACME SPA||M|19800101|Milano",
        );
        let causes = validator().validate(&r, &mut seen);
        assert_eq!(
            codes(&causes),
            vec![ErrorCode::InconsistentFields, ErrorCode::InconsistentFields]
        );
    }

    #[test]
    fn test_birth_date_in_future() {
        let mut seen = SeenKeys::new();
        let r = record(
            RecordKind::Subject,
            "IT01|NDG1|PF|RSSMRA80A01H501U|Rossi|Mario|M|20300101|Roma",
        );
        let causes = validator().validate(&r, &mut seen);
        assert_eq!(codes(&causes), vec![ErrorCode::InconsistentFields]);
    }

    #[test]
    fn test_relationship_dates_out_of_order() {
        let mut seen = SeenKeys::new();
        let r = record(
            RecordKind::Relationship,
            "IT01|REL1|01|20240201|20240101|EUR|12345",
        );
        let causes = validator().validate(&r, &mut seen);
        assert_eq!(codes(&causes), vec![ErrorCode::InconsistentFields]);
        assert!(causes[0].message.contains("opening_date is after closing_date"));
    }

    #[test]
    fn test_relationship_format_errors() {
        let mut seen = SeenKeys::new();
        let r = record(RecordKind::Relationship, "IT01|REL1|ABC|2024-01-01||eur|12");
        let causes = validator().validate(&r, &mut seen);
        assert_eq!(
            codes(&causes),
            vec![
                ErrorCode::InvalidValue, // relationship_type
                ErrorCode::InvalidValue, // currency
                ErrorCode::InvalidValue, // branch_code
                ErrorCode::InvalidValue, // opening_date
            ]
        );
    }

    #[test]
    fn test_accounting_amounts() {
        let mut seen = SeenKeys::new();
        let ok = record(
            RecordKind::AccountingData,
            "IT01|REL1|2024|EUR|-10.50|200|1000.25|789",
        );
        assert!(validator().validate(&ok, &mut seen).is_empty());

        let bad = record(
            RecordKind::AccountingData,
            "IT01|REL2|24|EUR|1,000|200|-5|7.123",
        );
        let causes = validator().validate(&bad, &mut seen);
        assert_eq!(causes.len(), 4);
        assert!(causes.iter().all(|c| c.code == ErrorCode::InvalidValue));
    }

    #[test]
    fn test_identifier_change_same_ndg() {
        let mut seen = SeenKeys::new();
        let r = record(RecordKind::IdentifierChange, "IT01|ndg1|NDG1|20240101");
        let causes = validator().validate(&r, &mut seen);
        assert_eq!(codes(&causes), vec![ErrorCode::InconsistentFields]);
    }

    #[test]
    fn test_duplicate_key_in_file() {
        let v = validator();
        let mut seen = SeenKeys::new();
        let first = record(
            RecordKind::Subject,
            "IT01|NDG123|PF|RSSMRA80A01H501U|Rossi|Mario|M|19800101|Roma",
        );
        let second = record(
            RecordKind::Subject,
            "it01|ndg123|PF|RSSMRA80A01H501U|Rossi|Mario|M|19800101|Roma",
        );

        assert!(v.validate(&first, &mut seen).is_empty());
        let causes = v.validate(&second, &mut seen);
        assert_eq!(codes(&causes), vec![ErrorCode::DuplicateInSubmission]);
        assert!(causes[0].message.contains("duplicate within submission"));
    }

    #[test]
    fn test_link_duplicate_on_either_key() {
        let v = validator();
        let mut seen = SeenKeys::new();
        let base = record(RecordKind::Link, "IT01|REL1|NDG1|1|20240101|");
        let same_subject = record(RecordKind::Link, "IT01|REL2|NDG1|1|20240101|");
        let same_relationship = record(RecordKind::Link, "IT01|REL1|NDG2|1|20240101|");
        let unrelated = record(RecordKind::Link, "IT01|REL3|NDG3|1|20240101|20241231");

        assert!(v.validate(&base, &mut seen).is_empty());
        assert_eq!(
            codes(&v.validate(&same_subject, &mut seen)),
            vec![ErrorCode::DuplicateInSubmission]
        );
        assert_eq!(
            codes(&v.validate(&same_relationship, &mut seen)),
            vec![ErrorCode::DuplicateInSubmission]
        );
        assert!(v.validate(&unrelated, &mut seen).is_empty());
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert!(ErrorCode::MissingParent.is_referential());
        assert!(!ErrorCode::AlreadyExists.is_referential());
    }

    #[test]
    fn test_is_amount() {
        assert!(is_amount("0"));
        assert!(is_amount("-12.3"));
        assert!(is_amount("12.34"));
        assert!(!is_amount("12."));
        assert!(!is_amount(".5"));
        assert!(!is_amount("1e3"));
        assert!(!is_amount(""));
    }
}
