// Line Parser
// Turns one raw delimited line into a typed record for a known kind.
// No business validation happens here: only arity and splitting.

use csv::{Reader, ReaderBuilder, StringRecord, Trim};
use std::io::{self, Read};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::{RecordKind, TypedRecord};
use crate::error::{EtlError, Result};

/// Default field delimiter of the fixed layouts
pub const DEFAULT_DELIMITER: u8 = b'|';

// ============================================================================
// PARSE ERROR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseErrorKind {
    /// Wrong number of fields, or the line could not be split at all
    MalformedLine,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line_number: u64,
    /// Index of the first missing (or first unexpected) field
    pub field_index: Option<usize>,
    pub message: String,
}

impl ParseError {
    fn malformed(line_number: u64, field_index: Option<usize>, message: String) -> Self {
        ParseError {
            kind: ParseErrorKind::MalformedLine,
            line_number,
            field_index,
            message,
        }
    }
}

// ============================================================================
// LINE PARSER
// ============================================================================

/// Input of the long-lived csv reader: holds the current line plus its
/// terminator, then reports end of input.
#[derive(Debug, Default)]
struct LineFeed {
    line: Vec<u8>,
    pos: usize,
    /// Set once the reader asked for bytes past the current line
    drained: bool,
}

impl LineFeed {
    fn load(&mut self, line: &str) {
        self.line.clear();
        self.line.extend_from_slice(line.as_bytes());
        self.line.push(b'\n');
        self.pos = 0;
        self.drained = false;
    }
}

impl Read for LineFeed {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let rest = &self.line[self.pos..];
        if rest.is_empty() {
            self.drained = true;
            return Ok(0);
        }
        let n = rest.len().min(out.len());
        out[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

fn line_reader(delimiter: u8) -> Reader<LineFeed> {
    ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(LineFeed::default())
}

/// Parser for one record kind.
///
/// Keeps one csv reader and one record buffer for the whole file pass; each
/// line is fed in with its terminator, so the reader never needs to look
/// past it.
pub struct LineParser {
    kind: RecordKind,
    delimiter: u8,
    reader: Reader<LineFeed>,
    record: StringRecord,
}

impl LineParser {
    pub fn new(kind: RecordKind, delimiter: u8) -> Self {
        LineParser {
            kind,
            delimiter,
            reader: line_reader(delimiter),
            record: StringRecord::new(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Split `line` and map its fields positionally onto the kind's layout.
    ///
    /// Fields are trimmed (fixed layouts pad with blanks) and may be quoted.
    pub fn parse(&mut self, line_number: u64, line: &str) -> std::result::Result<TypedRecord, ParseError> {
        self.reader.get_mut().load(line);
        let read = self.reader.read_record(&mut self.record);

        // An open quote or an empty line makes the reader hit end of input,
        // after which it returns nothing; start the next line on a fresh one.
        if read.is_err() || self.reader.get_ref().drained {
            self.reader = line_reader(self.delimiter);
        }

        match read {
            Ok(true) => {}
            Ok(false) => {
                return Err(ParseError::malformed(
                    line_number,
                    Some(0),
                    "empty line".to_string(),
                ))
            }
            Err(e) => {
                return Err(ParseError::malformed(
                    line_number,
                    None,
                    format!("cannot split line: {}", e),
                ))
            }
        }

        let expected = self.kind.field_count();
        let found = self.record.len();
        if found != expected {
            return Err(ParseError::malformed(
                line_number,
                Some(found.min(expected)),
                format!(
                    "{} line has {} fields, expected {}",
                    self.kind.name(),
                    found,
                    expected
                ),
            ));
        }

        let fields: Vec<String> = self.record.iter().map(String::from).collect();
        Ok(TypedRecord::from_fields(
            self.kind,
            fields,
            line_number,
            line.to_string(),
        ))
    }
}

impl std::fmt::Debug for LineParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineParser")
            .field("kind", &self.kind)
            .field("delimiter", &(self.delimiter as char))
            .finish()
    }
}

/// Get the parser for a record kind
pub fn get_parser(kind: RecordKind, delimiter: u8) -> LineParser {
    LineParser::new(kind, delimiter)
}

// ============================================================================
// FILE NAME CONVENTIONS
// ============================================================================

/// Detect the record kind from a file name
///
/// # Examples:
/// ```
/// # use rapporti_etl::parser::detect_kind;
/// # use rapporti_etl::RecordKind;
/// assert_eq!(detect_kind("SOGGETTI_2024.txt").unwrap(), RecordKind::Subject);
/// assert_eq!(detect_kind("in/collegamenti_2024.txt").unwrap(), RecordKind::Link);
/// ```
pub fn detect_kind(file_name: &str) -> Result<RecordKind> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let lower = base.to_lowercase();

    // Most specific names first: "dati_contabili_rapporti" is accounting data
    if lower.contains("cambio_ndg") || lower.contains("identifier_change") {
        return Ok(RecordKind::IdentifierChange);
    }

    if lower.contains("dati_contabili") || lower.contains("accounting") {
        return Ok(RecordKind::AccountingData);
    }

    if lower.contains("collegament") || lower.contains("link") {
        return Ok(RecordKind::Link);
    }

    if lower.contains("rapport") || lower.contains("relationship") {
        return Ok(RecordKind::Relationship);
    }

    if lower.contains("soggett") || lower.contains("subject") {
        return Ok(RecordKind::Subject);
    }

    Err(EtlError::UnknownFileKind(file_name.to_string()))
}

/// Extract the fiscal year encoded in a file name, if any
pub fn fiscal_period(file_name: &str) -> Option<i32> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let bytes = base.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 {
                if let Ok(year) = base[start..i].parse::<i32>() {
                    if (1900..=2999).contains(&year) {
                        return Some(year);
                    }
                }
            }
        } else {
            i += 1;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityData;

    #[test]
    fn test_parse_subject_line() {
        let mut parser = get_parser(RecordKind::Subject, DEFAULT_DELIMITER);
        let line = "IT01|NDG123|PF|RSSMRA80A01H501U| Rossi |Mario|M|19800101|Roma";

        let record = parser.parse(7, line).unwrap();

        assert_eq!(record.line_number, 7);
        assert_eq!(record.raw_line, line);
        match record.data {
            EntityData::Subject(s) => {
                assert_eq!(s.ndg, "NDG123");
                assert_eq!(s.surname, "Rossi");
                assert_eq!(s.birth_place, "Roma");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_quoted_field_may_contain_delimiter() {
        let mut parser = get_parser(RecordKind::IdentifierChange, DEFAULT_DELIMITER);
        let record = parser.parse(1, "IT01|\"A|B\"|NDG2|20240101").unwrap();
        assert_eq!(record.values()[1], "A|B");
    }

    #[test]
    fn test_too_few_fields_reports_first_missing_index() {
        let mut parser = get_parser(RecordKind::Link, DEFAULT_DELIMITER);
        let err = parser.parse(3, "IT01|REL1|NDG1").unwrap_err();

        assert_eq!(err.kind, ParseErrorKind::MalformedLine);
        assert_eq!(err.line_number, 3);
        assert_eq!(err.field_index, Some(3));
        assert!(err.message.contains("expected 6"));
    }

    #[test]
    fn test_too_many_fields() {
        let mut parser = get_parser(RecordKind::IdentifierChange, DEFAULT_DELIMITER);
        let err = parser.parse(1, "IT01|A|B|20240101|extra").unwrap_err();
        assert_eq!(err.field_index, Some(4));
    }

    #[test]
    fn test_custom_delimiter() {
        let mut parser = get_parser(RecordKind::IdentifierChange, b';');
        let record = parser.parse(1, "IT01;A;B;20240101").unwrap();
        assert_eq!(record.values(), vec!["IT01", "A", "B", "20240101"]);
    }

    #[test]
    fn test_one_parser_serves_a_whole_file() {
        let mut parser = get_parser(RecordKind::IdentifierChange, DEFAULT_DELIMITER);

        for i in 1..=500u64 {
            let line = format!("IT01|OLD{i}|NEW{i}|20240101");
            let record = parser.parse(i, &line).unwrap();
            assert_eq!(record.values()[1], format!("OLD{i}"));
            assert_eq!(record.raw_line, line);
        }
    }

    #[test]
    fn test_bad_lines_do_not_poison_later_lines() {
        let mut parser = get_parser(RecordKind::IdentifierChange, DEFAULT_DELIMITER);

        // Unbalanced quote swallows the rest of the line
        let err = parser.parse(1, "IT01|\"OLD1|NEW1|20240101").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MalformedLine);

        let record = parser.parse(2, "IT01|OLD2|NEW2|20240101").unwrap();
        assert_eq!(record.values(), vec!["IT01", "OLD2", "NEW2", "20240101"]);

        assert_eq!(parser.parse(3, "").unwrap_err().field_index, Some(0));

        let record = parser.parse(4, "IT01|OLD4|NEW4|20240102").unwrap();
        assert_eq!(record.line_number, 4);
        assert_eq!(record.values()[3], "20240102");
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(detect_kind("SOGGETTI_2024.txt").unwrap(), RecordKind::Subject);
        assert_eq!(detect_kind("rapporti_2024.txt").unwrap(), RecordKind::Relationship);
        assert_eq!(
            detect_kind("DATI_CONTABILI_2024.txt").unwrap(),
            RecordKind::AccountingData
        );
        assert_eq!(detect_kind("COLLEGAMENTI_2024.txt").unwrap(), RecordKind::Link);
        assert_eq!(
            detect_kind("CAMBIO_NDG_2024.txt").unwrap(),
            RecordKind::IdentifierChange
        );
        assert_eq!(
            detect_kind("uploads/2024/subjects.txt").unwrap(),
            RecordKind::Subject
        );
        assert!(matches!(
            detect_kind("readme.md"),
            Err(EtlError::UnknownFileKind(_))
        ));
    }

    #[test]
    fn test_fiscal_period() {
        assert_eq!(fiscal_period("SOGGETTI_2024.txt"), Some(2024));
        assert_eq!(fiscal_period("in/2023/RAPPORTI_2024_v12.txt"), Some(2024));
        assert_eq!(fiscal_period("RAPPORTI_123456.txt"), None);
        assert_eq!(fiscal_period("RAPPORTI.txt"), None);
    }
}
