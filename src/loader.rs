// Batch Loader
// Streams one file line by line through parser and validator, buffering
// valid records and rejected lines. A full buffer (or the end of the file)
// is flushed in one bounded write: error records first, then staging rows.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read};
use tracing::{debug, warn};

use crate::config::{IngestConfig, TimeoutConfig};
use crate::db::{run_in_transaction, TxClass};
use crate::entities::{RecordKind, TypedRecord};
use crate::error::Result;
use crate::parser::{get_parser, LineParser};
use crate::reporter::{record_line_errors, ErrorRow};
use crate::retry::RetryPolicy;
use crate::staging::stage_chunk;
use crate::validation::{ErrorCause, ErrorCode, FieldValidator, SeenKeys};

/// Running counters of one file pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderStats {
    /// Non-blank lines read
    pub parsed: u64,
    /// Valid records written to staging
    pub staged: u64,
    /// Lines rejected by the parser or the validator
    pub validation_errors: u64,
    pub chunks: u64,
}

pub struct BatchLoader<'a> {
    conn: &'a Connection,
    kind: RecordKind,
    ingestion_id: String,
    submission_id: String,
    chunk_size: usize,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
    parser: LineParser,
    validator: FieldValidator,
    /// Spans the whole file; never cleared on flush
    seen: SeenKeys,
    valid: Vec<TypedRecord>,
    errors: Vec<ErrorRow>,
    stats: LoaderStats,
}

impl<'a> BatchLoader<'a> {
    pub fn new(
        conn: &'a Connection,
        config: &IngestConfig,
        kind: RecordKind,
        ingestion_id: &str,
        submission_id: &str,
    ) -> Self {
        BatchLoader {
            conn,
            kind,
            ingestion_id: ingestion_id.to_string(),
            submission_id: submission_id.to_string(),
            chunk_size: config.chunk_size.max(1),
            timeouts: config.timeouts,
            retry: config.retry,
            parser: get_parser(kind, config.delimiter),
            validator: FieldValidator::new(),
            seen: SeenKeys::new(),
            valid: Vec::with_capacity(config.chunk_size.clamp(1, 10_000)),
            errors: Vec::new(),
            stats: LoaderStats::default(),
        }
    }

    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Parse and validate one line, flushing when a buffer is full
    pub fn push_line(&mut self, line_number: u64, line: &str) -> Result<()> {
        self.stats.parsed += 1;

        match self.parser.parse(line_number, line) {
            Ok(record) => {
                let causes = self.validator.validate(&record, &mut self.seen);
                if causes.is_empty() {
                    self.valid.push(record);
                } else {
                    self.reject(line_number, line, causes);
                }
            }
            Err(e) => {
                let cause = ErrorCause::new(ErrorCode::InvalidFormat, e.message);
                self.reject(line_number, line, vec![cause]);
            }
        }

        if self.valid.len() >= self.chunk_size || self.errors.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn reject(&mut self, line_number: u64, line: &str, causes: Vec<ErrorCause>) {
        self.stats.validation_errors += 1;
        self.errors.push(ErrorRow {
            line_number,
            raw_line: line.to_string(),
            causes,
        });
    }

    /// Write buffered error rows, then buffered records, in one transaction
    pub fn flush(&mut self) -> Result<()> {
        if self.valid.is_empty() && self.errors.is_empty() {
            return Ok(());
        }

        let (kind, ingestion_id, submission_id) =
            (self.kind, self.ingestion_id.as_str(), self.submission_id.as_str());
        let (valid, errors) = (&self.valid, &self.errors);

        let staged = self.retry.execute("stage chunk", || {
            run_in_transaction(self.conn, &self.timeouts, TxClass::BulkWrite, |tx| {
                record_line_errors(tx, ingestion_id, submission_id, errors)?;
                stage_chunk(tx, kind, ingestion_id, submission_id, valid)
            })
        })?;

        self.stats.staged += staged as u64;
        self.stats.chunks += 1;
        debug!(
            ingestion_id,
            kind = %kind,
            staged,
            errors = errors.len(),
            seen_keys = self.seen.len(),
            "Chunk flushed"
        );

        self.valid.clear();
        self.errors.clear();
        Ok(())
    }

    /// Consume a whole stream; returns the hex SHA-256 of the bytes read.
    ///
    /// Lines are `\n`-terminated (`\r\n` accepted), decoded lossily and
    /// numbered from 1; blank lines are skipped. If reading fails midway
    /// the buffered chunk is still flushed before the error is returned.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<String> {
        let mut reader = BufReader::new(reader);
        let mut hasher = Sha256::new();
        let mut buf = Vec::new();
        let mut line_number = 0u64;

        loop {
            buf.clear();
            let read = match reader.read_until(b'\n', &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        ingestion_id = %self.ingestion_id,
                        line_number,
                        error = %e,
                        "Read failed, flushing buffered chunk"
                    );
                    self.flush()?;
                    return Err(e.into());
                }
            };
            if read == 0 {
                break;
            }
            hasher.update(&buf);
            line_number += 1;

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }

            self.push_line(line_number, line)?;
        }

        self.flush()?;
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Flush what is left and hand back the counters
    pub fn finish(mut self) -> Result<LoaderStats> {
        self.flush()?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_submission, open_in_memory, staging_count};
    use crate::reporter::error_details;
    use std::io::{self, Cursor};

    fn config(chunk_size: usize) -> IngestConfig {
        IngestConfig {
            chunk_size,
            ..IngestConfig::default()
        }
    }

    /// Yields `data`, then fails
    struct BrokenReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for BrokenReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(out)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "connection reset"));
            }
            Ok(n)
        }
    }

    #[test]
    fn test_duplicate_across_chunk_boundary_is_caught() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, None).unwrap();
        let mut loader = BatchLoader::new(&conn, &config(2), RecordKind::Link, "ing-1", &sub.id);

        let input = "IT01|REL1|NDG1|1|20240101|\n\
                     IT01|REL2|NDG2|1|20240101|\n\
                     IT01|REL3|NDG1|1|20240101|\n";
        loader.load(input.as_bytes()).unwrap();
        let stats = loader.finish().unwrap();

        assert_eq!(stats.parsed, 3);
        assert_eq!(stats.staged, 2);
        assert_eq!(stats.validation_errors, 1);
        assert_eq!(staging_count(&conn, RecordKind::Link, &sub.id).unwrap(), 2);

        let details = error_details(&conn, &sub.id, Some("ing-1")).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].line_number, 3);
        assert_eq!(details[0].error_code, "DUPLICATE_IN_SUBMISSION");
    }

    #[test]
    fn test_malformed_and_blank_lines() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, None).unwrap();
        let mut loader =
            BatchLoader::new(&conn, &config(100), RecordKind::IdentifierChange, "ing-1", &sub.id);

        let input = "IT01|NDG1|NDG2|20240101\r\n\r\n   \nIT01|NDG3\nIT01|NDG4|NDG5|20240101";
        let digest = loader.load(input.as_bytes()).unwrap();
        let stats = loader.stats();

        assert_eq!(stats.parsed, 3);
        assert_eq!(stats.staged, 2);
        assert_eq!(stats.validation_errors, 1);
        assert_eq!(stats.parsed, stats.staged + stats.validation_errors);

        let details = error_details(&conn, &sub.id, None).unwrap();
        assert_eq!(details[0].line_number, 4);
        assert_eq!(details[0].raw_line, "IT01|NDG3");
        assert_eq!(details[0].error_code, "INVALID_FORMAT");

        let expected = format!("{:x}", Sha256::digest(input.as_bytes()));
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_read_failure_flushes_buffered_chunk() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, None).unwrap();
        let mut loader =
            BatchLoader::new(&conn, &config(100), RecordKind::IdentifierChange, "ing-1", &sub.id);

        let reader = BrokenReader {
            data: Cursor::new(b"IT01|NDG1|NDG2|20240101\nIT01|NDG3|NDG4|20240101\n".to_vec()),
        };
        let err = loader.load(reader).unwrap_err();

        assert!(matches!(err, crate::error::EtlError::Io(_)));
        assert_eq!(
            staging_count(&conn, RecordKind::IdentifierChange, &sub.id).unwrap(),
            2
        );
    }
}
