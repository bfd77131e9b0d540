// Staging Ingestion Service
// Drives one submission: claims it, ingests its files parents-first
// (load → process → report → clear staging, per file), and on a fatal
// error purges everything the submission wrote and marks it ERROR.

use rusqlite::Connection;
use serde::Serialize;
use std::io::Read;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::IngestConfig;
use crate::db::{self, run_in_transaction, IngestionCounts, Submission, SubmissionStatus, TxClass};
use crate::entities::RecordKind;
use crate::error::{EtlError, Result};
use crate::loader::BatchLoader;
use crate::parser::detect_kind;
use crate::reporter::{error_record_count, report_staging_errors};
use crate::staging::StagingProcessor;
use crate::store::ObjectStore;

/// A named byte stream of one record kind
pub struct SourceFile {
    pub name: String,
    pub kind: RecordKind,
    pub reader: Box<dyn Read + Send>,
}

impl SourceFile {
    /// Kind taken from the file name
    pub fn new(name: impl Into<String>, reader: Box<dyn Read + Send>) -> Result<Self> {
        let name = name.into();
        let kind = detect_kind(&name)?;
        Ok(SourceFile { name, kind, reader })
    }

    pub fn with_kind(name: impl Into<String>, kind: RecordKind, reader: Box<dyn Read + Send>) -> Self {
        SourceFile {
            name: name.into(),
            kind,
            reader,
        }
    }
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Outcome of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    pub ingestion_id: String,
    pub file_name: String,
    pub kind: RecordKind,
    pub sha256: String,
    #[serde(flatten)]
    pub counts: IngestionCounts,
    /// Rejected lines persisted for inspection (validation + staging)
    pub error_records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReport {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub files: Vec<FileResult>,
}

/// Fatal submission error, with the files that had completed before it
#[derive(Debug, Error)]
#[error("submission {submission_id} failed after {} file(s): {error}", .completed.len())]
pub struct SubmissionFailure {
    pub submission_id: String,
    pub completed: Vec<FileResult>,
    #[source]
    pub error: EtlError,
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct StagingIngestionService<'a> {
    conn: &'a Connection,
    config: IngestConfig,
}

impl<'a> StagingIngestionService<'a> {
    pub fn new(conn: &'a Connection, config: IngestConfig) -> Result<Self> {
        config.validate()?;
        if !config.use_staging_pipeline {
            return Err(EtlError::Config(
                "row-by-row ingestion is not available; set ETL_USE_STAGING=true".to_string(),
            ));
        }
        Ok(StagingIngestionService { conn, config })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn create_submission(&self, fiscal_year: Option<i32>) -> Result<Submission> {
        db::create_submission(self.conn, fiscal_year)
    }

    fn processor(&self) -> StagingProcessor<'a> {
        StagingProcessor::new(self.conn, self.config.timeouts, self.config.retry)
    }

    /// Ingest one file into a submission that is in `DATA_VALIDATION`.
    ///
    /// Per-file failures mark the ingestion FAILED and clear its staging rows;
    /// rolling back the submission is left to the caller.
    pub fn ingest_file<R: Read>(
        &self,
        submission_id: &str,
        kind: RecordKind,
        file_name: &str,
        reader: R,
    ) -> Result<FileResult> {
        let submission = db::get_submission(self.conn, submission_id)?;
        if submission.status != SubmissionStatus::DataValidation {
            return Err(EtlError::InvalidState {
                submission_id: submission_id.to_string(),
                from: submission.status.to_string(),
                to: format!("ingest {}", file_name),
            });
        }

        let ingestion_id = db::create_ingestion(self.conn, submission_id, file_name, kind)?;
        info!(submission_id, ingestion_id = %ingestion_id, kind = %kind, file_name, "Ingestion started");

        match self.run_ingestion(submission_id, &ingestion_id, kind, file_name, reader) {
            Ok(result) => Ok(result),
            Err(e) => {
                let message = db::truncate_message(&e.to_string());
                error!(
                    submission_id,
                    ingestion_id = %ingestion_id,
                    kind = %kind,
                    error = %message,
                    "Ingestion failed"
                );
                if let Err(clear_err) = self.processor().clear(kind, submission_id) {
                    warn!(ingestion_id = %ingestion_id, error = %clear_err, "Could not clear staging");
                }
                if let Err(mark_err) = db::fail_ingestion(self.conn, &ingestion_id, &message) {
                    warn!(ingestion_id = %ingestion_id, error = %mark_err, "Could not mark ingestion failed");
                }
                Err(e)
            }
        }
    }

    fn run_ingestion<R: Read>(
        &self,
        submission_id: &str,
        ingestion_id: &str,
        kind: RecordKind,
        file_name: &str,
        reader: R,
    ) -> Result<FileResult> {
        // 1. Stream → parse/validate → chunked staging load
        let mut loader = BatchLoader::new(self.conn, &self.config, kind, ingestion_id, submission_id);
        let sha256 = loader.load(reader)?;
        let stats = loader.finish()?;

        // 2. Set-based dedup, parent check, finalize
        let processor = self.processor();
        let outcome = processor.process(kind, submission_id)?;

        // 3. Flagged staging rows → error records
        self.config.retry.execute("report staging errors", || {
            run_in_transaction(self.conn, &self.config.timeouts, TxClass::BulkWrite, |tx| {
                report_staging_errors(tx, kind, submission_id)
            })
        })?;

        // 4. Staging rows live only for this file
        processor.clear(kind, submission_id)?;

        let counts = IngestionCounts {
            parsed: stats.parsed,
            staged: stats.staged,
            validation_errors: stats.validation_errors,
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            missing_parent: outcome.missing_parent,
        };
        db::complete_ingestion(self.conn, ingestion_id, &sha256, &counts)?;
        let error_records = error_record_count(self.conn, ingestion_id)?;

        info!(
            submission_id,
            ingestion_id,
            kind = %kind,
            parsed = counts.parsed,
            inserted = counts.inserted,
            duplicates = counts.duplicates,
            missing_parent = counts.missing_parent,
            validation_errors = counts.validation_errors,
            "Ingestion processed"
        );

        Ok(FileResult {
            ingestion_id: ingestion_id.to_string(),
            file_name: file_name.to_string(),
            kind,
            sha256,
            counts,
            error_records,
        })
    }

    /// Ingest a set of files as one submission run, parents first.
    ///
    /// The submission is claimed up front; a concurrent run of the same
    /// submission is refused without touching its data. On a fatal error
    /// every row of the submission is purged and it ends in `ERROR`.
    pub fn ingest_sources(
        &self,
        submission_id: &str,
        mut sources: Vec<SourceFile>,
    ) -> std::result::Result<SubmissionReport, SubmissionFailure> {
        let failure = |completed: Vec<FileResult>, error: EtlError| SubmissionFailure {
            submission_id: submission_id.to_string(),
            completed,
            error,
        };

        db::begin_validation(self.conn, submission_id).map_err(|e| failure(Vec::new(), e))?;

        sources.sort_by_key(|s| processing_rank(s.kind));

        let mut completed = Vec::with_capacity(sources.len());
        for source in sources {
            match self.ingest_file(submission_id, source.kind, &source.name, source.reader) {
                Ok(result) => completed.push(result),
                Err(e) => {
                    self.abort(submission_id, &source.name, &e);
                    return Err(failure(completed, e));
                }
            }
        }

        if let Err(e) = db::complete_validation(self.conn, submission_id) {
            self.abort(submission_id, "", &e);
            return Err(failure(completed, e));
        }

        info!(submission_id, files = completed.len(), "Submission validated");
        Ok(SubmissionReport {
            submission_id: submission_id.to_string(),
            status: SubmissionStatus::ValidationCompleted,
            files: completed,
        })
    }

    /// List, open and ingest every recognised object under `prefix`
    pub fn ingest_submission(
        &self,
        store: &dyn ObjectStore,
        submission_id: &str,
        prefix: &str,
    ) -> std::result::Result<SubmissionReport, SubmissionFailure> {
        let failure = |error: EtlError| SubmissionFailure {
            submission_id: submission_id.to_string(),
            completed: Vec::new(),
            error,
        };

        let objects = store.list_objects(prefix).map_err(failure)?;
        let mut sources = Vec::new();
        for object in objects {
            let kind = match detect_kind(object.file_name()) {
                Ok(kind) => kind,
                Err(_) => {
                    warn!(key = %object.key, "Skipping object of unknown kind");
                    continue;
                }
            };
            let reader = store.download_as_stream(&object.key).map_err(failure)?;
            sources.push(SourceFile::with_kind(object.key, kind, reader));
        }

        self.ingest_sources(submission_id, sources)
    }

    /// Compensating cleanup after a fatal error
    fn abort(&self, submission_id: &str, file_name: &str, cause: &EtlError) {
        let message = db::truncate_message(&cause.to_string());
        error!(submission_id, file_name, error = %message, "Submission failed, purging its rows");

        if let Err(e) = db::purge_submission(
            self.conn,
            &self.config.timeouts,
            &self.config.retry,
            submission_id,
        ) {
            error!(submission_id, error = %e, "Purge failed");
        }
        if let Err(e) = db::fail_submission(self.conn, submission_id, &message) {
            error!(submission_id, error = %e, "Could not mark submission ERROR");
        }
    }
}

fn processing_rank(kind: RecordKind) -> usize {
    RecordKind::PROCESSING_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(RecordKind::PROCESSING_ORDER.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use std::io::Cursor;

    fn source(name: &str, content: &str) -> SourceFile {
        SourceFile::new(name, Box::new(Cursor::new(content.as_bytes().to_vec()))).unwrap()
    }

    #[test]
    fn test_refuses_legacy_mode() {
        let conn = open_in_memory().unwrap();
        let config = IngestConfig {
            use_staging_pipeline: false,
            ..IngestConfig::default()
        };
        assert!(matches!(
            StagingIngestionService::new(&conn, config),
            Err(EtlError::Config(_))
        ));
    }

    #[test]
    fn test_files_processed_parents_first() {
        let conn = open_in_memory().unwrap();
        let service = StagingIngestionService::new(&conn, IngestConfig::default()).unwrap();
        let sub = service.create_submission(Some(2024)).unwrap();

        let report = service
            .ingest_sources(
                &sub.id,
                vec![
                    source("RAPPORTI_2024.txt", "IT01|REL1|01|20240101||EUR|\n"),
                    source("COLLEGAMENTI_2024.txt", "IT01|REL1|NDG1|1|20240101|\n"),
                ],
            )
            .unwrap();

        assert_eq!(report.status, SubmissionStatus::ValidationCompleted);
        assert_eq!(report.files[0].kind, RecordKind::Link);
        assert_eq!(report.files[1].kind, RecordKind::Relationship);
        assert_eq!(report.files[1].counts.inserted, 1);
        assert_eq!(report.files[1].counts.missing_parent, 0);
        assert_eq!(
            db::get_submission(&conn, &sub.id).unwrap().status,
            SubmissionStatus::ValidationCompleted
        );
    }

    #[test]
    fn test_ingest_file_requires_claimed_submission() {
        let conn = open_in_memory().unwrap();
        let service = StagingIngestionService::new(&conn, IngestConfig::default()).unwrap();
        let sub = service.create_submission(None).unwrap();

        let err = service
            .ingest_file(&sub.id, RecordKind::Link, "COLLEGAMENTI.txt", "".as_bytes())
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidState { .. }));
    }

    #[test]
    fn test_unknown_submission_is_reported() {
        let conn = open_in_memory().unwrap();
        let service = StagingIngestionService::new(&conn, IngestConfig::default()).unwrap();

        let failure = service.ingest_sources("missing", Vec::new()).unwrap_err();
        assert!(failure.completed.is_empty());
        assert!(matches!(failure.error, EtlError::SubmissionNotFound(_)));
    }

    #[test]
    fn test_file_result_serializes_flat() {
        let result = FileResult {
            ingestion_id: "ing".to_string(),
            file_name: "SOGGETTI.txt".to_string(),
            kind: RecordKind::Subject,
            sha256: "00".to_string(),
            counts: IngestionCounts {
                inserted: 2,
                ..IngestionCounts::default()
            },
            error_records: 1,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["kind"], "Subject");
    }
}
