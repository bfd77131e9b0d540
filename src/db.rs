use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TimeoutConfig;
use crate::entities::RecordKind;
use crate::error::{EtlError, Result};
use crate::retry::RetryPolicy;

/// Longest error text persisted on a submission or ingestion row
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1_000;

// ============================================================================
// CONNECTION & BOUNDED TRANSACTIONS
// ============================================================================

/// Open (or create) the database file and make sure every table exists
pub fn open_database(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure_connection(&conn)?;
    setup_database(&conn)?;
    info!(path, "Database ready");
    Ok(conn)
}

/// In-memory database with the full schema (tests, dry runs)
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_connection(&conn)?;
    setup_database(&conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases answer "memory"
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "Journal mode set");
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}

/// Lock-wait class of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxClass {
    /// Counts and detail queries
    ReadOnly,
    /// Chunk loads, error-row inserts, purges, bookkeeping
    BulkWrite,
    /// Whole-table staging steps
    HeavyAggregate,
}

impl TxClass {
    pub fn timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        match self {
            TxClass::ReadOnly => timeouts.read_only,
            TxClass::BulkWrite => timeouts.bulk_write,
            TxClass::HeavyAggregate => timeouts.heavy,
        }
    }

    fn behavior(&self) -> TransactionBehavior {
        match self {
            TxClass::ReadOnly => TransactionBehavior::Deferred,
            TxClass::BulkWrite | TxClass::HeavyAggregate => TransactionBehavior::Immediate,
        }
    }
}

/// Run `f` inside one transaction whose lock wait is bounded by `class`.
///
/// Commits when `f` succeeds. Any error rolls the transaction back (on drop)
/// and is returned unchanged, so lock timeouts stay visible to the retry
/// executor.
pub fn run_in_transaction<T, F>(
    conn: &Connection,
    timeouts: &TimeoutConfig,
    class: TxClass,
    f: F,
) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    conn.busy_timeout(class.timeout(timeouts))?;
    let tx = Transaction::new_unchecked(conn, class.behavior())?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Submissions & ingestions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions (
            id TEXT PRIMARY KEY,
            fiscal_year INTEGER,
            status TEXT NOT NULL,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ingestions (
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL REFERENCES submissions(id),
            file_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            sha256 TEXT,
            parsed INTEGER NOT NULL DEFAULT 0,
            staged INTEGER NOT NULL DEFAULT 0,
            validation_errors INTEGER NOT NULL DEFAULT 0,
            inserted INTEGER NOT NULL DEFAULT 0,
            duplicates INTEGER NOT NULL DEFAULT 0,
            missing_parent INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Error records (one per rejected line) and their causes
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS error_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ingestion_id TEXT NOT NULL,
            submission_id TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            raw_line TEXT NOT NULL,
            origin TEXT NOT NULL,
            origin_row_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (ingestion_id, origin, origin_row_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS error_causes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            error_record_id INTEGER NOT NULL REFERENCES error_records(id),
            error_code TEXT NOT NULL,
            message TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Staging + production table per record kind (Link first: it is the
    // foreign-key target of the dependents)
    // ==========================================================================
    for kind in RecordKind::PROCESSING_ORDER {
        conn.execute(&staging_table_ddl(kind), [])?;
        conn.execute(&production_table_ddl(kind), [])?;
    }

    // ==========================================================================
    // Indexes
    // ==========================================================================
    let mut indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_ingestions_submission ON ingestions(submission_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_error_records_submission ON error_records(submission_id, ingestion_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_error_causes_record ON error_causes(error_record_id)".to_string(),
    ];
    for kind in RecordKind::PROCESSING_ORDER {
        let stg = kind.staging_table();
        indexes.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{stg}_key ON {stg}(submission_id, key_norm)"
        ));
        if kind.has_alt_key() {
            indexes.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{stg}_alt_key ON {stg}(submission_id, alt_key_norm)"
            ));
        }
        if kind.parent().is_some() {
            let prod = kind.production_table();
            indexes.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{prod}_parent ON {prod}(submission_id, parent_norm)"
            ));
        }
    }
    for sql in &indexes {
        conn.execute(sql, [])?;
    }

    Ok(())
}

fn business_columns_ddl(kind: RecordKind) -> String {
    kind.columns()
        .iter()
        .map(|c| format!("{c} TEXT"))
        .collect::<Vec<_>>()
        .join(",\n            ")
}

/// Canonical-key columns carried by both staging and production rows
pub(crate) fn norm_columns(kind: RecordKind) -> Vec<&'static str> {
    let mut cols = vec!["key_norm"];
    if kind.has_alt_key() {
        cols.push("alt_key_norm");
    }
    if kind.parent().is_some() {
        cols.push("parent_norm");
    }
    cols
}

fn norm_columns_ddl(kind: RecordKind) -> String {
    norm_columns(kind)
        .iter()
        .map(|c| {
            if *c == "parent_norm" {
                format!("{c} TEXT")
            } else {
                format!("{c} TEXT NOT NULL")
            }
        })
        .collect::<Vec<_>>()
        .join(",\n            ")
}

fn staging_table_ddl(kind: RecordKind) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ingestion_id TEXT NOT NULL,
            submission_id TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            raw_line TEXT NOT NULL,
            {business},
            {norms},
            process_status INTEGER,
            error_message TEXT
        )",
        table = kind.staging_table(),
        business = business_columns_ddl(kind),
        norms = norm_columns_ddl(kind),
    )
}

fn production_table_ddl(kind: RecordKind) -> String {
    let mut constraints = vec![
        "FOREIGN KEY (submission_id) REFERENCES submissions(id)".to_string(),
        "UNIQUE (submission_id, key_norm)".to_string(),
    ];
    if kind.has_alt_key() {
        constraints.push("UNIQUE (submission_id, alt_key_norm)".to_string());
    }
    if let Some(parent) = kind.parent() {
        constraints.push(format!(
            "FOREIGN KEY (submission_id, parent_norm) REFERENCES {link}(submission_id, {col})",
            link = RecordKind::Link.production_table(),
            col = parent.link_column(),
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id TEXT NOT NULL,
            ingestion_id TEXT NOT NULL,
            {business},
            {norms},
            output_id INTEGER,
            created_at TEXT NOT NULL,
            {constraints}
        )",
        table = kind.production_table(),
        business = business_columns_ddl(kind),
        norms = norm_columns_ddl(kind),
        constraints = constraints.join(",\n            "),
    )
}

// ============================================================================
// SUBMISSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Created,
    DataValidation,
    ValidationCompleted,
    Error,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Created => "CREATED",
            SubmissionStatus::DataValidation => "DATA_VALIDATION",
            SubmissionStatus::ValidationCompleted => "VALIDATION_COMPLETED",
            SubmissionStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<SubmissionStatus> {
        match s {
            "CREATED" => Some(SubmissionStatus::Created),
            "DATA_VALIDATION" => Some(SubmissionStatus::DataValidation),
            "VALIDATION_COMPLETED" => Some(SubmissionStatus::ValidationCompleted),
            "ERROR" => Some(SubmissionStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One isolated ingestion run; the unit of rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub fiscal_year: Option<i32>,
    pub status: SubmissionStatus,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn create_submission(conn: &Connection, fiscal_year: Option<i32>) -> Result<Submission> {
    let now = Utc::now().to_rfc3339();
    let submission = Submission {
        id: uuid::Uuid::new_v4().to_string(),
        fiscal_year,
        status: SubmissionStatus::Created,
        error_message: None,
        created_at: now.clone(),
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO submissions (id, fiscal_year, status, error_message, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
        params![
            submission.id,
            submission.fiscal_year,
            submission.status.as_str(),
            submission.created_at,
            submission.updated_at,
        ],
    )?;

    info!(submission_id = %submission.id, ?fiscal_year, "Submission created");
    Ok(submission)
}

pub fn find_submission(conn: &Connection, id: &str) -> Result<Option<Submission>> {
    let row = conn
        .query_row(
            "SELECT id, fiscal_year, status, error_message, created_at, updated_at
             FROM submissions WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i32>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((id, fiscal_year, status, error_message, created_at, updated_at)) => {
            let status = SubmissionStatus::parse(&status).ok_or_else(|| {
                EtlError::Config(format!("unknown submission status '{}'", status))
            })?;
            Ok(Some(Submission {
                id,
                fiscal_year,
                status,
                error_message,
                created_at,
                updated_at,
            }))
        }
    }
}

pub fn get_submission(conn: &Connection, id: &str) -> Result<Submission> {
    find_submission(conn, id)?.ok_or_else(|| EtlError::SubmissionNotFound(id.to_string()))
}

/// Move a submission to `to` if (and only if) it is currently in one of `from`.
///
/// The check and the write are a single conditional UPDATE, so two runs
/// racing for the same submission cannot both win.
pub fn transition_submission(
    conn: &Connection,
    id: &str,
    from: &[SubmissionStatus],
    to: SubmissionStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let placeholders = (0..from.len())
        .map(|i| format!("?{}", i + 5))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE submissions SET status = ?1, error_message = ?2, updated_at = ?3
         WHERE id = ?4 AND status IN ({placeholders})"
    );

    let now = Utc::now().to_rfc3339();
    let message = error_message.map(truncate_message);
    let mut values: Vec<Option<String>> = vec![
        Some(to.as_str().to_string()),
        message,
        Some(now),
        Some(id.to_string()),
    ];
    values.extend(from.iter().map(|s| Some(s.as_str().to_string())));

    let changed = conn.execute(&sql, params_from_iter(values))?;
    if changed == 1 {
        debug!(submission_id = id, to = %to, "Submission status changed");
        return Ok(());
    }

    let current = get_submission(conn, id)?;
    Err(EtlError::InvalidState {
        submission_id: id.to_string(),
        from: current.status.to_string(),
        to: to.to_string(),
    })
}

/// Claim a submission for a validation run
pub fn begin_validation(conn: &Connection, id: &str) -> Result<()> {
    transition_submission(
        conn,
        id,
        &[SubmissionStatus::Created, SubmissionStatus::ValidationCompleted],
        SubmissionStatus::DataValidation,
        None,
    )
}

pub fn complete_validation(conn: &Connection, id: &str) -> Result<()> {
    transition_submission(
        conn,
        id,
        &[SubmissionStatus::DataValidation],
        SubmissionStatus::ValidationCompleted,
        None,
    )
}

pub fn fail_submission(conn: &Connection, id: &str, message: &str) -> Result<()> {
    transition_submission(
        conn,
        id,
        &[SubmissionStatus::DataValidation],
        SubmissionStatus::Error,
        Some(message),
    )
}

/// Cut a diagnostic message to `MAX_ERROR_MESSAGE_CHARS` characters
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

// ============================================================================
// INGESTIONS (one per consumed file)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Staged,
    Processed,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Staged => "STAGED",
            IngestionStatus::Processed => "PROCESSED",
            IngestionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<IngestionStatus> {
        match s {
            "STAGED" => Some(IngestionStatus::Staged),
            "PROCESSED" => Some(IngestionStatus::Processed),
            "FAILED" => Some(IngestionStatus::Failed),
            _ => None,
        }
    }
}

/// Per-file counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCounts {
    pub parsed: u64,
    pub staged: u64,
    pub validation_errors: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub missing_parent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingestion {
    pub id: String,
    pub submission_id: String,
    pub file_name: String,
    pub kind: RecordKind,
    pub status: IngestionStatus,
    pub sha256: Option<String>,
    pub counts: IngestionCounts,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn create_ingestion(
    conn: &Connection,
    submission_id: &str,
    file_name: &str,
    kind: RecordKind,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO ingestions (id, submission_id, file_name, kind, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            id,
            submission_id,
            file_name,
            kind.code(),
            IngestionStatus::Staged.as_str(),
            now,
        ],
    )?;

    Ok(id)
}

pub fn complete_ingestion(
    conn: &Connection,
    id: &str,
    sha256: &str,
    counts: &IngestionCounts,
) -> Result<()> {
    conn.execute(
        "UPDATE ingestions SET status = ?1, sha256 = ?2, parsed = ?3, staged = ?4,
             validation_errors = ?5, inserted = ?6, duplicates = ?7, missing_parent = ?8,
             updated_at = ?9
         WHERE id = ?10",
        params![
            IngestionStatus::Processed.as_str(),
            sha256,
            counts.parsed as i64,
            counts.staged as i64,
            counts.validation_errors as i64,
            counts.inserted as i64,
            counts.duplicates as i64,
            counts.missing_parent as i64,
            Utc::now().to_rfc3339(),
            id,
        ],
    )?;
    Ok(())
}

pub fn fail_ingestion(conn: &Connection, id: &str, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingestions SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            IngestionStatus::Failed.as_str(),
            truncate_message(message),
            Utc::now().to_rfc3339(),
            id,
        ],
    )?;
    Ok(())
}

pub fn list_ingestions(conn: &Connection, submission_id: &str) -> Result<Vec<Ingestion>> {
    let mut stmt = conn.prepare(
        "SELECT id, submission_id, file_name, kind, status, sha256,
                parsed, staged, validation_errors, inserted, duplicates, missing_parent,
                error_message, created_at, updated_at
         FROM ingestions
         WHERE submission_id = ?1
         ORDER BY created_at, rowid",
    )?;

    let rows = stmt
        .query_map(params![submission_id], |row| {
            let kind: String = row.get(3)?;
            let status: String = row.get(4)?;
            Ok(Ingestion {
                id: row.get(0)?,
                submission_id: row.get(1)?,
                file_name: row.get(2)?,
                kind: RecordKind::from_code(&kind).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(3, kind.clone(), rusqlite::types::Type::Text)
                })?,
                status: IngestionStatus::parse(&status).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(4, status.clone(), rusqlite::types::Type::Text)
                })?,
                sha256: row.get(5)?,
                counts: IngestionCounts {
                    parsed: row.get::<_, i64>(6)? as u64,
                    staged: row.get::<_, i64>(7)? as u64,
                    validation_errors: row.get::<_, i64>(8)? as u64,
                    inserted: row.get::<_, i64>(9)? as u64,
                    duplicates: row.get::<_, i64>(10)? as u64,
                    missing_parent: row.get::<_, i64>(11)? as u64,
                },
                error_message: row.get(12)?,
                created_at: row.get(13)?,
                updated_at: row.get(14)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

// ============================================================================
// COUNTS & COMPENSATING PURGE
// ============================================================================

/// Production rows of `kind` committed for a submission
pub fn production_count(conn: &Connection, kind: RecordKind, submission_id: &str) -> Result<i64> {
    let count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE submission_id = ?1",
            kind.production_table()
        ),
        params![submission_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Staging rows of `kind` still present for a submission
pub fn staging_count(conn: &Connection, kind: RecordKind, submission_id: &str) -> Result<i64> {
    let count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE submission_id = ?1",
            kind.staging_table()
        ),
        params![submission_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Delete every row tagged with the submission across all entity tables.
///
/// Error records, staging and production rows go in one write transaction;
/// dependents are deleted before Link so foreign keys hold throughout.
/// Submission and ingestion rows are kept for diagnosis.
pub fn purge_submission(
    conn: &Connection,
    timeouts: &TimeoutConfig,
    retry: &RetryPolicy,
    submission_id: &str,
) -> Result<usize> {
    let deleted = retry.execute("purge submission", || {
        run_in_transaction(conn, timeouts, TxClass::BulkWrite, |tx| {
            let mut deleted = tx.execute(
                "DELETE FROM error_causes WHERE error_record_id IN
                     (SELECT id FROM error_records WHERE submission_id = ?1)",
                params![submission_id],
            )?;
            deleted += tx.execute(
                "DELETE FROM error_records WHERE submission_id = ?1",
                params![submission_id],
            )?;

            for kind in RecordKind::PROCESSING_ORDER {
                deleted += tx.execute(
                    &format!("DELETE FROM {} WHERE submission_id = ?1", kind.staging_table()),
                    params![submission_id],
                )?;
            }
            for kind in RecordKind::PROCESSING_ORDER.iter().rev() {
                deleted += tx.execute(
                    &format!("DELETE FROM {} WHERE submission_id = ?1", kind.production_table()),
                    params![submission_id],
                )?;
            }
            Ok(deleted)
        })
    })?;

    info!(submission_id, deleted, "Submission rows purged");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    fn insert_link(conn: &Connection, submission_id: &str, key: &str, alt: &str) {
        conn.execute(
            "INSERT INTO link (submission_id, ingestion_id, intermediary, relationship_key, ndg,
                               role, role_start_date, role_end_date, key_norm, alt_key_norm, created_at)
             VALUES (?1, 'ing', 'IT01', 'REL', 'NDG', '1', '20240101', '', ?2, ?3, 'now')",
            params![submission_id, key, alt],
        )
        .unwrap();
    }

    fn insert_subject(conn: &Connection, submission_id: &str, key: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO subject (submission_id, ingestion_id, intermediary, ndg, subject_type,
                                  tax_code, surname, first_name, gender, birth_date, birth_place,
                                  key_norm, parent_norm, created_at)
             VALUES (?1, 'ing', 'IT01', 'NDG', 'PNF', '12345678901', 'ACME', '', '', '', '', ?2, ?2, 'now')",
            params![submission_id, key],
        )
    }

    #[test]
    fn test_setup_database_is_idempotent() {
        let conn = open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        for kind in RecordKind::PROCESSING_ORDER {
            assert!(table_exists(&conn, kind.staging_table()), "{}", kind);
            assert!(table_exists(&conn, kind.production_table()), "{}", kind);
        }
        assert!(table_exists(&conn, "submissions"));
        assert!(table_exists(&conn, "error_causes"));
    }

    #[test]
    fn test_dependent_rows_require_link_parent() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, Some(2024)).unwrap();

        let err = insert_subject(&conn, &sub.id, "K1").unwrap_err();
        assert!(EtlError::from(err).is_referential_violation());

        insert_link(&conn, &sub.id, "K1", "R1");
        assert_eq!(insert_subject(&conn, &sub.id, "K1").unwrap(), 1);
    }

    #[test]
    fn test_submission_lifecycle() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, Some(2024)).unwrap();
        assert_eq!(sub.status, SubmissionStatus::Created);

        begin_validation(&conn, &sub.id).unwrap();
        assert_eq!(
            get_submission(&conn, &sub.id).unwrap().status,
            SubmissionStatus::DataValidation
        );

        // A second claim while running is refused
        match begin_validation(&conn, &sub.id) {
            Err(EtlError::InvalidState { from, to, .. }) => {
                assert_eq!(from, "DATA_VALIDATION");
                assert_eq!(to, "DATA_VALIDATION");
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }

        complete_validation(&conn, &sub.id).unwrap();
        begin_validation(&conn, &sub.id).unwrap();
        fail_submission(&conn, &sub.id, "boom").unwrap();

        let failed = get_submission(&conn, &sub.id).unwrap();
        assert_eq!(failed.status, SubmissionStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unknown_submission() {
        let conn = open_in_memory().unwrap();
        assert!(matches!(
            get_submission(&conn, "nope"),
            Err(EtlError::SubmissionNotFound(_))
        ));
        assert!(matches!(
            begin_validation(&conn, "nope"),
            Err(EtlError::SubmissionNotFound(_))
        ));
    }

    #[test]
    fn test_truncate_message_counts_chars() {
        let long = "è".repeat(MAX_ERROR_MESSAGE_CHARS + 10);
        let cut = truncate_message(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn test_ingestion_round_trip() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, None).unwrap();
        let id = create_ingestion(&conn, &sub.id, "SOGGETTI_2024.txt", RecordKind::Subject).unwrap();

        let counts = IngestionCounts {
            parsed: 3,
            staged: 2,
            validation_errors: 1,
            inserted: 1,
            duplicates: 1,
            missing_parent: 0,
        };
        complete_ingestion(&conn, &id, "abc123", &counts).unwrap();

        let ingestions = list_ingestions(&conn, &sub.id).unwrap();
        assert_eq!(ingestions.len(), 1);
        assert_eq!(ingestions[0].kind, RecordKind::Subject);
        assert_eq!(ingestions[0].status, IngestionStatus::Processed);
        assert_eq!(ingestions[0].counts, counts);
        assert_eq!(ingestions[0].sha256.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_purge_removes_only_that_submission() {
        let conn = open_in_memory().unwrap();
        let keep = create_submission(&conn, None).unwrap();
        let purged = create_submission(&conn, None).unwrap();

        for sub in [&keep, &purged] {
            insert_link(&conn, &sub.id, "K1", "R1");
            insert_subject(&conn, &sub.id, "K1").unwrap();
        }

        let deleted = purge_submission(
            &conn,
            &TimeoutConfig::default(),
            &RetryPolicy::default(),
            &purged.id,
        )
        .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(production_count(&conn, RecordKind::Link, &purged.id).unwrap(), 0);
        assert_eq!(production_count(&conn, RecordKind::Subject, &purged.id).unwrap(), 0);
        assert_eq!(production_count(&conn, RecordKind::Link, &keep.id).unwrap(), 1);
        assert_eq!(production_count(&conn, RecordKind::Subject, &keep.id).unwrap(), 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let conn = open_in_memory().unwrap();
        let sub = create_submission(&conn, None).unwrap();

        let result: Result<()> =
            run_in_transaction(&conn, &TimeoutConfig::default(), TxClass::BulkWrite, |tx| {
                tx.execute(
                    "INSERT INTO link (submission_id, ingestion_id, intermediary, relationship_key, ndg,
                                       role, role_start_date, role_end_date, key_norm, alt_key_norm, created_at)
                     VALUES (?1, 'ing', 'IT01', 'REL', 'NDG', '1', '20240101', '', 'K', 'R', 'now')",
                    params![sub.id],
                )?;
                Err(EtlError::Config("abort".to_string()))
            });

        assert!(result.is_err());
        assert_eq!(production_count(&conn, RecordKind::Link, &sub.id).unwrap(), 0);
    }
}
