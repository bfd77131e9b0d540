// Error/Duplicate Reporter
// Rejected lines become error records (raw text + ingestion + submission)
// with one or more structured causes. Two sources feed it: lines refused by
// the parser/validator, and staged rows the Staging Processor flagged.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::entities::RecordKind;
use crate::error::Result;
use crate::staging::RowStatus;
use crate::validation::{ErrorCause, ErrorCode};

/// Origin tag of error records produced while reading the file
pub const ORIGIN_LINE: &str = "LINE";

/// A line that failed parsing or validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRow {
    pub line_number: u64,
    pub raw_line: String,
    pub causes: Vec<ErrorCause>,
}

/// One cause of one rejected line, as shown to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub line_number: u64,
    pub raw_line: String,
    pub error_code: String,
    pub message: String,
}

// ============================================================================
// WRITE SIDE
// ============================================================================

/// Persist line-level errors on the caller's transaction.
///
/// Keyed by (ingestion, line): a line already recorded is skipped together
/// with its causes. Returns the number of error records created.
pub fn record_line_errors(
    conn: &Connection,
    ingestion_id: &str,
    submission_id: &str,
    rows: &[ErrorRow],
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let now = Utc::now().to_rfc3339();
    let mut record_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO error_records
             (ingestion_id, submission_id, line_number, raw_line, origin, origin_row_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?3, ?6)",
    )?;
    let mut cause_stmt = conn.prepare_cached(
        "INSERT INTO error_causes (error_record_id, error_code, message) VALUES (?1, ?2, ?3)",
    )?;

    let mut created = 0;
    for row in rows {
        let inserted = record_stmt.execute(params![
            ingestion_id,
            submission_id,
            row.line_number as i64,
            row.raw_line,
            ORIGIN_LINE,
            now,
        ])?;
        if inserted == 0 {
            continue;
        }

        let record_id = conn.last_insert_rowid();
        for cause in &row.causes {
            cause_stmt.execute(params![record_id, cause.code.code(), cause.message])?;
        }
        created += 1;
    }

    Ok(created)
}

/// Materialize duplicate and missing-parent staging rows as error records.
///
/// Set-based, on the caller's transaction. Must run after finalize and
/// before the staging rows are cleared; running it twice creates nothing new.
pub fn report_staging_errors(
    conn: &Connection,
    kind: RecordKind,
    submission_id: &str,
) -> Result<usize> {
    let stg = kind.staging_table();
    let duplicate = RowStatus::Duplicate.code();
    let missing = RowStatus::MissingParent.code();

    let created = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO error_records
                 (ingestion_id, submission_id, line_number, raw_line, origin, origin_row_id, created_at)
             SELECT ingestion_id, submission_id, line_number, raw_line, ?2, id, ?3
             FROM {stg}
             WHERE submission_id = ?1 AND process_status IN ({duplicate}, {missing})
             ORDER BY id"
        ),
        params![submission_id, stg, Utc::now().to_rfc3339()],
    )?;

    conn.execute(
        &format!(
            "INSERT INTO error_causes (error_record_id, error_code, message)
             SELECT e.id,
                    CASE s.process_status WHEN {duplicate} THEN ?3 ELSE ?4 END,
                    COALESCE(s.error_message, '')
             FROM {stg} s
             JOIN error_records e
               ON e.ingestion_id = s.ingestion_id AND e.origin = ?2 AND e.origin_row_id = s.id
             WHERE s.submission_id = ?1 AND s.process_status IN ({duplicate}, {missing})
               AND NOT EXISTS (SELECT 1 FROM error_causes c WHERE c.error_record_id = e.id)
             ORDER BY s.id"
        ),
        params![
            submission_id,
            stg,
            ErrorCode::AlreadyExists.code(),
            ErrorCode::MissingParent.code(),
        ],
    )?;

    Ok(created)
}

// ============================================================================
// READ SIDE
// ============================================================================

/// Error causes of a submission (optionally one ingestion), by line
pub fn error_details(
    conn: &Connection,
    submission_id: &str,
    ingestion_id: Option<&str>,
) -> Result<Vec<ErrorDetail>> {
    let mut stmt = conn.prepare(
        "SELECT e.line_number, e.raw_line, c.error_code, c.message
         FROM error_records e
         JOIN error_causes c ON c.error_record_id = e.id
         WHERE e.submission_id = ?1 AND (?2 IS NULL OR e.ingestion_id = ?2)
         ORDER BY e.ingestion_id, e.line_number, e.id, c.id",
    )?;

    let details = stmt
        .query_map(params![submission_id, ingestion_id], |row| {
            Ok(ErrorDetail {
                line_number: row.get::<_, i64>(0)? as u64,
                raw_line: row.get(1)?,
                error_code: row.get(2)?,
                message: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(details)
}

/// Number of causes per error code for a submission
pub fn error_count_by_code(conn: &Connection, submission_id: &str) -> Result<Vec<(ErrorCode, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT c.error_code, COUNT(*)
         FROM error_records e
         JOIN error_causes c ON c.error_record_id = e.id
         WHERE e.submission_id = ?1
         GROUP BY c.error_code
         ORDER BY c.error_code",
    )?;

    let rows = stmt
        .query_map(params![submission_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(code, count)| ErrorCode::from_code(&code).map(|c| (c, count as u64)))
        .collect())
}

/// Error records (rejected lines) of one ingestion
pub fn error_record_count(conn: &Connection, ingestion_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM error_records WHERE ingestion_id = ?1",
        params![ingestion_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
