// Staging Processor
// Valid records land in a per-kind staging table first. Deduplication,
// parent checks and the move to production then run as a handful of
// whole-table statements scoped by submission, never row by row.

use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::db::{norm_columns, run_in_transaction, TxClass};
use crate::entities::{RecordKind, TypedRecord};
use crate::error::{EtlError, Result};
use crate::retry::RetryPolicy;

// ============================================================================
// ROW STATUS & STEPS
// ============================================================================

/// Outcome marker of a staged row; pending rows carry NULL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    Inserted = 1,
    Duplicate = 2,
    MissingParent = 3,
}

impl RowStatus {
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn from_code(code: i64) -> Option<RowStatus> {
        match code {
            1 => Some(RowStatus::Inserted),
            2 => Some(RowStatus::Duplicate),
            3 => Some(RowStatus::MissingParent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingStep {
    /// Pending rows whose key is already in production
    ExistingDuplicates,
    /// Pending rows repeating a key of an earlier (lower id) pending row
    BatchDuplicates,
    /// Pending dependent rows without a Link parent in production
    MissingParent,
    /// Copy survivors to production and mark them inserted
    Finalize,
}

impl StagingStep {
    /// Missing-parent marking must precede the insert, or the store rejects it
    pub const ORDERED: [StagingStep; 4] = [
        StagingStep::ExistingDuplicates,
        StagingStep::BatchDuplicates,
        StagingStep::MissingParent,
        StagingStep::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StagingStep::ExistingDuplicates => "mark existing duplicates",
            StagingStep::BatchDuplicates => "mark batch duplicates",
            StagingStep::MissingParent => "mark missing parents",
            StagingStep::Finalize => "finalize",
        }
    }
}

/// Per-kind counts of staged rows after processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub inserted: u64,
    pub duplicates: u64,
    pub missing_parent: u64,
    /// Rows no step has decided on yet (zero after a full run)
    pub pending: u64,
}

impl ProcessOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.duplicates + self.missing_parent + self.pending
    }
}

// ============================================================================
// BULK LOAD
// ============================================================================

/// Insert one chunk of valid records into the staging table of `kind`.
///
/// Runs on the caller's transaction; every value is a bound parameter.
pub fn stage_chunk(
    conn: &Connection,
    kind: RecordKind,
    ingestion_id: &str,
    submission_id: &str,
    records: &[TypedRecord],
) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let mut columns = vec!["ingestion_id", "submission_id", "line_number", "raw_line"];
    columns.extend_from_slice(kind.columns());
    columns.extend(norm_columns(kind));

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        kind.staging_table(),
        columns.join(", "),
        placeholders
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut staged = 0;

    for record in records {
        let line_number = record.line_number as i64;
        let values = record.values();
        let keys = record.keys();

        let mut row: Vec<&dyn ToSql> = Vec::with_capacity(columns.len());
        row.push(&ingestion_id);
        row.push(&submission_id);
        row.push(&line_number);
        row.push(&record.raw_line);
        for value in &values {
            row.push(value);
        }
        row.push(&keys.key);
        if kind.has_alt_key() {
            row.push(&keys.alt_key);
        }
        if kind.parent().is_some() {
            row.push(&keys.parent);
        }

        staged += stmt.execute(row.as_slice())?;
    }

    Ok(staged)
}

// ============================================================================
// SET-BASED STEPS (SQL)
// ============================================================================

/// `a || '/' || b` over the given columns, for messages
fn display_expr(columns: &[&str]) -> String {
    columns.join(" || '/' || ")
}

fn existing_duplicates_sql(kind: RecordKind) -> String {
    let stg = kind.staging_table();
    let prod = kind.production_table();
    let matches = if kind.has_alt_key() {
        format!("(p.key_norm = {stg}.key_norm OR p.alt_key_norm = {stg}.alt_key_norm)")
    } else {
        format!("p.key_norm = {stg}.key_norm")
    };

    format!(
        "UPDATE {stg}
         SET process_status = {status}, error_message = 'already exists: ' || {display}
         WHERE submission_id = ?1 AND process_status IS NULL
           AND EXISTS (SELECT 1 FROM {prod} p
                       WHERE p.submission_id = {stg}.submission_id AND {matches})",
        status = RowStatus::Duplicate.code(),
        display = display_expr(kind.key_columns()),
    )
}

fn batch_duplicates_sql(kind: RecordKind) -> String {
    let stg = kind.staging_table();
    let survivors = |column: &str| {
        format!(
            "id NOT IN (SELECT MIN(id) FROM {stg}
                        WHERE submission_id = ?1 AND process_status IS NULL
                        GROUP BY {column})"
        )
    };
    let condition = if kind.has_alt_key() {
        format!("({} OR {})", survivors("key_norm"), survivors("alt_key_norm"))
    } else {
        survivors("key_norm")
    };

    format!(
        "UPDATE {stg}
         SET process_status = {status}, error_message = 'duplicate within submission: ' || {display}
         WHERE submission_id = ?1 AND process_status IS NULL AND {condition}",
        status = RowStatus::Duplicate.code(),
        display = display_expr(kind.key_columns()),
    )
}

fn missing_parent_sql(kind: RecordKind) -> Option<String> {
    let parent = kind.parent()?;
    let stg = kind.staging_table();

    Some(format!(
        "UPDATE {stg}
         SET process_status = {status}, error_message = 'missing Link parent: ' || {display}
         WHERE submission_id = ?1 AND process_status IS NULL
           AND NOT EXISTS (SELECT 1 FROM {link} l
                           WHERE l.submission_id = {stg}.submission_id
                             AND l.{column} = {stg}.parent_norm)",
        status = RowStatus::MissingParent.code(),
        display = display_expr(kind.parent_columns()),
        link = RecordKind::Link.production_table(),
        column = parent.link_column(),
    ))
}

fn finalize_insert_sql(kind: RecordKind) -> String {
    let mut columns = vec!["submission_id", "ingestion_id"];
    columns.extend_from_slice(kind.columns());
    columns.extend(norm_columns(kind));
    let columns = columns.join(", ");

    format!(
        "INSERT INTO {prod} ({columns}, created_at)
         SELECT {columns}, ?2 FROM {stg}
         WHERE submission_id = ?1 AND process_status IS NULL
         ORDER BY id",
        prod = kind.production_table(),
        stg = kind.staging_table(),
    )
}

fn finalize_mark_sql(kind: RecordKind) -> String {
    format!(
        "UPDATE {} SET process_status = {} WHERE submission_id = ?1 AND process_status IS NULL",
        kind.staging_table(),
        RowStatus::Inserted.code()
    )
}

// ============================================================================
// CONSTRAINT SUSPENSION
// ============================================================================

/// Defers foreign-key checks on the given tables to the end of the
/// enclosing transaction.
///
/// `release` verifies the guarded tables and only then restores immediate
/// checking. Dropped without `release`, the flag stays on until COMMIT or
/// ROLLBACK resets it, and COMMIT still fails on any pending violation.
/// Switching the flag off early would discard those pending violations.
pub struct DeferredConstraints<'c> {
    conn: &'c Connection,
    tables: Vec<&'static str>,
}

impl<'c> DeferredConstraints<'c> {
    pub fn new(conn: &'c Connection, tables: &[&'static str]) -> Result<Self> {
        conn.pragma_update(None, "defer_foreign_keys", true)?;
        Ok(DeferredConstraints {
            conn,
            tables: tables.to_vec(),
        })
    }

    /// Fail on the first guarded table holding orphan rows, else switch
    /// back to immediate checks.
    pub fn release(self) -> Result<()> {
        for table in &self.tables {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA foreign_key_check({})", table))?;
            let parents = stmt
                .query_map([], |row| row.get::<_, String>(2))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if let Some(parent) = parents.first() {
                warn!(table = *table, rows = parents.len(), "Orphan rows under deferred constraints");
                return Err(EtlError::ReferentialViolation {
                    table: table.to_string(),
                    parent: parent.clone(),
                    rows: parents.len(),
                });
            }
        }

        self.conn.pragma_update(None, "defer_foreign_keys", false)?;
        Ok(())
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

pub struct StagingProcessor<'a> {
    conn: &'a Connection,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
}

impl<'a> StagingProcessor<'a> {
    pub fn new(conn: &'a Connection, timeouts: TimeoutConfig, retry: RetryPolicy) -> Self {
        StagingProcessor {
            conn,
            timeouts,
            retry,
        }
    }

    /// Run the four steps in order and report the resulting counts
    pub fn process(&self, kind: RecordKind, submission_id: &str) -> Result<ProcessOutcome> {
        self.run_steps(kind, submission_id, &StagingStep::ORDERED)?;
        let outcome = self.outcome(kind, submission_id)?;

        info!(
            submission_id,
            kind = %kind,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            missing_parent = outcome.missing_parent,
            "Staging processed"
        );
        Ok(outcome)
    }

    /// Run the given steps, each in its own bounded, retried transaction
    pub fn run_steps(
        &self,
        kind: RecordKind,
        submission_id: &str,
        steps: &[StagingStep],
    ) -> Result<()> {
        for step in steps {
            let rows = self.retry.execute(step.name(), || {
                run_in_transaction(self.conn, &self.timeouts, TxClass::HeavyAggregate, |tx| {
                    execute_step(tx, kind, submission_id, *step)
                })
            })?;
            debug!(submission_id, kind = %kind, step = step.name(), rows, "Staging step done");
        }
        Ok(())
    }

    /// Current per-status counts of the staged rows
    pub fn outcome(&self, kind: RecordKind, submission_id: &str) -> Result<ProcessOutcome> {
        run_in_transaction(self.conn, &self.timeouts, TxClass::ReadOnly, |tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT process_status, COUNT(*) FROM {} WHERE submission_id = ?1
                 GROUP BY process_status",
                kind.staging_table()
            ))?;
            let rows = stmt.query_map(params![submission_id], |row| {
                Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut outcome = ProcessOutcome::default();
            for row in rows {
                let (status, count) = row?;
                let count = count as u64;
                match status.and_then(RowStatus::from_code) {
                    Some(RowStatus::Inserted) => outcome.inserted += count,
                    Some(RowStatus::Duplicate) => outcome.duplicates += count,
                    Some(RowStatus::MissingParent) => outcome.missing_parent += count,
                    None => outcome.pending += count,
                }
            }
            Ok(outcome)
        })
    }

    /// Drop the submission's staging rows of `kind`
    pub fn clear(&self, kind: RecordKind, submission_id: &str) -> Result<usize> {
        let deleted = self.retry.execute("clear staging", || {
            run_in_transaction(self.conn, &self.timeouts, TxClass::BulkWrite, |tx| {
                Ok(tx.execute(
                    &format!("DELETE FROM {} WHERE submission_id = ?1", kind.staging_table()),
                    params![submission_id],
                )?)
            })
        })?;
        debug!(submission_id, kind = %kind, deleted, "Staging cleared");
        Ok(deleted)
    }
}

fn execute_step(
    conn: &Connection,
    kind: RecordKind,
    submission_id: &str,
    step: StagingStep,
) -> Result<usize> {
    match step {
        StagingStep::ExistingDuplicates => Ok(conn.execute(
            &existing_duplicates_sql(kind),
            params![submission_id],
        )?),
        StagingStep::BatchDuplicates => {
            Ok(conn.execute(&batch_duplicates_sql(kind), params![submission_id])?)
        }
        StagingStep::MissingParent => match missing_parent_sql(kind) {
            Some(sql) => Ok(conn.execute(&sql, params![submission_id])?),
            None => Ok(0),
        },
        StagingStep::Finalize => {
            let now = Utc::now().to_rfc3339();
            let deferred = if kind == RecordKind::Link {
                Some(DeferredConstraints::new(conn, &[kind.production_table()])?)
            } else {
                None
            };
            let inserted = conn.execute(&finalize_insert_sql(kind), params![submission_id, now])?;
            conn.execute(&finalize_mark_sql(kind), params![submission_id])?;
            if let Some(deferred) = deferred {
                deferred.release()?;
            }
            Ok(inserted)
        }
    }
}
