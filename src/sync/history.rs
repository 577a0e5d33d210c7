//! Sync History Module - persisted log of synchronization runs
//!
//! One row per synchronizer run: what was touched, how the run ended and
//! when. Used to show the last successful sync per resource type and to
//! audit failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::models::{Direction, SyncReport};
use super::synchronizer::SyncError;
use crate::db::{Database, DbError};

// ============================================================================
// Types & Structures
// ============================================================================

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Canceled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Failed => "failed",
            RunOutcome::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "completed" => Ok(RunOutcome::Completed),
            "failed" => Ok(RunOutcome::Failed),
            "canceled" => Ok(RunOutcome::Canceled),
            _ => Err(format!("Invalid outcome: {}", s)),
        }
    }
}

/// A single history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub resource_type: String,
    pub direction: Direction,
    pub outcome: RunOutcome,
    pub added: i64,
    pub updated: i64,
    pub removed: i64,
    pub sent: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncRunRecord {
    /// Build the entry of a run that just finished
    pub fn from_result(
        resource_type: &str,
        direction: Direction,
        started_at: DateTime<Utc>,
        result: &Result<SyncReport, SyncError>,
    ) -> Self {
        let mut record = Self {
            id: None,
            run_id: uuid::Uuid::new_v4().to_string(),
            resource_type: resource_type.to_string(),
            direction,
            outcome: RunOutcome::Completed,
            added: 0,
            updated: 0,
            removed: 0,
            sent: 0,
            error_message: None,
            started_at,
            finished_at: Utc::now(),
        };

        match result {
            Ok(SyncReport::Fetch(ops)) => {
                record.added = ops.add.len() as i64;
                record.updated = ops.update.len() as i64;
                record.removed = ops.remove.len() as i64;
            }
            Ok(SyncReport::Send(ops)) => {
                record.sent = ops.send.len() as i64;
                record.removed = ops.remove.len() as i64;
            }
            Err(e) if e.is_canceled() => record.outcome = RunOutcome::Canceled,
            Err(e) => {
                record.outcome = RunOutcome::Failed;
                record.error_message = Some(e.to_string());
            }
        }

        record
    }
}

/// History statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_runs: i64,
    pub failed_runs: i64,
    pub last_run: Option<DateTime<Utc>>,
}

// ============================================================================
// History Manager
// ============================================================================

const RUN_COLUMNS: &str = "id, run_id, resource_type, direction, outcome, added, updated, removed, sent,
                           error_message, started_at, finished_at";

/// Reads and writes the `sync_history` table
#[derive(Clone)]
pub struct HistoryManager {
    db: Arc<Database>,
}

impl HistoryManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a finished run, returning its row id
    pub fn record(&self, run: &SyncRunRecord) -> Result<i64, HistoryError> {
        let id = self.db.execute_insert(
            "INSERT INTO sync_history (
                run_id, resource_type, direction, outcome, added, updated, removed, sent,
                error_message, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                run.run_id,
                run.resource_type,
                run.direction.as_str(),
                run.outcome.as_str(),
                run.added,
                run.updated,
                run.removed,
                run.sent,
                run.error_message,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
            ],
        )?;

        Ok(id)
    }

    /// Most recent runs of one resource type
    pub fn get_history(&self, resource_type: &str, limit: i64) -> Result<Vec<SyncRunRecord>, HistoryError> {
        Ok(self.db.query(
            &format!(
                "SELECT {} FROM sync_history WHERE resource_type = ?1 ORDER BY finished_at DESC, id DESC LIMIT ?2",
                RUN_COLUMNS
            ),
            rusqlite::params![resource_type, limit],
            read_run,
        )?)
    }

    /// Most recent runs of every type
    pub fn get_recent(&self, limit: i64) -> Result<Vec<SyncRunRecord>, HistoryError> {
        Ok(self.db.query(
            &format!("SELECT {} FROM sync_history ORDER BY finished_at DESC, id DESC LIMIT ?1", RUN_COLUMNS),
            rusqlite::params![limit],
            read_run,
        )?)
    }

    /// Last completed run of a resource type
    pub fn last_successful(&self, resource_type: &str) -> Result<Option<SyncRunRecord>, HistoryError> {
        let runs = self.db.query(
            &format!(
                "SELECT {} FROM sync_history WHERE resource_type = ?1 AND outcome = ?2
                 ORDER BY finished_at DESC, id DESC LIMIT 1",
                RUN_COLUMNS
            ),
            rusqlite::params![resource_type, RunOutcome::Completed.as_str()],
            read_run,
        )?;

        Ok(runs.into_iter().next())
    }

    /// Delete runs older than the given number of days
    pub fn enforce_retention_policy(&self, retention_days: i64) -> Result<usize, HistoryError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);

        let deleted = self.db.execute(
            "DELETE FROM sync_history WHERE finished_at < ?1",
            rusqlite::params![cutoff.to_rfc3339()],
        )?;

        if deleted > 0 {
            log::info!("Removed {} sync history entries older than {} days", deleted, retention_days);
        }

        Ok(deleted)
    }

    pub fn get_stats(&self) -> Result<HistoryStats, HistoryError> {
        Ok(self.db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END), 0),
                    MAX(finished_at)
             FROM sync_history",
            [],
            |row| {
                Ok(HistoryStats {
                    total_runs: row.get(0)?,
                    failed_runs: row.get(1)?,
                    last_run: row
                        .get::<_, Option<String>>(2)?
                        .and_then(|s| s.parse().ok()),
                })
            },
        )?)
    }
}

fn read_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRunRecord> {
    Ok(SyncRunRecord {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        resource_type: row.get(2)?,
        direction: parse_column(row, 3, Direction::from_str)?,
        outcome: parse_column(row, 4, RunOutcome::from_str)?,
        added: row.get(5)?,
        updated: row.get(6)?,
        removed: row.get(7)?,
        sent: row.get(8)?,
        error_message: row.get(9)?,
        started_at: parse_column(row, 10, parse_timestamp)?,
        finished_at: parse_column(row, 11, parse_timestamp)?,
    })
}

fn parse_column<T, F>(row: &rusqlite::Row<'_>, idx: usize, parse: F) -> rusqlite::Result<T>
where
    F: FnOnce(&str) -> Result<T, String>,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================
