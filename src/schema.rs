//! Row types for the columns the queue itself manages.
//!
//! Records are read through the caller's [`Scanner`](crate::Scanner); these
//! types cover the bookkeeping columns every queue table carries, for
//! inspection and tests.

use crate::errors::QueueError;
use crate::record::{ExecutionLogEntry, RecordState};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, Row};

/// The queue-managed columns of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    /// Unique identifier of the row
    pub id: i64,
    /// Current lifecycle state
    pub state: RecordState,
    /// Message recorded by the last error or failure
    pub failure_message: Option<String>,
    /// When the row was last claimed
    pub started_at: Option<DateTime<Utc>>,
    /// When the row reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// The row cannot be claimed before this time
    pub process_after: Option<DateTime<Utc>>,
    /// Times the row was recovered after stalling
    pub num_resets: i32,
    /// Times an attempt on the row errored
    pub num_failures: i32,
    /// When the row was inserted
    pub created_at: DateTime<Utc>,
    /// Log entries of every attempt, oldest first
    pub execution_logs: Vec<ExecutionLogEntry>,
}

impl<'r> FromRow<'r, PgRow> for QueueRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<RecordState>()
            .map_err(|e: QueueError| sqlx::Error::ColumnDecode {
                index: "state".into(),
                source: Box::new(e),
            })?;
        let execution_logs: Option<Vec<Json<ExecutionLogEntry>>> = row.try_get("execution_logs")?;

        Ok(Self {
            id: row.try_get("id")?,
            state,
            failure_message: row.try_get("failure_message")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            process_after: row.try_get("process_after")?,
            num_resets: row.try_get("num_resets")?,
            num_failures: row.try_get("num_failures")?,
            created_at: row.try_get("created_at")?,
            execution_logs: execution_logs
                .unwrap_or_default()
                .into_iter()
                .map(|Json(entry)| entry)
                .collect(),
        })
    }
}
