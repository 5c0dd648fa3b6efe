use crate::errors::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A unit of work that can be stored in a queue table.
///
/// The queue only needs to know how to identify a record. Everything else
/// about its shape is decided by the [`Scanner`](crate::Scanner) configured
/// for the queue.
pub trait Record: Send + Sync + 'static {
    /// The stable identifier of the row backing this record.
    fn record_id(&self) -> i64;
}

/// The lifecycle state of a queued row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed an attempt and is waiting to be retried.
    Errored,
    /// Failed for good.
    Failed,
}

impl RecordState {
    /// The value stored in the `state` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }

    /// Whether no queue operation will move a row out of this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidState(other.to_string())),
        }
    }
}

/// One entry of the append-only `execution_logs` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Identifies the step that produced the entry.
    pub key: String,
    /// The command that was run, if any.
    #[serde(default)]
    pub command: Vec<String>,
    /// When the step started.
    pub start_time: DateTime<Utc>,
    /// The exit code of the command, if it ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Free-form output.
    #[serde(default)]
    pub out: String,
    /// How long the step took.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl ExecutionLogEntry {
    /// Create an entry with only a key, start time and output.
    pub fn new(key: impl Into<String>, start_time: DateTime<Utc>, out: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            command: Vec::new(),
            start_time,
            exit_code: None,
            out: out.into(),
            duration_ms: None,
        }
    }

    /// Set the command that produced this entry.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the exit code.
    pub fn exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    /// Set the duration.
    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
