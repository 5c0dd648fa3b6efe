use crate::errors::QueueError;
use crate::record::{ExecutionLogEntry, Record, RecordState};
use crate::storage;
use crate::store::Store;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::debug;

/// Exclusive ownership of a claimed record.
///
/// A lease holds a transaction with a row lock on its record. While it lives,
/// no other worker can claim, finalize, or sweep the record. Every finalizing
/// method consumes the lease, so a record is released exactly once.
///
/// Dropping a lease without finalizing it rolls the transaction back and
/// leaves the record `processing`; the stall sweep
/// ([`Store::reset_stalled`]) recovers it once it is old enough. This is
/// also what happens when the worker process dies.
#[must_use = "a lease should be finalized with one of its `mark_*` methods"]
pub struct Lease<R> {
    store: Store<R>,
    tx: Transaction<'static, Postgres>,
    id: i64,
}

impl<R> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<R: Record> Lease<R> {
    pub(crate) fn new(store: Store<R>, tx: Transaction<'static, Postgres>, id: i64) -> Self {
        Self { store, tx, id }
    }

    /// The id of the leased record.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Append an entry to the record's execution log.
    ///
    /// The entry is written in the lease's transaction and becomes visible
    /// when the lease is finalized. Entries written before the lease is
    /// dropped or [released](Self::release) are lost with it.
    pub async fn add_execution_log_entry(
        &mut self,
        entry: &ExecutionLogEntry,
    ) -> Result<bool, QueueError> {
        let entry = serde_json::to_value(entry)?;
        let options = self.store.options();
        Ok(storage::add_execution_log_entry(&mut self.tx, options, self.id, entry).await?)
    }

    /// Mark the record as completed.
    pub async fn mark_complete(self) -> Result<bool, QueueError> {
        let Self { store, mut tx, id } = self;
        let updated = storage::mark_complete(&mut tx, store.options(), id, store.now()).await?;
        tx.commit().await?;
        debug!(queue = store.name(), record.id = id, updated, "Marked record complete");
        Ok(updated)
    }

    /// Record a failed attempt.
    ///
    /// The record is queued again after a backoff delay while retries remain,
    /// and fails once they are spent. Returns the resulting state.
    pub async fn mark_errored(self, message: &str) -> Result<Option<RecordState>, QueueError> {
        let Self { store, mut tx, id } = self;
        let state =
            storage::mark_errored(&mut tx, store.options(), id, message, store.now()).await?;
        tx.commit().await?;
        debug!(queue = store.name(), record.id = id, ?state, "Marked record errored");
        Ok(state)
    }

    /// Fail the record without further retries.
    pub async fn mark_failed(self, message: &str) -> Result<bool, QueueError> {
        let Self { store, mut tx, id } = self;
        let updated =
            storage::mark_failed(&mut tx, store.options(), id, message, store.now()).await?;
        tx.commit().await?;
        debug!(queue = store.name(), record.id = id, updated, "Marked record failed");
        Ok(updated)
    }

    /// Put the record back in the queue without counting an error, optionally
    /// not before `after`.
    pub async fn requeue(self, after: Option<DateTime<Utc>>) -> Result<bool, QueueError> {
        let Self { store, mut tx, id } = self;
        let now = store.now();
        let after = after.filter(|after| *after > now);
        let updated = storage::requeue(&mut tx, store.options(), id, after).await?;
        tx.commit().await?;
        debug!(queue = store.name(), record.id = id, updated, "Requeued record");
        Ok(updated)
    }

    /// Give up the lease without finalizing the record.
    ///
    /// The record stays `processing` until the stall sweep picks it up.
    pub async fn release(self) -> Result<(), QueueError> {
        let Self { store, tx, id } = self;
        tx.rollback().await?;
        debug!(queue = store.name(), record.id = id, "Released lease");
        Ok(())
    }
}
