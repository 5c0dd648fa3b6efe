use crate::errors::QueueError;
use crate::expr::Expr;
use crate::lease::Lease;
use crate::options::Options;
use crate::record::{ExecutionLogEntry, Record, RecordState};
use crate::schema::QueueRow;
use crate::storage;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// A work queue over one table (and optionally a view of it).
///
/// Cloning a store is cheap; clones share the connection pool and options.
pub struct Store<R> {
    pool: PgPool,
    options: Arc<Options<R>>,
}

impl<R> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
        }
    }
}

impl<R> std::fmt::Debug for Store<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<R: Record> Store<R> {
    /// Create a store, rejecting options that cannot work.
    pub fn new(pool: PgPool, options: Options<R>) -> Result<Self, QueueError> {
        options.validate()?;
        Ok(Self {
            pool,
            options: Arc::new(options),
        })
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub(crate) fn options(&self) -> &Options<R> {
        &self.options
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.options.clock.now()
    }

    /// Claim the next eligible record.
    ///
    /// A record is eligible when it is `queued`, its `process_after` (if any)
    /// has passed, and every condition holds. Conditions and the ordering
    /// refer to the table through its alias. Rows locked by other workers are
    /// skipped rather than waited on.
    ///
    /// The move to `processing` is committed before this returns. The
    /// returned [`Lease`] keeps the row locked until it is finalized or
    /// dropped.
    #[instrument(name = "dbworker.dequeue", skip_all, fields(queue = %self.options.name))]
    pub async fn dequeue(&self, conditions: &[Expr]) -> Result<Option<(R, Lease<R>)>, QueueError> {
        let now = self.now();

        let Some(id) = storage::claim_next(&self.pool, &self.options, conditions, now).await? else {
            return Ok(None);
        };
        debug!(record.id = id, "Claimed record");

        let mut tx = self.pool.begin().await?;
        if !storage::lock_claimed(&mut tx, &self.options, id).await? {
            // Reset, or reset and claimed again, between the claim and the lock.
            debug!(record.id = id, "Claimed record is no longer ours to lock");
            tx.rollback().await?;
            return Ok(None);
        }

        let row = storage::select_record(&mut *tx, &self.options, id).await?;
        let Some(record) = self.options.scan.scan_first(row)? else {
            // Filtered out by the view. Leave the row to the stall sweep.
            debug!(record.id = id, "Claimed record is not visible through the read relation");
            tx.rollback().await?;
            return Ok(None);
        };

        Ok(Some((record, Lease::new(self.clone(), tx, id))))
    }

    /// Mark a `processing` record as completed.
    ///
    /// Prefer [`Lease::mark_complete`]. This variant does not touch rows held
    /// by a live lease; `false` means the record was not found, not
    /// `processing`, or leased by someone else.
    #[instrument(
        name = "dbworker.mark_complete",
        skip_all,
        fields(queue = %self.options.name, record.id = id),
    )]
    pub async fn mark_complete(&self, id: i64) -> Result<bool, QueueError> {
        let mut conn = self.pool.acquire().await?;
        let updated = storage::mark_complete(&mut conn, &self.options, id, self.now()).await?;
        debug!(updated, "Marked record complete");
        Ok(updated)
    }

    /// Record a failed attempt on a `processing` record.
    ///
    /// Returns the state the record moved to: `queued` with a backoff delay
    /// while retries remain, `failed` once they are spent. `None` means the
    /// record was not found, not `processing`, or leased by someone else.
    #[instrument(
        name = "dbworker.mark_errored",
        skip_all,
        fields(queue = %self.options.name, record.id = id),
    )]
    pub async fn mark_errored(
        &self,
        id: i64,
        message: &str,
    ) -> Result<Option<RecordState>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let state = storage::mark_errored(&mut tx, &self.options, id, message, self.now()).await?;
        tx.commit().await?;
        debug!(?state, "Marked record errored");
        Ok(state)
    }

    /// Fail a `processing` record without further retries.
    #[instrument(
        name = "dbworker.mark_failed",
        skip_all,
        fields(queue = %self.options.name, record.id = id),
    )]
    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<bool, QueueError> {
        let mut conn = self.pool.acquire().await?;
        let updated =
            storage::mark_failed(&mut conn, &self.options, id, message, self.now()).await?;
        debug!(updated, "Marked record failed");
        Ok(updated)
    }

    /// Put a record back in the queue, optionally not before `after`.
    ///
    /// Works on `queued`, `errored` and unleased `processing` records, and
    /// leaves the retry and reset counters alone. Requeueing an already
    /// queued record only updates its `process_after`.
    #[instrument(
        name = "dbworker.requeue",
        skip_all,
        fields(queue = %self.options.name, record.id = id),
    )]
    pub async fn requeue(&self, id: i64, after: Option<DateTime<Utc>>) -> Result<bool, QueueError> {
        let now = self.now();
        let after = after.filter(|after| *after > now);
        let mut conn = self.pool.acquire().await?;
        let updated = storage::requeue(&mut conn, &self.options, id, after).await?;
        debug!(updated, "Requeued record");
        Ok(updated)
    }

    /// Force a record back to `queued`, eligible right away, without counting
    /// a failure.
    ///
    /// Unlike [`requeue`](Self::requeue) this always clears `process_after`.
    /// Retry and reset counters are kept, and `completed` or `failed`
    /// records are left alone.
    #[instrument(
        name = "dbworker.reset_queued",
        skip_all,
        fields(queue = %self.options.name, record.id = id),
    )]
    pub async fn reset_queued(&self, id: i64) -> Result<bool, QueueError> {
        let mut conn = self.pool.acquire().await?;
        let updated = storage::reset_queued(&mut conn, &self.options, id).await?;
        debug!(updated, "Reset record to queued");
        Ok(updated)
    }

    /// Append an entry to the execution log of a `processing` record that is
    /// not leased by someone else.
    #[instrument(
        name = "dbworker.add_execution_log_entry",
        skip_all,
        fields(queue = %self.options.name, record.id = id),
    )]
    pub async fn add_execution_log_entry(
        &self,
        id: i64,
        entry: &ExecutionLogEntry,
    ) -> Result<bool, QueueError> {
        let entry = serde_json::to_value(entry)?;
        let mut conn = self.pool.acquire().await?;
        Ok(storage::add_execution_log_entry(&mut conn, &self.options, id, entry).await?)
    }

    /// Recover records abandoned in `processing`.
    ///
    /// Any record that has been `processing` for longer than the stalled max
    /// age and is not held by a live lease has its reset counter bumped. It
    /// goes back to the queue, or fails once the reset budget is spent.
    /// Returns the ids of the reset and the failed records.
    ///
    /// Safe to run concurrently from several processes.
    #[instrument(name = "dbworker.reset_stalled", skip_all, fields(queue = %self.options.name))]
    pub async fn reset_stalled(&self) -> Result<(Vec<i64>, Vec<i64>), QueueError> {
        let now = self.now();
        let max_age = TimeDelta::from_std(self.options.policy.stalled_max_age)
            .unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let rows = storage::reset_stalled(&self.pool, &self.options, cutoff, now).await?;

        let mut reset_ids = Vec::new();
        let mut failed_ids = Vec::new();
        for (id, state) in rows {
            match state.parse::<RecordState>()? {
                RecordState::Failed => failed_ids.push(id),
                _ => reset_ids.push(id),
            }
        }
        reset_ids.sort_unstable();
        failed_ids.sort_unstable();

        if !reset_ids.is_empty() || !failed_ids.is_empty() {
            info!(?reset_ids, ?failed_ids, "Reset stalled records");
        }
        Ok((reset_ids, failed_ids))
    }

    /// The number of records [`dequeue`](Self::dequeue) could currently
    /// return under the same conditions. Locks nothing.
    #[instrument(name = "dbworker.queued_count", skip_all, fields(queue = %self.options.name))]
    pub async fn queued_count(&self, conditions: &[Expr]) -> Result<i64, QueueError> {
        Ok(storage::queued_count(&self.pool, &self.options, conditions, self.now()).await?)
    }

    /// How long the longest-waiting eligible record has been eligible.
    #[instrument(
        name = "dbworker.max_duration_in_queue",
        skip_all,
        fields(queue = %self.options.name),
    )]
    pub async fn max_duration_in_queue(&self) -> Result<Option<Duration>, QueueError> {
        let now = self.now();
        let oldest = storage::oldest_eligible(&self.pool, &self.options, now).await?;
        Ok(oldest.map(|oldest| (now - oldest).to_std().unwrap_or(Duration::ZERO)))
    }

    /// Read the queue bookkeeping columns of a record.
    pub async fn fetch_row(&self, id: i64) -> Result<Option<QueueRow>, QueueError> {
        Ok(storage::fetch_row(&self.pool, &self.options, id).await?)
    }
}
