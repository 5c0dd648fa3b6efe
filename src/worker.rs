use crate::errors::QueueError;
use crate::expr::Expr;
use crate::record::{ExecutionLogEntry, Record};
use crate::store::Store;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Processes records dequeued by a [`Worker`].
pub trait Handler<R: Record>: Send + Sync + 'static {
    /// Do the work for one record.
    ///
    /// Returning `Ok` completes the record. An error wrapping
    /// [`NonRetryable`] fails it for good; any other error, or a panic,
    /// counts against its retry budget.
    fn handle(
        &self,
        record: &R,
        logger: &mut ExecutionLogger,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// An error that should fail the record instead of retrying it.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NonRetryable(pub String);

/// Collects execution log entries while a handler runs.
///
/// The entries are appended to the record's `execution_logs` before the
/// record is finalized, whatever the outcome.
#[derive(Debug, Default)]
pub struct ExecutionLogger {
    entries: Vec<ExecutionLogEntry>,
}

impl ExecutionLogger {
    /// Record an entry.
    pub fn log(&mut self, entry: ExecutionLogEntry) {
        self.entries.push(entry);
    }

    /// The entries recorded so far.
    pub fn entries(&self) -> &[ExecutionLogEntry] {
        &self.entries
    }
}

/// A loop that dequeues records and hands them to a [`Handler`].
///
/// The worker never spawns anything; the caller decides where its
/// [`run`](Self::run) future executes and how many of them there are.
pub struct Worker<R, H> {
    store: Store<R>,
    handler: Arc<H>,
    conditions: Vec<Expr>,
    shutdown_when_queue_empty: bool,
    poll_interval: Duration,
    jitter: Duration,
}

impl<R, H> std::fmt::Debug for Worker<R, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("store", &self.store)
            .field("conditions", &self.conditions)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl<R: Record, H: Handler<R>> Worker<R, H> {
    /// Create a worker for the given store and handler.
    pub fn new(store: Store<R>, handler: H) -> Self {
        Self {
            store,
            handler: Arc::new(handler),
            conditions: Vec::new(),
            shutdown_when_queue_empty: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Only dequeue records matching these conditions.
    pub fn conditions(mut self, conditions: Vec<Expr>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Set how often the worker polls for new records.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling the same table. The actual jitter applied will be a
    /// random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop [`run`](Self::run) as soon as no record is eligible.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Process records forever, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub async fn run(&self) {
        loop {
            match self.run_next().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No eligible records found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No eligible records found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to process record: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Process the next eligible record, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(record_id))` if a record was processed
    /// - `Ok(None)` if no records were eligible
    /// - `Err(...)` if the queue could not be read or updated
    pub async fn run_next(&self) -> Result<Option<i64>, QueueError> {
        trace!("Looking for next record…");

        let Some((record, mut lease)) = self.store.dequeue(&self.conditions).await? else {
            return Ok(None);
        };

        let record_id = lease.id();
        let span = info_span!("record", queue = self.store.name(), record.id = record_id);

        let handler = self.handler.clone();
        let mut logger = ExecutionLogger::default();
        let (record, log) = (&record, &mut logger);

        let result = with_sentry_transaction(self.store.name(), move || async move {
            AssertUnwindSafe(handler.handle(record, log))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        })
        .instrument(span.clone())
        .bind_hub(Hub::current())
        .await;

        async move {
            for entry in &logger.entries {
                if !lease.add_execution_log_entry(entry).await? {
                    warn!(entry.key = %entry.key, "Failed to store execution log entry");
                }
            }

            match result {
                Ok(()) => {
                    debug!("Record handled successfully");
                    if !lease.mark_complete().await? {
                        warn!("Record was no longer processing and could not be completed");
                    }
                }
                Err(error) if error.downcast_ref::<NonRetryable>().is_some() => {
                    warn!("Record failed permanently: {error}");
                    if !lease.mark_failed(&format!("{error:#}")).await? {
                        warn!("Record was no longer processing and could not be failed");
                    }
                }
                Err(error) => {
                    warn!("Failed to handle record: {error}");
                    match lease.mark_errored(&format!("{error:#}")).await? {
                        Some(state) => debug!(%state, "Recorded failed attempt"),
                        None => warn!("Record was no longer processing and could not be retried"),
                    }
                }
            }
            Ok::<_, QueueError>(())
        }
        .instrument(span)
        .await?;

        Ok(Some(record_id))
    }
}
