use crate::errors::QueueError;
use crate::record::Record;
use crate::store::Store;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, error, info_span, trace};

const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically recovers stalled records.
///
/// The interval should be shorter than the queue's stalled max age. Running
/// several resetters against the same table is safe.
#[derive(Debug)]
pub struct Resetter<R> {
    store: Store<R>,
    interval: Duration,
}

impl<R: Record> Resetter<R> {
    /// Create a resetter for the given store.
    pub fn new(store: Store<R>) -> Self {
        Self {
            store,
            interval: DEFAULT_RESET_INTERVAL,
        }
    }

    /// Set how often to sweep.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep once, returning the ids of the reset and the failed records.
    pub async fn run_once(&self) -> Result<(Vec<i64>, Vec<i64>), QueueError> {
        self.store.reset_stalled().await
    }

    /// Sweep forever.
    pub async fn run(&self) {
        let span = info_span!("resetter", queue = self.store.name());
        async {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("Looking for stalled records…");
                if let Err(error) = self.run_once().await {
                    error!("Failed to reset stalled records: {error}");
                }
            }
        }
        .instrument(span)
        .await
    }
}
