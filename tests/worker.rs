#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

mod common;

use anyhow::anyhow;
use chrono::TimeDelta;
use claims::{assert_none, assert_some, assert_some_eq};
use common::{
    TestRecord, default_options, insert_processing, insert_queued, record_is_locked, t0,
};
use dbworker::{
    ExecutionLogEntry, ExecutionLogger, Expr, Handler, MockClock, NonRetryable, RecordState,
    Resetter, Store, Worker,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

#[derive(Clone, Default)]
struct RecordingHandler {
    seen: Arc<Mutex<Vec<i64>>>,
}

impl Handler<TestRecord> for RecordingHandler {
    async fn handle(
        &self,
        record: &TestRecord,
        _logger: &mut ExecutionLogger,
    ) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(record.id);
        Ok(())
    }
}

#[tokio::test]
async fn worker_processes_records_until_queue_is_empty() -> anyhow::Result<()> {
    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0() + TimeDelta::minutes(1));
    let store = Store::new(pool.clone(), default_options(&clock))?;

    insert_queued(&pool, 1, t0()).await?;
    insert_queued(&pool, 2, t0() + TimeDelta::seconds(1)).await?;
    insert_queued(&pool, 3, t0() + TimeDelta::seconds(2)).await?;

    let handler = RecordingHandler::default();
    let worker = Worker::new(store.clone(), handler.clone())
        .jitter(Duration::ZERO)
        .shutdown_when_queue_empty();
    worker.run().await;

    assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3]);
    for id in 1..=3 {
        let row = assert_some!(store.fetch_row(id).await?);
        assert_eq!(row.state, RecordState::Completed);
    }

    Ok(())
}

#[tokio::test]
async fn worker_only_takes_records_matching_its_conditions() -> anyhow::Result<()> {
    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0() + TimeDelta::minutes(1));
    let store = Store::new(pool.clone(), default_options(&clock))?;

    for id in 1..=4 {
        insert_queued(&pool, id, t0() + TimeDelta::seconds(id)).await?;
    }

    let handler = RecordingHandler::default();
    let worker = Worker::new(store.clone(), handler.clone())
        .conditions(vec![Expr::sql("w.id % 2 = ").push_bind(0_i64)])
        .shutdown_when_queue_empty();
    worker.run().await;

    assert_eq!(*handler.seen.lock().unwrap(), vec![2, 4]);
    assert_eq!(store.queued_count(&[]).await?, 2);

    Ok(())
}

#[tokio::test]
async fn run_next_reports_an_idle_queue() -> anyhow::Result<()> {
    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0());
    let store = Store::new(pool, default_options(&clock))?;

    let worker = Worker::new(store, RecordingHandler::default());
    assert_none!(worker.run_next().await?);

    Ok(())
}

#[tokio::test]
async fn records_are_locked_while_handled() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct BlockingHandler {
        started: Arc<Barrier>,
        assertions_finished: Arc<Barrier>,
    }

    impl Handler<TestRecord> for BlockingHandler {
        async fn handle(
            &self,
            _record: &TestRecord,
            _logger: &mut ExecutionLogger,
        ) -> anyhow::Result<()> {
            self.started.wait().await;
            self.assertions_finished.wait().await;
            Ok(())
        }
    }

    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0() + TimeDelta::minutes(1));
    let store = Store::new(pool.clone(), default_options(&clock))?;

    let handler = BlockingHandler {
        started: Arc::new(Barrier::new(2)),
        assertions_finished: Arc::new(Barrier::new(2)),
    };

    insert_queued(&pool, 1, t0()).await?;
    assert!(!record_is_locked(1, &pool).await?);

    let worker = Worker::new(store.clone(), handler.clone());
    let task = tokio::spawn(async move { worker.run_next().await });

    handler.started.wait().await;
    assert!(record_is_locked(1, &pool).await?);
    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Processing);

    // The sweep must not steal a record from a live worker.
    clock.advance(TimeDelta::hours(1));
    assert_eq!(store.reset_stalled().await?, (vec![], vec![]));

    handler.assertions_finished.wait().await;
    assert_some_eq!(task.await??, 1);
    assert!(!record_is_locked(1, &pool).await?);

    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Completed);

    Ok(())
}

#[tokio::test]
async fn handler_errors_are_retried_later() -> anyhow::Result<()> {
    #[derive(Clone, Default)]
    struct FlakyHandler {
        runs: Arc<AtomicU8>,
    }

    impl Handler<TestRecord> for FlakyHandler {
        async fn handle(
            &self,
            _record: &TestRecord,
            _logger: &mut ExecutionLogger,
        ) -> anyhow::Result<()> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow!("remote unavailable"));
            }
            Ok(())
        }
    }

    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0());
    let store = Store::new(pool.clone(), default_options(&clock))?;

    insert_queued(&pool, 1, t0()).await?;

    let handler = FlakyHandler::default();
    let worker = Worker::new(store.clone(), handler.clone());

    assert_some_eq!(worker.run_next().await?, 1);
    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Queued);
    assert_eq!(row.num_failures, 1);
    assert_some_eq!(row.failure_message.as_deref(), "remote unavailable");

    // Still backing off.
    assert_none!(worker.run_next().await?);

    clock.advance(TimeDelta::hours(1));
    assert_some_eq!(worker.run_next().await?, 1);
    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Completed);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

    Ok(())
}

#[tokio::test]
async fn non_retryable_errors_fail_the_record() -> anyhow::Result<()> {
    struct RejectingHandler;

    impl Handler<TestRecord> for RejectingHandler {
        async fn handle(
            &self,
            _record: &TestRecord,
            _logger: &mut ExecutionLogger,
        ) -> anyhow::Result<()> {
            Err(NonRetryable("malformed input".into()).into())
        }
    }

    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0());
    let store = Store::new(pool.clone(), default_options(&clock))?;

    insert_queued(&pool, 1, t0()).await?;

    let worker = Worker::new(store.clone(), RejectingHandler);
    assert_some_eq!(worker.run_next().await?, 1);

    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Failed);
    assert_some_eq!(row.failure_message.as_deref(), "malformed input");

    Ok(())
}

#[tokio::test]
async fn panicking_handlers_count_as_errors() -> anyhow::Result<()> {
    struct PanickingHandler;

    impl Handler<TestRecord> for PanickingHandler {
        async fn handle(
            &self,
            _record: &TestRecord,
            _logger: &mut ExecutionLogger,
        ) -> anyhow::Result<()> {
            panic!("kaboom")
        }
    }

    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0());
    let store = Store::new(pool.clone(), default_options(&clock))?;

    insert_queued(&pool, 1, t0()).await?;

    let worker = Worker::new(store.clone(), PanickingHandler);
    assert_some_eq!(worker.run_next().await?, 1);

    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Queued);
    assert_eq!(row.num_failures, 1);
    assert_some_eq!(row.failure_message.as_deref(), "handler panicked: kaboom");
    assert!(!record_is_locked(1, &pool).await?);

    Ok(())
}

#[tokio::test]
async fn handler_logs_are_stored_with_the_record() -> anyhow::Result<()> {
    struct LoggingHandler;

    impl Handler<TestRecord> for LoggingHandler {
        async fn handle(
            &self,
            record: &TestRecord,
            logger: &mut ExecutionLogger,
        ) -> anyhow::Result<()> {
            let entry =
                ExecutionLogEntry::new("sync", common::t0(), format!("synced {}", record.id))
                    .exit_code(0);
            logger.log(entry);
            assert_eq!(logger.entries().len(), 1);
            Err(anyhow!("sync incomplete"))
        }
    }

    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0());
    let store = Store::new(pool.clone(), default_options(&clock))?;

    insert_queued(&pool, 1, t0()).await?;

    let worker = Worker::new(store.clone(), LoggingHandler);
    assert_some_eq!(worker.run_next().await?, 1);

    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.execution_logs.len(), 1);
    assert_eq!(row.execution_logs[0].key, "sync");
    assert_eq!(row.execution_logs[0].out, "synced 1");
    assert_some_eq!(row.execution_logs[0].exit_code, 0);

    Ok(())
}

#[tokio::test]
async fn resetter_recovers_stalled_records() -> anyhow::Result<()> {
    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0() + TimeDelta::seconds(10));
    let store = Store::new(pool.clone(), default_options(&clock).max_num_resets(0))?;

    insert_processing(&pool, 1, t0()).await?;
    insert_processing(&pool, 2, t0() + TimeDelta::seconds(9)).await?;

    let resetter = Resetter::new(store.clone()).interval(Duration::from_secs(1));
    let (reset_ids, failed_ids) = resetter.run_once().await?;
    assert!(reset_ids.is_empty());
    assert_eq!(failed_ids, vec![1]);

    let row = assert_some!(store.fetch_row(1).await?);
    assert_eq!(row.state, RecordState::Failed);
    assert_eq!(row.num_resets, 1);

    let row = assert_some!(store.fetch_row(2).await?);
    assert_eq!(row.state, RecordState::Processing);

    Ok(())
}

#[tokio::test]
async fn resetter_loop_sweeps_on_its_interval() -> anyhow::Result<()> {
    let (pool, _container) = common::setup_test_db().await?;
    let clock = MockClock::new(t0() + TimeDelta::seconds(10));
    let store = Store::new(pool.clone(), default_options(&clock))?;

    insert_processing(&pool, 1, t0()).await?;

    let resetter = Resetter::new(store.clone()).interval(Duration::from_millis(50));
    let task = tokio::spawn(async move { resetter.run().await });

    let mut state = RecordState::Processing;
    for _ in 0..100 {
        state = assert_some!(store.fetch_row(1).await?).state;
        if state == RecordState::Queued {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    task.abort();

    assert_eq!(state, RecordState::Queued);

    Ok(())
}
