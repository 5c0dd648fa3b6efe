#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use dbworker::{Expr, MockClock, Options, Record, Scanner, scan_with};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TestRecord {
    pub id: i64,
    pub state: String,
}

impl Record for TestRecord {
    fn record_id(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TestRecordView {
    pub id: i64,
    pub state: String,
    pub new_field: i64,
}

impl Record for TestRecordView {
    fn record_id(&self) -> i64 {
        self.id
    }
}

/// Set up a test database with `TestContainers` and return the pool and container
pub async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
    init_tracing();

    let postgres_image = Postgres::default();
    let container = postgres_image.start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;

    // Use the standard postgres/postgres credentials for testcontainers
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&connection_string)
        .await?;

    sqlx::migrate!("./tests/migrations").run(&pool).await?;

    Ok((pool, container))
}

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The time every test starts at.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn test_options<R: Record>(scan: Scanner<R>, clock: &MockClock) -> Options<R> {
    Options::new("test", "workerutil_test w", scan)
        .column_expressions(vec![Expr::sql("w.id"), Expr::sql("w.state")])
        .order_by(Expr::sql("w.uploaded_at"))
        .created_at_column("uploaded_at")
        .stalled_max_age(Duration::from_secs(5))
        .max_num_resets(5)
        .max_num_retries(3)
        .clock(Arc::new(clock.clone()))
}

pub fn default_options(clock: &MockClock) -> Options<TestRecord> {
    test_options(scan_with::<TestRecord>(), clock)
}

pub async fn insert_queued(
    pool: &PgPool,
    id: i64,
    uploaded_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO workerutil_test (id, state, uploaded_at) VALUES ($1, 'queued', $2)")
        .bind(id)
        .bind(uploaded_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_processing(
    pool: &PgPool,
    id: i64,
    started_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO workerutil_test (id, state, started_at, uploaded_at) \
         VALUES ($1, 'processing', $2, $2)",
    )
    .bind(id)
    .bind(started_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_is_locked(id: i64, pool: &PgPool) -> anyhow::Result<bool> {
    let result = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM workerutil_test WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_none())
}
