//! Query construction for every state transition.
//!
//! Each transition on a single row first locks the row with
//! `FOR UPDATE SKIP LOCKED`. A row locked by a live lease is therefore
//! invisible to everyone but the lease holder, whose own lock does not hide
//! the row from itself.

use crate::expr::Expr;
use crate::options::Options;
use crate::record::RecordState;
use crate::schema::QueueRow;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Postgres, QueryBuilder};

/// Message recorded on rows failed by the stall sweep.
pub(crate) const STALLED_FAILURE_MESSAGE: &str =
    "record exceeded the maximum number of resets after stalling";

fn build(expr: &Expr) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("");
    expr.render_into(&mut builder);
    builder
}

/// The conditions a row must meet to be claimed.
fn eligibility<R>(options: &Options<R>, conditions: &[Expr], now: DateTime<Utc>) -> Expr {
    let a = options.table_alias();
    let mut all = vec![
        Expr::sql(format!("{a}.state = ")).push_bind(RecordState::Queued.as_str()),
        Expr::sql(format!("{a}.process_after IS NULL OR {a}.process_after <= ")).push_bind(now),
    ];
    all.extend(conditions.iter().cloned());
    Expr::and(all)
}

/// Selects and locks row `id` if it is in one of `states` and not locked by
/// another transaction. Produces a single `id` column.
fn lock_target<R>(options: &Options<R>, id: i64, states: &[RecordState]) -> Expr {
    let a = options.table_alias();
    let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
    Expr::sql(format!("SELECT {a}.id FROM {} WHERE {a}.id = ", options.table_name))
        .push_bind(id)
        .push_sql(format!(" AND {a}.state = ANY("))
        .push_bind(states)
        .push_sql(") FOR UPDATE SKIP LOCKED")
}

/// Runs `UPDATE ... SET <assignments>` on row `id` if it is in one of
/// `states` and not locked by someone else.
async fn update_locked<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
    states: &[RecordState],
    assignments: Expr,
) -> Result<bool, sqlx::Error> {
    let a = options.table_alias();
    let query = Expr::sql("WITH target AS (")
        .push_expr(lock_target(options, id, states))
        .push_sql(format!(") UPDATE {} SET ", options.table_name))
        .push_expr(assignments)
        .push_sql(format!(
            " WHERE {a}.id IN (SELECT id FROM target) RETURNING {a}.id::bigint"
        ));

    let updated = build(&query)
        .build_query_scalar::<i64>()
        .fetch_optional(conn)
        .await?;
    Ok(updated.is_some())
}

/// Claims the next eligible row, moving it to `processing`.
///
/// Runs as a single statement, so the claim is committed as soon as it
/// returns.
pub(crate) async fn claim_next<R>(
    executor: impl PgExecutor<'_>,
    options: &Options<R>,
    conditions: &[Expr],
    now: DateTime<Utc>,
) -> Result<Option<i64>, sqlx::Error> {
    let a = options.table_alias();
    let query = Expr::sql(format!(
        "WITH candidate AS (SELECT {a}.id FROM {} WHERE ",
        options.table_name
    ))
    .push_expr(eligibility(options, conditions, now))
    .push_sql(" ORDER BY ")
    .push_expr(options.order_by_expr())
    .push_sql(format!(
        " FOR UPDATE SKIP LOCKED LIMIT 1) UPDATE {} SET state = ",
        options.table_name
    ))
    .push_bind(RecordState::Processing.as_str())
    .push_sql(", started_at = ")
    .push_bind(now)
    .push_sql(", finished_at = NULL")
    .push_sql(format!(
        " WHERE {a}.id IN (SELECT id FROM candidate) RETURNING {a}.id::bigint"
    ));

    build(&query)
        .build_query_scalar::<i64>()
        .fetch_optional(executor)
        .await
}

/// Selects and locks a claimed row, skipping it if another lease got there
/// first (the row was requeued and claimed again after our claim committed).
fn lock_claimed_query<R>(options: &Options<R>, id: i64) -> Expr {
    let a = options.table_alias();
    Expr::sql(format!(
        "SELECT {a}.id::bigint FROM {} WHERE {a}.id = ",
        options.table_name
    ))
    .push_bind(id)
    .push_sql(format!(" AND {a}.state = "))
    .push_bind(RecordState::Processing.as_str())
    .push_sql(" FOR UPDATE SKIP LOCKED")
}

/// Takes the lock a lease holds on its row for as long as it lives.
///
/// Returns `false` without waiting when the row is no longer `processing` or
/// is locked by someone else.
pub(crate) async fn lock_claimed<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let query = lock_claimed_query(options, id);

    let locked = build(&query)
        .build_query_scalar::<i64>()
        .fetch_optional(conn)
        .await?;
    Ok(locked.is_some())
}

/// Reads the record through the configured projection.
pub(crate) async fn select_record<R>(
    executor: impl PgExecutor<'_>,
    options: &Options<R>,
    id: i64,
) -> Result<Option<PgRow>, sqlx::Error> {
    let query = Expr::sql("SELECT ")
        .push_expr(Expr::join(options.column_expressions.iter().cloned(), ", "))
        .push_sql(format!(
            " FROM {} WHERE {}.id = ",
            options.read_relation(),
            options.read_alias()
        ))
        .push_bind(id);

    build(&query).build().fetch_optional(executor).await
}

/// Locks a `processing` row and returns its failure count.
async fn lock_processing<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
) -> Result<Option<i32>, sqlx::Error> {
    let a = options.table_alias();
    let query = Expr::sql(format!(
        "SELECT {a}.num_failures FROM {} WHERE {a}.id = ",
        options.table_name
    ))
    .push_bind(id)
    .push_sql(format!(" AND {a}.state = "))
    .push_bind(RecordState::Processing.as_str())
    .push_sql(" FOR UPDATE SKIP LOCKED");

    build(&query)
        .build_query_scalar::<i32>()
        .fetch_optional(conn)
        .await
}

pub(crate) async fn mark_complete<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let assignments = Expr::sql("state = ")
        .push_bind(RecordState::Completed.as_str())
        .push_sql(", finished_at = ")
        .push_bind(now)
        .push_sql(", process_after = NULL");

    update_locked(conn, options, id, &[RecordState::Processing], assignments).await
}

/// Records a failed attempt, either scheduling a retry or failing the row
/// once the retry budget is spent.
pub(crate) async fn mark_errored<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Option<RecordState>, sqlx::Error> {
    let Some(num_failures) = lock_processing(conn, options, id).await? else {
        return Ok(None);
    };

    let policy = &options.policy;
    let num_failures = num_failures.saturating_add(1);

    let (state, assignments) = if num_failures > policy.max_num_retries {
        let assignments = Expr::sql("state = ")
            .push_bind(RecordState::Failed.as_str())
            .push_sql(", finished_at = ")
            .push_bind(now)
            .push_sql(", process_after = NULL");
        (RecordState::Failed, assignments)
    } else {
        let delay = policy.backoff.delay(num_failures);
        let process_after = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let assignments = Expr::sql("state = ")
            .push_bind(RecordState::Queued.as_str())
            .push_sql(", started_at = NULL, finished_at = NULL, process_after = ")
            .push_bind(process_after);
        (RecordState::Queued, assignments)
    };

    let assignments = assignments
        .push_sql(", failure_message = ")
        .push_bind(message)
        .push_sql(", num_failures = ")
        .push_bind(num_failures);

    let updated = update_locked(conn, options, id, &[RecordState::Processing], assignments).await?;
    Ok(updated.then_some(state))
}

pub(crate) async fn mark_failed<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let assignments = Expr::sql("state = ")
        .push_bind(RecordState::Failed.as_str())
        .push_sql(", finished_at = ")
        .push_bind(now)
        .push_sql(", process_after = NULL, num_failures = num_failures + 1, failure_message = ")
        .push_bind(message);

    update_locked(conn, options, id, &[RecordState::Processing], assignments).await
}

/// Puts a non-terminal row back in the queue without touching its counters.
pub(crate) async fn requeue<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
    process_after: Option<DateTime<Utc>>,
) -> Result<bool, sqlx::Error> {
    let assignments = Expr::sql("state = ")
        .push_bind(RecordState::Queued.as_str())
        .push_sql(", started_at = NULL, finished_at = NULL, process_after = ");
    let assignments = match process_after {
        Some(process_after) => assignments.push_bind(process_after),
        None => assignments.push_sql("NULL"),
    };

    let states = [
        RecordState::Queued,
        RecordState::Processing,
        RecordState::Errored,
    ];
    update_locked(conn, options, id, &states, assignments).await
}

/// Returns a non-terminal row to `queued`, eligible right away. The retry and
/// reset counters are kept.
pub(crate) async fn reset_queued<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let assignments = Expr::sql("state = ")
        .push_bind(RecordState::Queued.as_str())
        .push_sql(", started_at = NULL, finished_at = NULL, process_after = NULL");

    let states = [
        RecordState::Queued,
        RecordState::Processing,
        RecordState::Errored,
    ];
    update_locked(conn, options, id, &states, assignments).await
}

pub(crate) async fn add_execution_log_entry<R>(
    conn: &mut PgConnection,
    options: &Options<R>,
    id: i64,
    entry: serde_json::Value,
) -> Result<bool, sqlx::Error> {
    let assignments =
        Expr::sql("execution_logs = array_append(COALESCE(execution_logs, '{}'::jsonb[]), ")
            .push_bind(entry)
            .push_sql(")");

    update_locked(conn, options, id, &[RecordState::Processing], assignments).await
}

/// Recovers rows left `processing` since before `cutoff` by a lease that no
/// longer exists. Returns each touched id with its new state.
pub(crate) async fn reset_stalled<R>(
    executor: impl PgExecutor<'_>,
    options: &Options<R>,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<(i64, String)>, sqlx::Error> {
    let a = options.table_alias();
    let max_num_resets = options.policy.max_num_resets;
    let failed = RecordState::Failed.as_str();

    let query = Expr::sql(format!(
        "WITH stalled AS (SELECT {a}.id FROM {} WHERE {a}.state = ",
        options.table_name
    ))
    .push_bind(RecordState::Processing.as_str())
    .push_sql(format!(" AND {a}.started_at < "))
    .push_bind(cutoff)
    .push_sql(format!(
        " FOR UPDATE SKIP LOCKED) UPDATE {} SET num_resets = num_resets + 1, \
         state = CASE WHEN num_resets + 1 > ",
        options.table_name
    ))
    .push_bind(max_num_resets)
    .push_sql(" THEN ")
    .push_bind(failed)
    .push_sql(" ELSE ")
    .push_bind(RecordState::Queued.as_str())
    .push_sql(" END, started_at = CASE WHEN num_resets + 1 > ")
    .push_bind(max_num_resets)
    .push_sql(" THEN started_at ELSE NULL END, finished_at = CASE WHEN num_resets + 1 > ")
    .push_bind(max_num_resets)
    .push_sql(" THEN ")
    .push_bind(now)
    .push_sql(" ELSE NULL END, failure_message = CASE WHEN num_resets + 1 > ")
    .push_bind(max_num_resets)
    .push_sql(" THEN ")
    .push_bind(STALLED_FAILURE_MESSAGE)
    .push_sql(" ELSE failure_message END")
    .push_sql(format!(
        " WHERE {a}.id IN (SELECT id FROM stalled) RETURNING {a}.id::bigint, {a}.state"
    ));

    build(&query)
        .build_query_as::<(i64, String)>()
        .fetch_all(executor)
        .await
}

pub(crate) async fn queued_count<R>(
    executor: impl PgExecutor<'_>,
    options: &Options<R>,
    conditions: &[Expr],
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let query = Expr::sql(format!("SELECT COUNT(*) FROM {} WHERE ", options.table_name))
        .push_expr(eligibility(options, conditions, now));

    build(&query)
        .build_query_scalar::<i64>()
        .fetch_one(executor)
        .await
}

/// The time since the longest-waiting eligible row became eligible.
pub(crate) async fn oldest_eligible<R>(
    executor: impl PgExecutor<'_>,
    options: &Options<R>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let a = options.table_alias();
    let query = Expr::sql(format!(
        "SELECT MIN(COALESCE({a}.process_after, {a}.{})) FROM {} WHERE ",
        options.created_at_column, options.table_name
    ))
    .push_expr(eligibility(options, &[], now));

    build(&query)
        .build_query_scalar::<Option<DateTime<Utc>>>()
        .fetch_one(executor)
        .await
}

pub(crate) async fn fetch_row<R>(
    executor: impl PgExecutor<'_>,
    options: &Options<R>,
    id: i64,
) -> Result<Option<QueueRow>, sqlx::Error> {
    let a = options.table_alias();
    let query = Expr::sql(format!(
        "SELECT {a}.id::bigint AS id, {a}.state, {a}.failure_message, {a}.started_at, \
         {a}.finished_at, {a}.process_after, {a}.num_resets, {a}.num_failures, \
         {a}.{} AS created_at, {a}.execution_logs FROM {} WHERE {a}.id = ",
        options.created_at_column, options.table_name
    ))
    .push_bind(id);

    build(&query)
        .build_query_as::<QueueRow>()
        .fetch_optional(executor)
        .await
}
