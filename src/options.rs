use crate::clock::{Clock, SystemClock};
use crate::errors::QueueError;
use crate::expr::Expr;
use crate::scan::Scanner;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_STALLED_MAX_AGE: Duration = Duration::from_secs(60);
const DEFAULT_MAX_NUM_RESETS: i32 = 3;
const DEFAULT_MAX_NUM_RETRIES: i32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);

/// The delay imposed on a record before it is retried.
///
/// The delay doubles with every failure, starting at `base` and never
/// exceeding `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay after the first failure.
    #[serde(with = "secs")]
    pub base: Duration,
    /// Upper bound on the delay.
    #[serde(with = "secs")]
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Backoff {
    /// The delay after the record has failed `num_failures` times.
    pub fn delay(&self, num_failures: i32) -> Duration {
        let exponent = num_failures.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Retry and recovery limits for a queue.
///
/// Can be deserialized from configuration; durations are given in seconds.
///
/// The stall and error budgets are tracked separately: a record that has
/// been reset after stalling still has all of its error retries left, and
/// vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// How long a record may stay `processing` without a live lease before it
    /// is considered abandoned.
    #[serde(with = "secs")]
    pub stalled_max_age: Duration,
    /// How many times a stalled record is put back in the queue before it is
    /// failed.
    pub max_num_resets: i32,
    /// How many times an errored record is retried before it is failed.
    pub max_num_retries: i32,
    /// Delay before retrying an errored record.
    pub backoff: Backoff,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            stalled_max_age: DEFAULT_STALLED_MAX_AGE,
            max_num_resets: DEFAULT_MAX_NUM_RESETS,
            max_num_retries: DEFAULT_MAX_NUM_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

/// Configuration of a queue over one record shape.
///
/// Relation names and column expressions are trusted SQL written by the
/// queue's owner. Values that come from anywhere else belong in bound
/// parameters (see [`Expr::push_bind`]).
pub struct Options<R> {
    pub(crate) name: String,
    pub(crate) table_name: String,
    pub(crate) view_name: Option<String>,
    pub(crate) column_expressions: Vec<Expr>,
    pub(crate) order_by: Option<Expr>,
    pub(crate) created_at_column: String,
    pub(crate) scan: Scanner<R>,
    pub(crate) policy: Policy,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<R> std::fmt::Debug for Options<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("table_name", &self.table_name)
            .field("view_name", &self.view_name)
            .field("column_expressions", &self.column_expressions)
            .field("order_by", &self.order_by)
            .field("created_at_column", &self.created_at_column)
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<R> Options<R> {
    /// Create options for the queue `name` backed by `table_name`.
    ///
    /// `table_name` may carry an alias (`"uploads u"`), in which case
    /// ordering and conditions should refer to columns through that alias.
    pub fn new(name: impl Into<String>, table_name: impl Into<String>, scan: Scanner<R>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            view_name: None,
            column_expressions: Vec::new(),
            order_by: None,
            created_at_column: "created_at".to_string(),
            scan,
            policy: Policy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Read records through a view instead of the table.
    ///
    /// The view must expose the table's `id` column. Like the table name, it
    /// may carry an alias that the column expressions refer to.
    pub fn view_name(mut self, view_name: impl Into<String>) -> Self {
        self.view_name = Some(view_name.into());
        self
    }

    /// The columns handed to the scanner, in order.
    pub fn column_expressions(mut self, column_expressions: Vec<Expr>) -> Self {
        self.column_expressions = column_expressions;
        self
    }

    /// The ordering used to pick the next record.
    ///
    /// Defaults to the creation timestamp, oldest first.
    pub fn order_by(mut self, order_by: Expr) -> Self {
        self.order_by = Some(order_by);
        self
    }

    /// The column holding the insertion time. Defaults to `created_at`.
    pub fn created_at_column(mut self, column: impl Into<String>) -> Self {
        self.created_at_column = column.into();
        self
    }

    /// Replace the retry and recovery limits.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how long a `processing` record may go without a live lease.
    pub fn stalled_max_age(mut self, stalled_max_age: Duration) -> Self {
        self.policy.stalled_max_age = stalled_max_age;
        self
    }

    /// Set the stall recovery budget.
    pub fn max_num_resets(mut self, max_num_resets: i32) -> Self {
        self.policy.max_num_resets = max_num_resets;
        self
    }

    /// Set the error retry budget.
    pub fn max_num_retries(mut self, max_num_retries: i32) -> Self {
        self.policy.max_num_retries = max_num_retries;
        self
    }

    /// Set the retry backoff.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.policy.backoff = backoff;
        self
    }

    /// Use a different time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check that the options describe a queue that can work.
    pub fn validate(&self) -> Result<(), QueueError> {
        let invalid = |msg: String| Err(QueueError::InvalidOptions(msg));

        if self.name.trim().is_empty() {
            return invalid("queue name must not be empty".into());
        }
        validate_relation("table name", &self.table_name)?;
        if let Some(view_name) = &self.view_name {
            validate_relation("view name", view_name)?;
        }
        if !is_identifier(&self.created_at_column) {
            return invalid(format!(
                "created_at column {:?} is not an identifier",
                self.created_at_column
            ));
        }
        if self.column_expressions.is_empty() {
            return invalid("at least one column expression is required".into());
        }
        if self.policy.stalled_max_age.is_zero() {
            return invalid("stalled max age must be positive".into());
        }
        if self.policy.max_num_resets < 0 || self.policy.max_num_retries < 0 {
            return invalid("retry and reset budgets must not be negative".into());
        }
        if self.policy.backoff.base.is_zero() {
            return invalid("backoff base must be positive".into());
        }
        if self.policy.backoff.max < self.policy.backoff.base {
            return invalid("backoff max must not be smaller than its base".into());
        }
        Ok(())
    }

    /// The alias engine-owned columns are qualified with when writing.
    pub(crate) fn table_alias(&self) -> &str {
        relation_alias(&self.table_name)
    }

    /// The relation records are read from.
    pub(crate) fn read_relation(&self) -> &str {
        self.view_name.as_deref().unwrap_or(&self.table_name)
    }

    /// The alias of the relation records are read from.
    pub(crate) fn read_alias(&self) -> &str {
        relation_alias(self.read_relation())
    }

    pub(crate) fn order_by_expr(&self) -> Expr {
        match &self.order_by {
            Some(order_by) => order_by.clone(),
            None => {
                let alias = self.table_alias();
                Expr::sql(format!(
                    "{alias}.{}, {alias}.id",
                    self.created_at_column
                ))
            }
        }
    }
}

/// `"uploads u"` -> `"u"`, `"uploads AS u"` -> `"u"`, `"uploads"` -> `"uploads"`.
fn relation_alias(relation: &str) -> &str {
    relation.split_whitespace().last().unwrap_or(relation)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_relation(what: &str, relation: &str) -> Result<(), QueueError> {
    let words: Vec<&str> = relation.split_whitespace().collect();
    let valid = match words.as_slice() {
        [name] => name.split('.').all(is_identifier),
        [name, alias] => name.split('.').all(is_identifier) && is_identifier(alias),
        [name, kw, alias] => {
            name.split('.').all(is_identifier)
                && kw.eq_ignore_ascii_case("as")
                && is_identifier(alias)
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidOptions(format!(
            "{what} {relation:?} must be a relation name with an optional alias"
        )))
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
