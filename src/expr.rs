//! Composable SQL fragments with bound parameters.
//!
//! Queue queries are assembled from pieces supplied by the caller (column
//! projections, ordering, filter predicates) and pieces owned by the queue.
//! An [`Expr`] keeps literal SQL and parameter values apart until the final
//! query is built, so values only ever reach Postgres as `$n` parameters.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

/// A value bound as a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `bigint`
    Int(i64),
    /// `integer`
    Int4(i32),
    /// `boolean`
    Bool(bool),
    /// `text`
    Text(String),
    /// `timestamptz`
    Timestamp(DateTime<Utc>),
    /// `text[]`
    TextArray(Vec<String>),
    /// `jsonb`
    Json(serde_json::Value),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int4(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Sql(String),
    Bind(Value),
}

/// A fragment of SQL with its parameters.
///
/// ```
/// use dbworker::Expr;
///
/// let condition = Expr::sql("w.repository_id = ").push_bind(42_i64);
/// let order = Expr::sql("w.priority DESC, w.created_at");
/// # let _ = (condition, order);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expr {
    parts: Vec<Part>,
}

impl Expr {
    /// A fragment of literal SQL.
    ///
    /// The text is inserted verbatim, so it must never contain untrusted input.
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::default().push_sql(sql)
    }

    /// A fragment consisting of a single bound parameter.
    pub fn bind(value: impl Into<Value>) -> Self {
        Self::default().push_bind(value)
    }

    /// Append literal SQL.
    pub fn push_sql(mut self, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        if sql.is_empty() {
            return self;
        }
        match self.parts.last_mut() {
            Some(Part::Sql(last)) => last.push_str(&sql),
            _ => self.parts.push(Part::Sql(sql)),
        }
        self
    }

    /// Append a bound parameter.
    pub fn push_bind(mut self, value: impl Into<Value>) -> Self {
        self.parts.push(Part::Bind(value.into()));
        self
    }

    /// Append another fragment.
    pub fn push_expr(mut self, other: Expr) -> Self {
        for part in other.parts {
            self = match part {
                Part::Sql(sql) => self.push_sql(sql),
                Part::Bind(value) => self.push_bind(value),
            };
        }
        self
    }

    /// Join fragments with a literal separator.
    pub fn join(exprs: impl IntoIterator<Item = Expr>, separator: &str) -> Self {
        let mut joined = Self::default();
        for (i, expr) in exprs.into_iter().enumerate() {
            if i > 0 {
                joined = joined.push_sql(separator);
            }
            joined = joined.push_expr(expr);
        }
        joined
    }

    /// The conjunction of the given conditions, each parenthesized.
    ///
    /// An empty list yields `TRUE`.
    pub fn and(conditions: impl IntoIterator<Item = Expr>) -> Self {
        let wrapped: Vec<_> = conditions
            .into_iter()
            .map(|c| Expr::sql("(").push_expr(c).push_sql(")"))
            .collect();
        if wrapped.is_empty() {
            return Expr::sql("TRUE");
        }
        Self::join(wrapped, " AND ")
    }

    /// Whether the fragment contains nothing.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Push this fragment onto a query under construction.
    pub(crate) fn render_into(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        for part in &self.parts {
            match part {
                Part::Sql(sql) => {
                    builder.push(sql);
                }
                Part::Bind(value) => {
                    match value.clone() {
                        Value::Int(v) => builder.push_bind(v),
                        Value::Int4(v) => builder.push_bind(v),
                        Value::Bool(v) => builder.push_bind(v),
                        Value::Text(v) => builder.push_bind(v),
                        Value::Timestamp(v) => builder.push_bind(v),
                        Value::TextArray(v) => builder.push_bind(v),
                        Value::Json(v) => builder.push_bind(v),
                    };
                }
            }
        }
    }

    /// The SQL text this fragment renders to, with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("");
        self.render_into(&mut builder);
        builder.sql().to_string()
    }
}

impl From<&str> for Expr {
    fn from(sql: &str) -> Self {
        Expr::sql(sql)
    }
}
