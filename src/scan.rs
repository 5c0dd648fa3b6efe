use sqlx::FromRow;
use sqlx::postgres::PgRow;
use std::fmt;
use std::sync::Arc;

type ScanFn<R> = dyn Fn(&PgRow) -> Result<R, sqlx::Error> + Send + Sync;

/// Converts a row selected with the queue's column expressions into a record.
///
/// The row's columns appear in the order the queue's column expressions
/// were configured, so positional access (`row.try_get(0)`) and named access
/// both work.
pub struct Scanner<R> {
    scan: Arc<ScanFn<R>>,
}

impl<R> Scanner<R> {
    /// Wrap a conversion function.
    pub fn new(scan: impl Fn(&PgRow) -> Result<R, sqlx::Error> + Send + Sync + 'static) -> Self {
        Self {
            scan: Arc::new(scan),
        }
    }

    /// Convert a single row.
    pub fn scan(&self, row: &PgRow) -> Result<R, sqlx::Error> {
        (self.scan)(row)
    }

    /// Convert the first row of a result, if there is one.
    ///
    /// `Ok(None)` means the query matched nothing.
    pub fn scan_first(&self, row: Option<PgRow>) -> Result<Option<R>, sqlx::Error> {
        row.as_ref().map(|row| self.scan(row)).transpose()
    }
}

impl<R> Clone for Scanner<R> {
    fn clone(&self) -> Self {
        Self {
            scan: self.scan.clone(),
        }
    }
}

impl<R> fmt::Debug for Scanner<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Scanner(<function>)")
    }
}

/// A scanner built from the record's [`FromRow`] implementation.
pub fn scan_with<R>() -> Scanner<R>
where
    R: for<'r> FromRow<'r, PgRow> + 'static,
{
    Scanner::new(|row| R::from_row(row))
}
