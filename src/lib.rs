#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod clock;
mod errors;
mod expr;
mod lease;
mod options;
mod record;
mod resetter;
mod scan;
/// Row types for queue bookkeeping columns.
pub mod schema;
mod storage;
mod store;
mod util;
mod worker;

/// Time sources.
pub use self::clock::{Clock, MockClock, SystemClock};
/// Error type for queue operations.
pub use self::errors::QueueError;
/// SQL fragments with bound parameters.
pub use self::expr::{Expr, Value};
/// The exclusive claim on a dequeued record.
pub use self::lease::Lease;
/// Queue configuration.
pub use self::options::{Backoff, Options, Policy};
/// The record contract and its bookkeeping types.
pub use self::record::{ExecutionLogEntry, Record, RecordState};
/// Stalled record recovery loop.
pub use self::resetter::Resetter;
/// Row-to-record conversion.
pub use self::scan::{Scanner, scan_with};
/// The queue engine.
pub use self::store::Store;
/// Record processing loop.
pub use self::worker::{ExecutionLogger, Handler, NonRetryable, Worker};
