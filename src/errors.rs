/// Errors returned by queue operations.
///
/// A missing or ineligible record is never an error: operations report it
/// through `Ok(None)` or `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The database rejected or failed to run a query.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// An execution log entry could not be encoded.
    #[error("Failed to serialize execution log entry: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue was configured with options that cannot work.
    #[error("Invalid queue options: {0}")]
    InvalidOptions(String),

    /// A row held a value the queue does not understand.
    #[error("Invalid record state: {0}")]
    InvalidState(String),
}
