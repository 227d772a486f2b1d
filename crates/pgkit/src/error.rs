//! Error types for the storage layer.

use thiserror::Error;

/// Main error type for statement building, pooling and migrations.
#[derive(Error, Debug)]
pub enum PgError {
    /// `join` was called with an empty list of fragments.
    #[error("Cannot join an empty list of fragments")]
    EmptyJoin,

    /// `InsertFragment::set` referenced a column that is not part of the record.
    #[error("Unknown column in set(): {0}")]
    UnknownColumn(String),

    /// Builder invariant violation. Indicates a bug in this crate, not in caller code.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error (bad URL, missing fields, pool construction).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection checkout from the pool failed.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Database error returned by the driver.
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// A statement was issued on a transaction that already committed or rolled back.
    #[error("Transaction is already finished")]
    TransactionClosed,

    /// Another migration runner holds the advisory lock.
    #[error("Could not obtain advisory lock, another migration is running")]
    LockContention,

    /// Candidate migration ids are not positive, unique and strictly consecutive.
    #[error("Migration sequence violation: {0}")]
    SequenceViolation(String),

    /// The applied history disagrees with the candidate list on id or name.
    #[error("Migration history mismatch: {0}")]
    HistoryMismatch(String),

    /// A migration body or its bookkeeping insert failed and was rolled back.
    #[error("Migration [{id:03}] {name} failed: {source}")]
    Apply {
        id: i32,
        name: String,
        #[source]
        source: Box<PgError>,
    },
}

impl PgError {
    /// Wrap an error that aborted a specific migration.
    pub fn apply(id: i32, name: impl Into<String>, source: PgError) -> Self {
        PgError::Apply {
            id,
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Format error with full details including the source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, PgError>;
