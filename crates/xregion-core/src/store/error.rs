//! Store error types.

use thiserror::Error;

use super::model::TransactionStatus;

/// Errors that can occur during transaction store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON encoding of an event payload failed.
    #[error("event payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    /// A timestamp does not fit the signed 64-bit column type.
    #[error("timestamp {0} exceeds i64 range")]
    TimestampOutOfRange(u64),

    /// A transaction cannot be created without regions.
    #[error("cannot create transaction: region registry is empty")]
    NoRegions,

    /// The commit marker already exists; another process got there first.
    #[error("transaction {uid} already has a commit marker")]
    AlreadyCommitted {
        /// The transaction uid.
        uid: String,
    },

    /// A conditional update matched no row.
    #[error("transaction {uid} is no longer in status {expected}")]
    StaleTransition {
        /// The transaction uid.
        uid: String,
        /// The status the update required.
        expected: TransactionStatus,
    },
}
