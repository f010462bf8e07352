//! Error types for the transaction log.

use thiserror::Error;

use crate::model::{EntryId, IdempotencyKey, UserId};

/// Infrastructure failure. Callers retry with the same idempotency key.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("journal i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },

    #[error("journal line {line} conflicts with earlier records: {reason}")]
    Replay { line: usize, reason: String },

    #[error("journal record could not be encoded: {0}")]
    Encode(serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The `(user, idempotency key)` pair already has a committed entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("idempotency key '{key}' already used by user {user_id} (entry {existing})")]
pub struct DuplicateKey {
    pub user_id: UserId,
    pub key: IdempotencyKey,
    pub existing: EntryId,
}
