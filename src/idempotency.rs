//! Idempotency resolution.
//!
//! Deduplication relies on the log's `(user, key)` uniqueness alone; nothing
//! is cached in process, so replays resolve the same way across restarts and
//! across concurrent callers.

use tracing::{info, warn};

use crate::ledger::LedgerError;
use crate::model::{IdempotencyKey, LedgerEntry, NewEntry, TransactionOutcome};
use crate::store::{DuplicateKey, LogTxn};

pub const DEFAULT_MAX_KEY_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct IdempotencyResolver {
    max_key_len: usize,
}

impl IdempotencyResolver {
    pub fn new(max_key_len: usize) -> Self {
        Self { max_key_len }
    }

    /// Normalize a caller-supplied key.
    pub fn validate(&self, key: &str) -> Result<IdempotencyKey, LedgerError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(LedgerError::InvalidIdempotencyKey(
                "key is required".to_string(),
            ));
        }
        if key.len() > self.max_key_len {
            return Err(LedgerError::InvalidIdempotencyKey(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.max_key_len
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(LedgerError::InvalidIdempotencyKey(
                "key contains control characters".to_string(),
            ));
        }
        Ok(key.to_string())
    }

    /// The committed outcome for this request's key, if it was already used.
    pub fn replay(&self, txn: &LogTxn<'_>, request: &NewEntry) -> Option<TransactionOutcome> {
        let existing = txn.find_by_idempotency_key(&request.user_id, &request.idempotency_key)?;
        Some(Self::replayed(existing, request))
    }

    /// Resolve a lost uniqueness race to the winner's outcome.
    pub fn resolve_duplicate(
        &self,
        txn: &LogTxn<'_>,
        duplicate: &DuplicateKey,
        request: &NewEntry,
    ) -> Option<TransactionOutcome> {
        let existing = txn.entry(duplicate.existing)?;
        Some(Self::replayed(existing, request))
    }

    fn replayed(existing: &LedgerEntry, request: &NewEntry) -> TransactionOutcome {
        if existing.kind != request.kind || existing.amount != request.amount {
            warn!(
                user = %request.user_id,
                key = %request.idempotency_key,
                committed_kind = existing.kind.as_str(),
                committed_amount = %existing.amount,
                requested_kind = request.kind.as_str(),
                requested_amount = %request.amount,
                "idempotency key replayed with different parameters"
            );
        } else {
            info!(
                user = %request.user_id,
                key = %request.idempotency_key,
                entry = existing.id,
                "idempotent replay"
            );
        }
        TransactionOutcome::committed(existing)
    }
}

impl Default for IdempotencyResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_KEY_LEN)
    }
}
