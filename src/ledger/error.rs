//! Business outcomes the ledger reports instead of failing.

use thiserror::Error;

use crate::Credits;
use crate::model::{ContentUnitId, EntryId, IdempotencyKey};

/// Expected conditions, carried inside outcomes rather than returned as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Credits),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: Credits, available: Credits },

    #[error("content unit {0} not found")]
    ContentNotFound(ContentUnitId),

    #[error("ledger entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("idempotency key '{0}' was already used for a different operation")]
    IdempotencyKeyConflict(IdempotencyKey),

    #[error("ledger entry {0} was already refunded")]
    AlreadyRefunded(EntryId),

    #[error("ledger entry {0} is not a consumption and cannot be refunded")]
    NotRefundable(EntryId),
}

/// How the surrounding service should present an error to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    PaymentRequired,
    NotFound,
    Conflict,
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InvalidAmount(_) | LedgerError::InvalidIdempotencyKey(_) => {
                ErrorClass::BadRequest
            }
            LedgerError::InsufficientCredits { .. } => ErrorClass::PaymentRequired,
            LedgerError::ContentNotFound(_) | LedgerError::EntryNotFound(_) => ErrorClass::NotFound,
            LedgerError::IdempotencyKeyConflict(_)
            | LedgerError::AlreadyRefunded(_)
            | LedgerError::NotRefundable(_) => ErrorClass::Conflict,
        }
    }
}
