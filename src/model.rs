//! Core domain types for the credit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Credits;
use crate::ledger::LedgerError;

/// Authenticated user identifier. The ledger trusts it as given.
pub type UserId = String;

/// Identifier of a purchasable content unit (chapter, message range, ...).
pub type ContentUnitId = String;

/// Ledger entry identifier, assigned monotonically by the transaction log.
pub type EntryId = u64;

/// Caller-supplied deduplication token, unique per user.
pub type IdempotencyKey = String;

/// Whether an entry adds credits to or removes credits from a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

/// Closed set of ledger entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Purchase,
    Consumption,
    Refund,
    AdminGrant,
    AdminDeduct,
    Bonus,
    Promo,
}

impl EntryKind {
    pub const ALL: [EntryKind; 7] = [
        EntryKind::Purchase,
        EntryKind::Consumption,
        EntryKind::Refund,
        EntryKind::AdminGrant,
        EntryKind::AdminDeduct,
        EntryKind::Bonus,
        EntryKind::Promo,
    ];

    /// Direction of the balance change. Exhaustive so a new kind cannot be
    /// added without classifying it.
    pub const fn direction(self) -> Direction {
        match self {
            EntryKind::Purchase
            | EntryKind::Refund
            | EntryKind::AdminGrant
            | EntryKind::Bonus
            | EntryKind::Promo => Direction::Credit,
            EntryKind::Consumption | EntryKind::AdminDeduct => Direction::Debit,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EntryKind::Purchase => "purchase",
            EntryKind::Consumption => "consumption",
            EntryKind::Refund => "refund",
            EntryKind::AdminGrant => "admin_grant",
            EntryKind::AdminDeduct => "admin_deduct",
            EntryKind::Bonus => "bonus",
            EntryKind::Promo => "promo",
        }
    }
}

/// Kinds a plain grant may record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    Purchase,
    AdminGrant,
    Bonus,
    Promo,
}

impl From<GrantKind> for EntryKind {
    fn from(kind: GrantKind) -> Self {
        match kind {
            GrantKind::Purchase => EntryKind::Purchase,
            GrantKind::AdminGrant => EntryKind::AdminGrant,
            GrantKind::Bonus => EntryKind::Bonus,
            GrantKind::Promo => EntryKind::Promo,
        }
    }
}

/// Direction of an administrative adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustDirection {
    Grant,
    Deduct,
}

impl AdjustDirection {
    pub const fn entry_kind(self) -> EntryKind {
        match self {
            AdjustDirection::Grant => EntryKind::AdminGrant,
            AdjustDirection::Deduct => EntryKind::AdminDeduct,
        }
    }
}

/// Optional references attached to an entry for audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_unit_id: Option<ContentUnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Consumption entry a refund reverses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_of: Option<EntryId>,
}

impl EntryContext {
    pub fn content(content_unit_id: impl Into<ContentUnitId>) -> Self {
        Self {
            content_unit_id: Some(content_unit_id.into()),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// An entry waiting to be appended. The log assigns id, snapshot and timestamp.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub user_id: UserId,
    pub kind: EntryKind,
    pub amount: Credits,
    pub context: EntryContext,
    pub idempotency_key: IdempotencyKey,
}

/// One immutable, append-only accounting record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub kind: EntryKind,
    /// Strictly positive magnitude; the sign comes from `kind`.
    pub amount: Credits,
    /// Audit snapshot only, never read back as a balance.
    pub balance_after: Credits,
    #[serde(default)]
    pub context: EntryContext,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect of this entry on its owner's balance.
    pub fn signed_amount(&self) -> Credits {
        match self.kind.direction() {
            Direction::Credit => self.amount,
            Direction::Debit => Credits::ZERO - self.amount,
        }
    }
}

/// Durable record that a user unlocked a content unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: UserId,
    pub content_unit_id: ContentUnitId,
    pub credits_charged: Credits,
    /// Consumption entry that paid for it; `None` for free unlocks.
    pub entry_id: Option<EntryId>,
    pub created_at: DateTime<Utc>,
}

/// Result of a grant, spend, adjustment or refund.
///
/// Expected business conditions are carried in `error`; replays of a
/// committed operation return an outcome equal to the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub committed: bool,
    pub entry_id: Option<EntryId>,
    pub balance_after: Option<Credits>,
    pub error: Option<LedgerError>,
}

impl TransactionOutcome {
    pub fn committed(entry: &LedgerEntry) -> Self {
        Self {
            committed: true,
            entry_id: Some(entry.id),
            balance_after: Some(entry.balance_after),
            error: None,
        }
    }

    /// Nothing was written. `balance` is the balance observed, when one was read.
    pub fn refused(error: LedgerError, balance: Option<Credits>) -> Self {
        Self {
            committed: false,
            entry_id: None,
            balance_after: balance,
            error: Some(error),
        }
    }
}

/// Result of an unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub success: bool,
    pub already_unlocked: bool,
    pub credits_charged: Credits,
    pub balance_after: Option<Credits>,
    pub entry_id: Option<EntryId>,
    pub error: Option<LedgerError>,
}

impl UnlockOutcome {
    pub fn unlocked(charged: Credits, balance: Credits, entry_id: Option<EntryId>) -> Self {
        Self {
            success: true,
            already_unlocked: false,
            credits_charged: charged,
            balance_after: Some(balance),
            entry_id,
            error: None,
        }
    }

    pub fn already_unlocked(balance: Credits) -> Self {
        Self {
            success: true,
            already_unlocked: true,
            credits_charged: Credits::ZERO,
            balance_after: Some(balance),
            entry_id: None,
            error: None,
        }
    }

    pub fn failed(error: LedgerError, balance: Option<Credits>) -> Self {
        Self {
            success: false,
            already_unlocked: false,
            credits_charged: Credits::ZERO,
            balance_after: balance,
            entry_id: None,
            error: Some(error),
        }
    }
}

/// Result of an engagement bonus claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BonusOutcome {
    pub eligible: bool,
    pub bonus_credits: Credits,
    /// Present when a grant was attempted.
    pub transaction: Option<TransactionOutcome>,
}

/// Offset pagination over most-recent-first history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    pub offset: usize,
    /// Falls back to the configured default page size when `None`.
    pub limit: Option<usize>,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub entries: Vec<LedgerEntry>,
    /// Offset to pass to fetch the next page, if any entries remain.
    pub next_offset: Option<usize>,
}

/// A request to the ledger, as read from the command stream.
#[derive(Debug, Clone)]
pub enum Command {
    Grant {
        user: UserId,
        amount: Credits,
        kind: GrantKind,
        context: EntryContext,
        key: IdempotencyKey,
    },
    Spend {
        user: UserId,
        amount: Credits,
        context: EntryContext,
        key: IdempotencyKey,
    },
    Adjust {
        admin: UserId,
        user: UserId,
        amount: Credits,
        direction: AdjustDirection,
        reason: String,
        key: IdempotencyKey,
    },
    Unlock {
        user: UserId,
        content: ContentUnitId,
        key: IdempotencyKey,
    },
    Refund {
        user: UserId,
        entry: EntryId,
        key: IdempotencyKey,
    },
    Bonus {
        user: UserId,
        content: ContentUnitId,
        seconds: u64,
        key: IdempotencyKey,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Grant { .. } => "grant",
            Command::Spend { .. } => "spend",
            Command::Adjust { .. } => "adjust",
            Command::Unlock { .. } => "unlock",
            Command::Refund { .. } => "refund",
            Command::Bonus { .. } => "bonus",
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Command::Grant { user, .. }
            | Command::Spend { user, .. }
            | Command::Adjust { user, .. }
            | Command::Unlock { user, .. }
            | Command::Refund { user, .. }
            | Command::Bonus { user, .. } => user,
        }
    }
}
