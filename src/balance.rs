//! Balance derivation.
//!
//! A balance is never stored: it is the fold of a user's entries, credits
//! minus debits, over the whole history.

use crate::Credits;
use crate::model::{EntryId, LedgerEntry};

/// Fold entries into a balance.
pub fn fold<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Credits {
    entries.into_iter().map(LedgerEntry::signed_amount).sum()
}

/// Ids of entries whose `balance_after` snapshot disagrees with the running
/// fold. Entries must be given in append order for a single user.
pub fn snapshot_mismatches<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Vec<EntryId> {
    let mut running = Credits::ZERO;
    let mut mismatches = Vec::new();
    for entry in entries {
        running += entry.signed_amount();
        if entry.balance_after != running {
            mismatches.push(entry.id);
        }
    }
    mismatches
}

/// Result of re-folding one user's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub balance: Credits,
    pub entries: usize,
    pub snapshot_mismatches: Vec<EntryId>,
}

impl AuditReport {
    pub fn from_entries(entries: &[&LedgerEntry]) -> Self {
        Self {
            balance: fold(entries.iter().copied()),
            entries: entries.len(),
            snapshot_mismatches: snapshot_mismatches(entries.iter().copied()),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.snapshot_mismatches.is_empty() && self.balance >= Credits::ZERO
    }
}
