//! Append-only transaction log.
//!
//! The log is the single source of truth for every credit a user owns. All
//! writes go through a [`LogTxn`], which holds the log exclusively from
//! `begin` until it is committed or dropped. Reads and writes made inside one
//! transaction are therefore serializable with respect to every other
//! transaction, which is what makes "check balance, then append" safe.
//!
//! Dropping a transaction without committing discards its staged writes.
//!
//! The lock is the log's isolation level, so a commit holds it through the
//! journal write and `sync_data`. Every reader and writer, for any user,
//! waits behind that fsync. Waiters suspend on the async mutex rather than
//! blocking a worker thread, and commit order is journal order.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::Credits;
use crate::balance;
use crate::model::{
    ContentUnitId, Entitlement, EntryId, EntryKind, IdempotencyKey, LedgerEntry, NewEntry, UserId,
};

mod error;
pub use error::{DuplicateKey, StoreError};

mod journal;
use journal::Journal;

/// Committed state plus its indexes.
#[derive(Debug, Default)]
struct LogState {
    /// Position `i` holds the entry with id `i + 1`.
    entries: Vec<LedgerEntry>,
    by_user: HashMap<UserId, Vec<usize>>,
    by_key: HashMap<UserId, HashMap<IdempotencyKey, usize>>,
    by_kind: HashMap<EntryKind, Vec<usize>>,
    entitlements: HashMap<UserId, BTreeMap<ContentUnitId, Entitlement>>,
    journal: Option<Journal>,
    /// Set after a failed journal write; the on-disk tail is unknown.
    poisoned: bool,
}

impl LogState {
    fn next_id(&self) -> EntryId {
        self.entries.len() as EntryId + 1
    }

    fn key_index(&self, user: &str, key: &str) -> Option<usize> {
        self.by_key.get(user).and_then(|keys| keys.get(key)).copied()
    }

    fn user_entries<'a>(&'a self, user: &str) -> impl DoubleEndedIterator<Item = &'a LedgerEntry> + 'a {
        self.by_user
            .get(user)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&idx| &self.entries[idx])
    }

    fn has_entitlement(&self, user: &str, unit: &str) -> bool {
        self.entitlements
            .get(user)
            .is_some_and(|units| units.contains_key(unit))
    }

    /// Insert an entry whose id and key have already been checked.
    fn insert_entry(&mut self, entry: LedgerEntry) {
        let idx = self.entries.len();
        self.by_user
            .entry(entry.user_id.clone())
            .or_default()
            .push(idx);
        self.by_key
            .entry(entry.user_id.clone())
            .or_default()
            .insert(entry.idempotency_key.clone(), idx);
        self.by_kind.entry(entry.kind).or_default().push(idx);
        self.entries.push(entry);
    }

    fn insert_entitlement(&mut self, entitlement: Entitlement) {
        self.entitlements
            .entry(entitlement.user_id.clone())
            .or_default()
            .insert(entitlement.content_unit_id.clone(), entitlement);
    }

    /// Rebuild state from one journal record, rejecting anything a live
    /// commit could never have produced.
    fn replay(&mut self, line: usize, record: journal::JournalRecord) -> Result<(), StoreError> {
        let conflict = |reason: String| StoreError::Replay { line, reason };

        for entry in record.entries {
            if entry.id != self.next_id() {
                return Err(conflict(format!(
                    "entry id {} out of sequence, expected {}",
                    entry.id,
                    self.next_id()
                )));
            }
            if let Some(existing) = self.key_index(&entry.user_id, &entry.idempotency_key) {
                return Err(conflict(format!(
                    "idempotency key '{}' of user {} already used by entry {}",
                    entry.idempotency_key,
                    entry.user_id,
                    self.entries[existing].id
                )));
            }
            if !entry.amount.is_positive() {
                return Err(conflict(format!("entry {} has non-positive amount", entry.id)));
            }
            self.insert_entry(entry);
        }

        for entitlement in record.entitlements {
            if self.has_entitlement(&entitlement.user_id, &entitlement.content_unit_id) {
                return Err(conflict(format!(
                    "duplicate entitlement for user {} on {}",
                    entitlement.user_id, entitlement.content_unit_id
                )));
            }
            self.insert_entitlement(entitlement);
        }
        Ok(())
    }
}

/// Durable, append-only store of ledger entries and entitlements.
#[derive(Debug)]
pub struct TransactionLog {
    state: Mutex<LogState>,
}

impl TransactionLog {
    /// A log that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
        }
    }

    /// Open a journal-backed log, replaying everything already committed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let (journal, records) = Journal::open(path).await?;
        let mut state = LogState::default();
        for (line, record) in records {
            state.replay(line, record)?;
        }
        info!(
            path = %journal.path().display(),
            entries = state.entries.len(),
            "transaction log opened"
        );
        state.journal = Some(journal);
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Start a serializable transaction.
    pub async fn begin(&self) -> LogTxn<'_> {
        LogTxn {
            state: self.state.lock().await,
            pending_entries: Vec::new(),
            pending_entitlements: Vec::new(),
        }
    }

    /// A page of the user's entries, most recent first, with the user's total
    /// entry count read under the same lock.
    pub async fn list_by_user(
        &self,
        user: &str,
        offset: usize,
        limit: usize,
    ) -> (Vec<LedgerEntry>, usize) {
        let state = self.state.lock().await;
        let total = state.by_user.get(user).map_or(0, Vec::len);
        let page = state
            .user_entries(user)
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub async fn count_by_user(&self, user: &str) -> usize {
        let state = self.state.lock().await;
        state.by_user.get(user).map_or(0, Vec::len)
    }

    pub async fn find_by_idempotency_key(&self, user: &str, key: &str) -> Option<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .key_index(user, key)
            .map(|idx| state.entries[idx].clone())
    }

    /// Sum of amounts per kind across all users, from the kind index.
    ///
    /// Totals are widened to `i128`: each balance fits in `i64`, a sum over
    /// many users need not.
    pub async fn totals_by_kind(&self) -> BTreeMap<EntryKind, i128> {
        let state = self.state.lock().await;
        state
            .by_kind
            .iter()
            .map(|(kind, idxs)| {
                let total = idxs
                    .iter()
                    .map(|&i| i128::from(state.entries[i].amount.get()))
                    .sum();
                (*kind, total)
            })
            .collect()
    }

    pub async fn entitlements(&self, user: &str) -> Vec<Entitlement> {
        let state = self.state.lock().await;
        state
            .entitlements
            .get(user)
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every user with at least one entry or entitlement, sorted.
    pub async fn users(&self) -> Vec<UserId> {
        let state = self.state.lock().await;
        let mut users: Vec<_> = state
            .by_user
            .keys()
            .chain(state.entitlements.keys())
            .cloned()
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

/// Exclusive, all-or-nothing unit of work over the log.
pub struct LogTxn<'a> {
    state: MutexGuard<'a, LogState>,
    pending_entries: Vec<LedgerEntry>,
    pending_entitlements: Vec<Entitlement>,
}

impl LogTxn<'_> {
    /// The user's entries in append order, staged writes included.
    pub fn entries_for<'s>(&'s self, user: &'s str) -> impl Iterator<Item = &'s LedgerEntry> + 's {
        self.state.user_entries(user).chain(
            self.pending_entries
                .iter()
                .filter(move |e| e.user_id == user),
        )
    }

    /// Current balance: the fold of the user's whole history.
    pub fn balance(&self, user: &str) -> Credits {
        balance::fold(self.entries_for(user))
    }

    pub fn find_by_idempotency_key(&self, user: &str, key: &str) -> Option<&LedgerEntry> {
        self.state
            .key_index(user, key)
            .map(|idx| &self.state.entries[idx])
            .or_else(|| {
                self.pending_entries
                    .iter()
                    .find(|e| e.user_id == user && e.idempotency_key == key)
            })
    }

    pub fn entry(&self, id: EntryId) -> Option<&LedgerEntry> {
        let committed = self.state.entries.len() as EntryId;
        if id == 0 {
            None
        } else if id <= committed {
            self.state.entries.get((id - 1) as usize)
        } else {
            self.pending_entries.get((id - committed - 1) as usize)
        }
    }

    /// Stage an entry. The only mutation path for credits.
    ///
    /// Assigns the next id and snapshots the balance the entry produces.
    pub fn append(&mut self, new: NewEntry) -> Result<LedgerEntry, DuplicateKey> {
        if let Some(existing) = self.find_by_idempotency_key(&new.user_id, &new.idempotency_key) {
            return Err(DuplicateKey {
                user_id: new.user_id,
                key: new.idempotency_key,
                existing: existing.id,
            });
        }

        let mut entry = LedgerEntry {
            id: self.state.next_id() + self.pending_entries.len() as EntryId,
            user_id: new.user_id,
            kind: new.kind,
            amount: new.amount,
            balance_after: Credits::ZERO,
            context: new.context,
            idempotency_key: new.idempotency_key,
            created_at: chrono::Utc::now(),
        };
        entry.balance_after = self.balance(&entry.user_id) + entry.signed_amount();

        debug!(id = entry.id, user = %entry.user_id, kind = entry.kind.as_str(), "entry staged");
        self.pending_entries.push(entry.clone());
        Ok(entry)
    }

    pub fn entitlement(&self, user: &str, unit: &str) -> Option<&Entitlement> {
        self.state
            .entitlements
            .get(user)
            .and_then(|units| units.get(unit))
            .or_else(|| {
                self.pending_entitlements
                    .iter()
                    .find(|e| e.user_id == user && e.content_unit_id == unit)
            })
    }

    /// Stage an entitlement. Returns `false` if the user already holds one
    /// for the unit.
    pub fn insert_entitlement(&mut self, entitlement: Entitlement) -> bool {
        if self
            .entitlement(&entitlement.user_id, &entitlement.content_unit_id)
            .is_some()
        {
            return false;
        }
        self.pending_entitlements.push(entitlement);
        true
    }

    /// Make every staged write durable and visible, or none of them.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if self.pending_entries.is_empty() && self.pending_entitlements.is_empty() {
            return Ok(());
        }
        if self.state.poisoned {
            return Err(StoreError::Unavailable(
                "an earlier journal write failed; reopen the log".to_string(),
            ));
        }

        let state = &mut *self.state;
        if let Some(journal) = state.journal.as_mut() {
            if let Err(e) = journal
                .append(&self.pending_entries, &self.pending_entitlements)
                .await
            {
                state.poisoned = true;
                return Err(e);
            }
        }

        for entry in self.pending_entries.drain(..) {
            state.insert_entry(entry);
        }
        for entitlement in self.pending_entitlements.drain(..) {
            state.insert_entitlement(entitlement);
        }
        Ok(())
    }
}
