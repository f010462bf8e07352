//! Ledger operations.
//!
//! Grants, spends, administrative adjustments and refunds, each resolved
//! against the transaction log inside one serializable transaction:
//! idempotency lookup, balance fold and append never interleave with another
//! writer. Expected conditions come back as outcomes; only store failures are
//! returned as `Err`.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::Credits;
use crate::balance::AuditReport;
use crate::config::LedgerSettings;
use crate::idempotency::IdempotencyResolver;
use crate::model::{
    AdjustDirection, Direction, EntryContext, EntryId, EntryKind, GrantKind, HistoryPage,
    NewEntry, Page, TransactionOutcome,
};
use crate::store::{LogTxn, StoreError, TransactionLog};

mod state;
pub use state::AccountSummary;

mod error;
pub use error::{ErrorClass, LedgerError};

/// Bounds applied to history pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_size: usize,
    pub max_size: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_size: 20,
            max_size: 100,
        }
    }
}

/// The public ledger surface.
#[derive(Debug)]
pub struct LedgerService {
    log: Arc<TransactionLog>,
    resolver: IdempotencyResolver,
    limits: PageLimits,
}

/// Public API
impl LedgerService {
    pub fn new(log: Arc<TransactionLog>) -> Self {
        Self {
            log,
            resolver: IdempotencyResolver::default(),
            limits: PageLimits::default(),
        }
    }

    pub fn from_settings(log: Arc<TransactionLog>, settings: &LedgerSettings) -> Self {
        Self {
            log,
            resolver: IdempotencyResolver::new(settings.max_idempotency_key_len),
            limits: PageLimits {
                default_size: settings.default_page_size,
                max_size: settings.max_page_size,
            },
        }
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    /// Add credits to a user's balance.
    pub async fn grant(
        &self,
        user: &str,
        amount: Credits,
        kind: GrantKind,
        context: EntryContext,
        key: &str,
    ) -> Result<TransactionOutcome, StoreError> {
        let outcome = match self.prepare(user, kind.into(), amount, context, key) {
            Ok(request) => self.execute(request).await?,
            Err(e) => TransactionOutcome::refused(e, None),
        };
        Self::log_outcome("grant", user, amount, &outcome);
        Ok(outcome)
    }

    /// Debit credits, refusing if the balance does not cover `amount`.
    pub async fn spend(
        &self,
        user: &str,
        amount: Credits,
        context: EntryContext,
        key: &str,
    ) -> Result<TransactionOutcome, StoreError> {
        let outcome = match self.prepare(user, EntryKind::Consumption, amount, context, key) {
            Ok(request) => self.execute(request).await?,
            Err(e) => TransactionOutcome::refused(e, None),
        };
        Self::log_outcome("spend", user, amount, &outcome);
        Ok(outcome)
    }

    /// Administrative grant or deduction, recorded with the acting admin.
    ///
    /// A deduction never drives the balance below zero.
    pub async fn admin_adjust(
        &self,
        admin: &str,
        user: &str,
        amount: Credits,
        direction: AdjustDirection,
        reason: &str,
        key: &str,
    ) -> Result<TransactionOutcome, StoreError> {
        let mut context = EntryContext {
            admin_user_id: Some(admin.to_string()),
            ..EntryContext::default()
        };
        if !reason.trim().is_empty() {
            context.reason = Some(reason.trim().to_string());
        }

        let outcome = match self.prepare(user, direction.entry_kind(), amount, context, key) {
            Ok(request) => self.execute(request).await?,
            Err(e) => TransactionOutcome::refused(e, None),
        };
        info!(admin = %admin, direction = ?direction, "admin adjustment requested");
        Self::log_outcome("admin adjust", user, amount, &outcome);
        Ok(outcome)
    }

    /// Credit back one of the user's consumptions, at most once.
    pub async fn refund(
        &self,
        user: &str,
        entry_id: EntryId,
        key: &str,
    ) -> Result<TransactionOutcome, StoreError> {
        let key = match self.resolver.validate(key) {
            Ok(key) => key,
            Err(e) => {
                let outcome = TransactionOutcome::refused(e, None);
                Self::log_outcome("refund", user, Credits::ZERO, &outcome);
                return Ok(outcome);
            }
        };

        let mut txn = self.log.begin().await;
        let (outcome, amount) = self.refund_in(&mut txn, user, entry_id, key);
        txn.commit().await?;

        Self::log_outcome("refund", user, amount, &outcome);
        Ok(outcome)
    }

    pub async fn balance_of(&self, user: &str) -> Credits {
        self.log.begin().await.balance(user)
    }

    /// A page of the user's history, most recent first.
    pub async fn history(&self, user: &str, page: Page) -> HistoryPage {
        let limit = page
            .limit
            .unwrap_or(self.limits.default_size)
            .clamp(1, self.limits.max_size);
        let (entries, total) = self.log.list_by_user(user, page.offset, limit).await;
        let end = page.offset + entries.len();
        HistoryPage {
            next_offset: (end < total).then_some(end),
            entries,
        }
    }

    /// Sum of amounts per kind across all users.
    pub async fn totals_by_kind(&self) -> BTreeMap<EntryKind, i128> {
        self.log.totals_by_kind().await
    }

    /// Re-fold the user's history and check every stored snapshot.
    pub async fn audit(&self, user: &str) -> AuditReport {
        let txn = self.log.begin().await;
        let entries: Vec<_> = txn.entries_for(user).collect();
        AuditReport::from_entries(&entries)
    }

    /// One summary per known user, sorted by user id.
    pub async fn accounts(&self) -> Vec<AccountSummary> {
        let mut summaries = Vec::new();
        for user in self.log.users().await {
            summaries.push(AccountSummary {
                balance: self.balance_of(&user).await,
                entries: self.log.count_by_user(&user).await,
                entitlements: self.log.entitlements(&user).await.len(),
                user,
            });
        }
        summaries
    }
}

/// Crate API, for composing ledger writes into a caller's transaction
impl LedgerService {
    /// Validate and build an append request.
    pub(crate) fn prepare(
        &self,
        user: &str,
        kind: EntryKind,
        amount: Credits,
        context: EntryContext,
        key: &str,
    ) -> Result<NewEntry, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(NewEntry {
            user_id: user.to_string(),
            kind,
            amount,
            context,
            idempotency_key: self.resolver.validate(key)?,
        })
    }

    /// Post an entry inside `txn`:
    /// - Replay the committed outcome if the key was already used
    /// - Fold the current balance
    /// - Refuse a debit the balance does not cover
    /// - Stage the entry
    pub(crate) fn post(&self, txn: &mut LogTxn<'_>, request: NewEntry) -> TransactionOutcome {
        if let Some(outcome) = self.resolver.replay(txn, &request) {
            return outcome;
        }

        let balance = txn.balance(&request.user_id);
        let after = match request.kind.direction() {
            Direction::Credit => balance.checked_add(request.amount),
            Direction::Debit => balance
                .checked_sub(request.amount)
                .filter(|after| *after >= Credits::ZERO),
        };
        if after.is_none() {
            let error = match request.kind.direction() {
                Direction::Debit => LedgerError::InsufficientCredits {
                    required: request.amount,
                    available: balance,
                },
                Direction::Credit => LedgerError::InvalidAmount(request.amount),
            };
            return TransactionOutcome::refused(error, Some(balance));
        }

        match txn.append(request.clone()) {
            Ok(entry) => TransactionOutcome::committed(&entry),
            Err(duplicate) => self
                .resolver
                .resolve_duplicate(txn, &duplicate, &request)
                .unwrap_or_else(|| {
                    TransactionOutcome::refused(
                        LedgerError::IdempotencyKeyConflict(request.idempotency_key.clone()),
                        Some(balance),
                    )
                }),
        }
    }
}

/// Private API
impl LedgerService {
    /// Run one request in its own transaction.
    async fn execute(&self, request: NewEntry) -> Result<TransactionOutcome, StoreError> {
        let mut txn = self.log.begin().await;
        let outcome = self.post(&mut txn, request);
        txn.commit().await?;
        Ok(outcome)
    }

    /// Refund inside `txn`:
    /// - Find the user's entry (ids of other users read as not found)
    /// - Check it is a consumption
    /// - Replay if the key was already used
    /// - Refuse if the consumption was already refunded
    fn refund_in(
        &self,
        txn: &mut LogTxn<'_>,
        user: &str,
        entry_id: EntryId,
        key: String,
    ) -> (TransactionOutcome, Credits) {
        let consumed = match txn.entry(entry_id) {
            Some(entry) if entry.user_id == user => entry.clone(),
            _ => {
                let error = LedgerError::EntryNotFound(entry_id);
                return (TransactionOutcome::refused(error, None), Credits::ZERO);
            }
        };
        if consumed.kind != EntryKind::Consumption {
            let error = LedgerError::NotRefundable(entry_id);
            return (TransactionOutcome::refused(error, None), consumed.amount);
        }

        let request = NewEntry {
            user_id: user.to_string(),
            kind: EntryKind::Refund,
            amount: consumed.amount,
            context: EntryContext {
                content_unit_id: consumed.context.content_unit_id.clone(),
                refund_of: Some(entry_id),
                ..EntryContext::default()
            },
            idempotency_key: key,
        };
        if let Some(outcome) = self.resolver.replay(txn, &request) {
            return (outcome, consumed.amount);
        }

        let already = txn
            .entries_for(user)
            .any(|e| e.kind == EntryKind::Refund && e.context.refund_of == Some(entry_id));
        if already {
            let error = LedgerError::AlreadyRefunded(entry_id);
            let balance = txn.balance(user);
            return (TransactionOutcome::refused(error, Some(balance)), consumed.amount);
        }

        (self.post(txn, request), consumed.amount)
    }

    /// Small helper to log operation outcomes
    fn log_outcome(op: &str, user: &str, amount: Credits, outcome: &TransactionOutcome) {
        match (&outcome.error, outcome.entry_id) {
            (None, Some(entry)) => {
                info!(
                    user = %user,
                    amount = %amount,
                    entry = entry,
                    balance = ?outcome.balance_after,
                    "{op} committed"
                );
            }
            (None, None) => {
                info!(user = %user, amount = %amount, "{op} made no change");
            }
            (Some(e), _) => {
                info!(
                    user = %user,
                    amount = %amount,
                    reason = %e,
                    "{op} refused"
                );
            }
        }
    }
}

impl Default for LedgerService {
    fn default() -> Self {
        Self::new(Arc::new(TransactionLog::in_memory()))
    }
}
