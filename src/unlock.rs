//! Paid and free unlocks of content units.
//!
//! A paid unlock stages the consumption entry and the entitlement in one log
//! transaction, so the store never holds a debit without its entitlement or
//! an entitlement without its debit.

use std::sync::Arc;
use tracing::info;

use crate::Credits;
use crate::catalog::Catalog;
use crate::gate::EntitlementGate;
use crate::ledger::{LedgerError, LedgerService};
use crate::model::{
    BonusOutcome, Entitlement, EntryContext, EntryKind, GrantKind, TransactionOutcome,
    UnlockOutcome,
};
use crate::store::{LogTxn, StoreError};

pub struct UnlockCoordinator<C> {
    ledger: Arc<LedgerService>,
    gate: EntitlementGate<C>,
}

impl<C: Catalog> UnlockCoordinator<C> {
    pub fn new(ledger: Arc<LedgerService>, gate: EntitlementGate<C>) -> Self {
        Self { ledger, gate }
    }

    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    /// Unlock `unit` for `user`, charging the gate's price if there is one.
    ///
    /// Re-unlocking an owned unit succeeds without touching the ledger,
    /// whatever key is supplied.
    pub async fn unlock(
        &self,
        user: &str,
        unit: &str,
        key: &str,
    ) -> Result<UnlockOutcome, StoreError> {
        let mut txn = self.ledger.log().begin().await;
        let outcome = self.unlock_in(&mut txn, user, unit, key);
        if outcome.success {
            txn.commit().await?;
        }

        match &outcome.error {
            None => info!(
                user = %user,
                unit = %unit,
                charged = %outcome.credits_charged,
                already_unlocked = outcome.already_unlocked,
                balance = ?outcome.balance_after,
                "unlock succeeded"
            ),
            Some(e) => info!(user = %user, unit = %unit, reason = %e, "unlock refused"),
        }
        Ok(outcome)
    }

    pub async fn is_unlocked(&self, user: &str, unit: &str) -> bool {
        self.ledger.log().begin().await.entitlement(user, unit).is_some()
    }

    pub async fn entitlements(&self, user: &str) -> Vec<Entitlement> {
        self.ledger.log().entitlements(user).await
    }

    /// Grant the engagement bonus earned on `unit`, if any tier was reached.
    pub async fn claim_engagement_bonus(
        &self,
        user: &str,
        unit: &str,
        engagement_seconds: u64,
        key: &str,
    ) -> Result<BonusOutcome, StoreError> {
        let eligibility = match self.gate.bonus_eligibility_for(unit, engagement_seconds) {
            Ok(eligibility) => eligibility,
            Err(e) => {
                return Ok(BonusOutcome {
                    eligible: false,
                    bonus_credits: Credits::ZERO,
                    transaction: Some(TransactionOutcome::refused(e, None)),
                });
            }
        };
        if !eligibility.eligible {
            info!(user = %user, unit = %unit, engagement_seconds, "no bonus tier reached");
            return Ok(BonusOutcome {
                eligible: false,
                bonus_credits: Credits::ZERO,
                transaction: None,
            });
        }

        let outcome = self
            .ledger
            .grant(
                user,
                eligibility.bonus_credits,
                GrantKind::Bonus,
                EntryContext::content(unit).with_reason("engagement bonus"),
                key,
            )
            .await?;
        Ok(BonusOutcome {
            eligible: true,
            bonus_credits: eligibility.bonus_credits,
            transaction: Some(outcome),
        })
    }

    /// Unlock inside `txn`:
    /// - Short-circuit if the entitlement exists
    /// - Price the unit
    /// - Free: stage the entitlement alone
    /// - Paid: stage the consumption, then the entitlement pointing at it
    ///
    /// Nothing is staged when the outcome is a failure.
    fn unlock_in(&self, txn: &mut LogTxn<'_>, user: &str, unit: &str, key: &str) -> UnlockOutcome {
        if txn.entitlement(user, unit).is_some() {
            return UnlockOutcome::already_unlocked(txn.balance(user));
        }

        let decision = match self.gate.quote(user, unit) {
            Ok(decision) => decision,
            Err(e) => return UnlockOutcome::failed(e, None),
        };

        if !decision.must_pay {
            txn.insert_entitlement(Entitlement {
                user_id: user.to_string(),
                content_unit_id: unit.to_string(),
                credits_charged: Credits::ZERO,
                entry_id: None,
                created_at: chrono::Utc::now(),
            });
            return UnlockOutcome::unlocked(Credits::ZERO, txn.balance(user), None);
        }

        let request = match self.ledger.prepare(
            user,
            EntryKind::Consumption,
            decision.credits_required,
            EntryContext::content(unit),
            key,
        ) {
            Ok(request) => request,
            Err(e) => return UnlockOutcome::failed(e, None),
        };

        // A key already spent on anything but this unit at this price must not
        // mint the entitlement.
        if let Some(existing) = txn.find_by_idempotency_key(user, &request.idempotency_key) {
            let same_unlock = existing.kind == EntryKind::Consumption
                && existing.context.content_unit_id.as_deref() == Some(unit)
                && existing.amount == decision.credits_required;
            if !same_unlock {
                let error = LedgerError::IdempotencyKeyConflict(request.idempotency_key);
                return UnlockOutcome::failed(error, Some(txn.balance(user)));
            }
        }

        let spend = self.ledger.post(txn, request);
        let staged = spend.entry_id.and_then(|id| txn.entry(id)).cloned();
        let entry = match (spend.error, staged) {
            (None, Some(entry)) => entry,
            (Some(error), _) => return UnlockOutcome::failed(error, spend.balance_after),
            (None, None) => {
                let error = LedgerError::EntryNotFound(spend.entry_id.unwrap_or_default());
                return UnlockOutcome::failed(error, spend.balance_after);
            }
        };

        txn.insert_entitlement(Entitlement {
            user_id: user.to_string(),
            content_unit_id: unit.to_string(),
            credits_charged: entry.amount,
            entry_id: Some(entry.id),
            created_at: chrono::Utc::now(),
        });
        UnlockOutcome::unlocked(entry.amount, txn.balance(user), Some(entry.id))
    }
}
