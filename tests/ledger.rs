use std::sync::Arc;

use credit_ledger::balance;
use credit_ledger::catalog::{ContentUnit, StaticCatalog};
use credit_ledger::gate::default_bonus_tiers;
use credit_ledger::{
    AdjustDirection, Credits, EntitlementGate, EntryContext, EntryKind, GatePolicy, GrantKind,
    LedgerError, LedgerService, Page, TransactionLog, UnlockCoordinator,
};

// test utils

fn ledger() -> Arc<LedgerService> {
    Arc::new(LedgerService::new(Arc::new(TransactionLog::in_memory())))
}

fn coordinator(ledger: Arc<LedgerService>) -> Arc<UnlockCoordinator<StaticCatalog>> {
    let unit = |id: &str, position: u32, free: bool| ContentUnit {
        id: id.into(),
        position,
        free,
        policy: GatePolicy::per_unit(Credits::new(10)),
    };
    let catalog: StaticCatalog = [
        unit("ch1", 1, true),
        unit("ch2", 2, false),
        unit("ch3", 3, false),
    ]
    .into_iter()
    .collect();
    let gate = EntitlementGate::new(Arc::new(catalog), default_bonus_tiers());
    Arc::new(UnlockCoordinator::new(ledger, gate))
}

async fn grant(ledger: &LedgerService, user: &str, amount: i64, key: &str) {
    let outcome = ledger
        .grant(user, Credits::new(amount), GrantKind::Purchase, EntryContext::default(), key)
        .await
        .unwrap();
    assert!(outcome.committed, "grant {key} refused: {:?}", outcome.error);
}

async fn assert_balance_is_fold(ledger: &LedgerService, user: &str) {
    let history = ledger.history(user, Page::first(100)).await;
    assert_eq!(ledger.balance_of(user).await, balance::fold(&history.entries));
    assert!(ledger.audit(user).await.is_consistent());
}

// Scenario seeds

#[tokio::test]
async fn welcome_bonus_then_spend_and_replay() {
    let ledger = ledger();
    let welcome = ledger
        .grant("u1", Credits::new(50), GrantKind::Bonus, EntryContext::default(), "welcome_u1")
        .await
        .unwrap();
    assert_eq!(welcome.balance_after, Some(Credits::new(50)));
    assert_eq!(ledger.balance_of("u1").await, Credits::new(50));

    let spend = ledger
        .spend("u1", Credits::new(10), EntryContext::content("ch2"), "unlock_u1_ch2")
        .await
        .unwrap();
    assert!(spend.committed);
    assert_eq!(spend.balance_after, Some(Credits::new(40)));

    let replay = ledger
        .spend("u1", Credits::new(10), EntryContext::content("ch2"), "unlock_u1_ch2")
        .await
        .unwrap();
    assert_eq!(replay, spend);
    assert_eq!(ledger.balance_of("u1").await, Credits::new(40));
    assert_eq!(ledger.history("u1", Page::default()).await.entries.len(), 2);

    let overdraw = ledger
        .spend("u1", Credits::new(100), EntryContext::default(), "k2")
        .await
        .unwrap();
    assert!(!overdraw.committed);
    assert_eq!(
        overdraw.error,
        Some(LedgerError::InsufficientCredits {
            required: Credits::new(100),
            available: Credits::new(40),
        })
    );
    assert_eq!(ledger.balance_of("u1").await, Credits::new(40));
    assert_balance_is_fold(&ledger, "u1").await;
}

#[tokio::test]
async fn grant_replay_commits_once() {
    let ledger = ledger();
    let first = ledger
        .grant("u1", Credits::new(5), GrantKind::Promo, EntryContext::default(), "promo")
        .await
        .unwrap();
    let second = ledger
        .grant("u1", Credits::new(5), GrantKind::Promo, EntryContext::default(), "promo")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.balance_of("u1").await, Credits::new(5));
    assert_eq!(ledger.history("u1", Page::default()).await.entries.len(), 1);
}

#[tokio::test]
async fn free_unit_unlock_creates_entitlement_without_entry() {
    let ledger = ledger();
    let coordinator = coordinator(ledger.clone());

    let outcome = coordinator.unlock("u1", "ch1", "unlock_u1_ch1").await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.credits_charged, Credits::ZERO);
    assert!(coordinator.is_unlocked("u1", "ch1").await);
    assert!(ledger.history("u1", Page::default()).await.entries.is_empty());
    assert_eq!(ledger.balance_of("u1").await, Credits::ZERO);
}

#[tokio::test]
async fn admin_deduct_cannot_overdraw() {
    let ledger = ledger();
    grant(&ledger, "u2", 50, "seed").await;

    let outcome = ledger
        .admin_adjust("admin1", "u2", Credits::new(200), AdjustDirection::Deduct, "correction", "k3")
        .await
        .unwrap();
    assert!(!outcome.committed);
    assert!(matches!(
        outcome.error,
        Some(LedgerError::InsufficientCredits { .. })
    ));
    assert_eq!(ledger.balance_of("u2").await, Credits::new(50));
}

#[tokio::test]
async fn admin_adjust_records_acting_admin() {
    let ledger = ledger();
    grant(&ledger, "u2", 50, "seed").await;

    let outcome = ledger
        .admin_adjust("admin1", "u2", Credits::new(20), AdjustDirection::Deduct, "correction", "k4")
        .await
        .unwrap();
    assert!(outcome.committed);

    let history = ledger.history("u2", Page::first(1)).await;
    let entry = &history.entries[0];
    assert_eq!(entry.kind, EntryKind::AdminDeduct);
    assert_eq!(entry.context.admin_user_id.as_deref(), Some("admin1"));
    assert_eq!(entry.context.reason.as_deref(), Some("correction"));
    assert_eq!(ledger.balance_of("u2").await, Credits::new(30));
}

// Validation

#[tokio::test]
async fn non_positive_amounts_are_rejected_without_writes() {
    let ledger = ledger();
    for amount in [0, -5] {
        let outcome = ledger
            .grant("u1", Credits::new(amount), GrantKind::Bonus, EntryContext::default(), "g")
            .await
            .unwrap();
        assert_eq!(outcome.error, Some(LedgerError::InvalidAmount(Credits::new(amount))));

        let outcome = ledger
            .spend("u1", Credits::new(amount), EntryContext::default(), "s")
            .await
            .unwrap();
        assert!(!outcome.committed);
    }
    assert!(ledger.history("u1", Page::default()).await.entries.is_empty());
}

#[tokio::test]
async fn blank_idempotency_key_is_rejected() {
    let ledger = ledger();
    let outcome = ledger
        .grant("u1", Credits::new(5), GrantKind::Bonus, EntryContext::default(), "  ")
        .await
        .unwrap();
    assert!(matches!(
        outcome.error,
        Some(LedgerError::InvalidIdempotencyKey(_))
    ));
}

// Refunds

#[tokio::test]
async fn refund_reverses_a_consumption_once() {
    let ledger = ledger();
    grant(&ledger, "u1", 30, "seed").await;
    let spend = ledger
        .spend("u1", Credits::new(10), EntryContext::content("ch2"), "s1")
        .await
        .unwrap();
    let consumed = spend.entry_id.unwrap();

    let refund = ledger.refund("u1", consumed, "r1").await.unwrap();
    assert!(refund.committed);
    assert_eq!(refund.balance_after, Some(Credits::new(30)));

    // replay with the same key
    assert_eq!(ledger.refund("u1", consumed, "r1").await.unwrap(), refund);

    // a second refund under a new key
    let again = ledger.refund("u1", consumed, "r2").await.unwrap();
    assert_eq!(again.error, Some(LedgerError::AlreadyRefunded(consumed)));

    assert_eq!(ledger.balance_of("u1").await, Credits::new(30));
    assert_balance_is_fold(&ledger, "u1").await;
}

#[tokio::test]
async fn refund_rejects_foreign_and_credit_entries() {
    let ledger = ledger();
    grant(&ledger, "u1", 30, "seed").await;
    grant(&ledger, "u2", 30, "seed").await;
    let spend = ledger
        .spend("u2", Credits::new(10), EntryContext::default(), "s1")
        .await
        .unwrap();

    let foreign = ledger.refund("u1", spend.entry_id.unwrap(), "r").await.unwrap();
    assert!(matches!(foreign.error, Some(LedgerError::EntryNotFound(_))));

    let grant_entry = ledger.history("u1", Page::default()).await.entries[0].id;
    let credit = ledger.refund("u1", grant_entry, "r").await.unwrap();
    assert_eq!(credit.error, Some(LedgerError::NotRefundable(grant_entry)));
}

// History and reporting

#[tokio::test]
async fn history_pages_most_recent_first() {
    let ledger = ledger();
    for i in 0..5 {
        grant(&ledger, "u1", 1, &format!("g{i}")).await;
    }

    let first = ledger.history("u1", Page::first(2)).await;
    let ids: Vec<_> = first.entries.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![5, 4]);
    assert_eq!(first.next_offset, Some(2));

    let last = ledger
        .history("u1", Page { offset: 4, limit: Some(2) })
        .await;
    assert_eq!(last.entries.len(), 1);
    assert_eq!(last.next_offset, None);
}

#[tokio::test]
async fn totals_by_kind_cover_all_users() {
    let ledger = ledger();
    grant(&ledger, "u1", 30, "a").await;
    grant(&ledger, "u2", 20, "a").await;
    ledger
        .spend("u1", Credits::new(5), EntryContext::default(), "b")
        .await
        .unwrap();

    let totals = ledger.totals_by_kind().await;
    assert_eq!(totals[&EntryKind::Purchase], 50);
    assert_eq!(totals[&EntryKind::Consumption], 5);
}

#[tokio::test]
async fn totals_by_kind_near_the_credit_limit() {
    let ledger = ledger();
    grant(&ledger, "u1", i64::MAX, "a").await;
    grant(&ledger, "u2", 1, "a").await;

    // one more credit would overflow u1's balance
    let over = ledger
        .grant("u1", Credits::new(1), GrantKind::Purchase, EntryContext::default(), "b")
        .await
        .unwrap();
    assert!(!over.committed);

    let totals = ledger.totals_by_kind().await;
    assert_eq!(totals[&EntryKind::Purchase], i128::from(i64::MAX) + 1);
}

#[tokio::test]
async fn unlock_refuses_key_of_a_cheaper_spend() {
    let ledger = ledger();
    let coordinator = coordinator(ledger.clone());
    grant(&ledger, "u1", 50, "seed").await;
    ledger
        .spend("u1", Credits::new(1), EntryContext::content("ch2"), "K")
        .await
        .unwrap();

    let outcome = coordinator.unlock("u1", "ch2", "K").await.unwrap();
    assert!(!outcome.success);
    assert_eq!(
        outcome.error,
        Some(LedgerError::IdempotencyKeyConflict("K".into()))
    );
    assert!(!coordinator.is_unlocked("u1", "ch2").await);
    assert!(coordinator.entitlements("u1").await.is_empty());
    assert_eq!(ledger.balance_of("u1").await, Credits::new(49));
}

#[tokio::test]
async fn balance_matches_fold_across_mixed_history() {
    let ledger = ledger();
    grant(&ledger, "u1", 25, "seed").await;
    for i in 0..30 {
        let key = format!("op{i}");
        match i % 4 {
            0 => {
                ledger
                    .spend("u1", Credits::new(7), EntryContext::default(), &key)
                    .await
                    .unwrap();
            }
            1 => grant(&ledger, "u1", 3, &key).await,
            2 => {
                ledger
                    .admin_adjust("admin", "u1", Credits::new(4), AdjustDirection::Deduct, "", &key)
                    .await
                    .unwrap();
            }
            _ => {
                ledger
                    .admin_adjust("admin", "u1", Credits::new(2), AdjustDirection::Grant, "", &key)
                    .await
                    .unwrap();
            }
        }
        assert!(ledger.balance_of("u1").await >= Credits::ZERO);
        assert_balance_is_fold(&ledger, "u1").await;
    }
}

// Concurrency

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spends_with_different_keys_cannot_double_spend() {
    let ledger = ledger();
    grant(&ledger, "u3", 10, "seed").await;

    let a = tokio::spawn({
        let ledger = ledger.clone();
        async move {
            ledger
                .spend("u3", Credits::new(10), EntryContext::default(), "A")
                .await
                .unwrap()
        }
    });
    let b = tokio::spawn({
        let ledger = ledger.clone();
        async move {
            ledger
                .spend("u3", Credits::new(10), EntryContext::default(), "B")
                .await
                .unwrap()
        }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!([a.committed, b.committed].iter().filter(|c| **c).count(), 1);
    let loser = if a.committed { &b } else { &a };
    assert_eq!(
        loser.error,
        Some(LedgerError::InsufficientCredits {
            required: Credits::new(10),
            available: Credits::ZERO,
        })
    );
    assert_eq!(ledger.balance_of("u3").await, Credits::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_spends_never_overdraw() {
    let ledger = ledger();
    grant(&ledger, "u1", 20, "seed").await;

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .spend("u1", Credits::new(1), EntryContext::default(), &format!("s{i}"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        if handle.await.unwrap().committed {
            committed += 1;
        }
    }
    assert_eq!(committed, 20);
    assert_eq!(ledger.balance_of("u1").await, Credits::ZERO);
    assert_balance_is_fold(&ledger, "u1").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_retries_collapse_to_one_entry() {
    let ledger = ledger();
    grant(&ledger, "u1", 100, "seed").await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .spend("u1", Credits::new(10), EntryContext::content("ch2"), "retry")
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    assert!(outcomes.iter().all(|o| *o == outcomes[0]));
    assert!(outcomes[0].committed);
    assert_eq!(ledger.balance_of("u1").await, Credits::new(90));
    assert_eq!(ledger.history("u1", Page::default()).await.entries.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unlocks_keep_debits_and_entitlements_paired() {
    let ledger = ledger();
    let coordinator = coordinator(ledger.clone());
    grant(&ledger, "u1", 10, "seed").await;

    let unlock = |unit: &'static str, key: &'static str| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.unlock("u1", unit, key).await.unwrap() })
    };
    let (a, b) = (unlock("ch2", "ka"), unlock("ch3", "kb"));
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!([a.success, b.success].iter().filter(|s| **s).count(), 1);
    let failed = if a.success { &b } else { &a };
    assert!(matches!(
        failed.error,
        Some(LedgerError::InsufficientCredits { .. })
    ));

    let consumptions = ledger
        .history("u1", Page::default())
        .await
        .entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::Consumption)
        .count();
    assert_eq!(consumptions, 1);
    assert_eq!(coordinator.entitlements("u1").await.len(), 1);
    assert_eq!(ledger.balance_of("u1").await, Credits::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unlocks_of_one_unit_charge_once() {
    let ledger = ledger();
    let coordinator = coordinator(ledger.clone());
    grant(&ledger, "u1", 50, "seed").await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .unlock("u1", "ch2", &format!("unlock_{i}"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut charged = Credits::ZERO;
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(outcome.success);
        charged += outcome.credits_charged;
    }
    assert_eq!(charged, Credits::new(10));
    assert_eq!(ledger.balance_of("u1").await, Credits::new(40));
}

// Durability

#[tokio::test]
async fn idempotency_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");

    let first = {
        let ledger = LedgerService::new(Arc::new(TransactionLog::open(&path).await.unwrap()));
        grant(&ledger, "u1", 50, "welcome_u1").await;
        ledger
            .spend("u1", Credits::new(10), EntryContext::content("ch2"), "unlock_u1_ch2")
            .await
            .unwrap()
    };

    let ledger = LedgerService::new(Arc::new(TransactionLog::open(&path).await.unwrap()));
    let replay = ledger
        .spend("u1", Credits::new(10), EntryContext::content("ch2"), "unlock_u1_ch2")
        .await
        .unwrap();
    assert_eq!(replay, first);
    assert_eq!(ledger.balance_of("u1").await, Credits::new(40));
    assert_balance_is_fold(&ledger, "u1").await;
}

#[tokio::test]
async fn unlock_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");

    {
        let ledger = Arc::new(LedgerService::new(Arc::new(
            TransactionLog::open(&path).await.unwrap(),
        )));
        grant(&ledger, "u1", 10, "seed").await;
        let outcome = coordinator(ledger).unlock("u1", "ch2", "k").await.unwrap();
        assert!(outcome.success);
    }

    let ledger = Arc::new(LedgerService::new(Arc::new(
        TransactionLog::open(&path).await.unwrap(),
    )));
    let coordinator = coordinator(ledger.clone());
    assert!(coordinator.is_unlocked("u1", "ch2").await);
    let again = coordinator.unlock("u1", "ch2", "other").await.unwrap();
    assert!(again.already_unlocked);
    assert_eq!(ledger.balance_of("u1").await, Credits::ZERO);
}
