/// Reconciliation engine behavior against an in-memory store
use crate::support::*;
use owlstore::{
    error::StoreError,
    services::{ReconcileOutcome, TransactionState},
};
use time::Duration;

#[tokio::test]
async fn consumable_purchase_credits_once_per_transaction() {
    let h = harness();
    let engine = &h.storefront.engine;

    engine
        .process_receipt(&signed_receipt(vec![entry("1", RANDOM_OWLS)]))
        .await
        .unwrap();
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 3);

    engine
        .process_receipt(&signed_receipt(vec![entry("2", RANDOM_OWLS)]))
        .await
        .unwrap();
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 6);

    // Redelivery of transaction 2
    let report = engine
        .process_receipt(&signed_receipt(vec![entry("2", RANDOM_OWLS)]))
        .await
        .unwrap();
    assert_eq!(report.transactions[0].outcome, ReconcileOutcome::AlreadyApplied);
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 6);
}

#[tokio::test]
async fn non_consumable_is_idempotent_across_restores() {
    let h = harness();
    let engine = &h.storefront.engine;

    engine.reconcile(validated("10", NIGHT_OWL)).await.unwrap();
    engine.reconcile(validated("10", NIGHT_OWL)).await.unwrap();
    engine
        .process_receipt(&signed_receipt(vec![derived_entry("11", "10", NIGHT_OWL)]))
        .await
        .unwrap();

    assert!(h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
    assert!(!h.storefront.entitlement(SNOW_OWL).unwrap().owned());
}

#[tokio::test]
async fn restored_consumable_grants_nothing() {
    let h = harness();
    h.storefront.store.set_count(RANDOM_OWLS, 2).unwrap();

    let report = h
        .storefront
        .engine
        .process_receipt(&signed_receipt(vec![derived_entry("21", "20", RANDOM_OWLS)]))
        .await
        .unwrap();

    assert!(matches!(
        report.transactions[0].outcome,
        ReconcileOutcome::Applied(ref e) if e.count() == 2
    ));
    assert!(h.storefront.store.is_applied("21").unwrap());
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 2);
}

#[tokio::test]
async fn subscription_extends_from_current_expiry() {
    let h = harness();
    h.storefront
        .store
        .set_expires_at(OWL_CLUB, now() + Duration::days(10))
        .unwrap();

    h.storefront
        .engine
        .reconcile(validated("30", OWL_CLUB))
        .await
        .unwrap();

    assert_eq!(
        h.storefront.entitlement(OWL_CLUB).unwrap().expires_at(),
        Some(now() + Duration::days(40))
    );

    // Redelivered renewal leaves expiry alone
    h.storefront
        .engine
        .reconcile(validated("30", OWL_CLUB))
        .await
        .unwrap();
    assert_eq!(
        h.storefront.entitlement(OWL_CLUB).unwrap().expires_at(),
        Some(now() + Duration::days(40))
    );
}

#[tokio::test]
async fn lapsed_subscription_extends_from_now() {
    let h = harness();
    h.storefront
        .store
        .set_expires_at(OWL_CLUB, now() - Duration::days(3))
        .unwrap();

    h.storefront
        .engine
        .reconcile(validated("31", OWL_CLUB))
        .await
        .unwrap();

    assert_eq!(
        h.storefront.entitlement(OWL_CLUB).unwrap().expires_at(),
        Some(now() + Duration::days(30))
    );
    assert_eq!(h.storefront.tracker.days_remaining(OWL_CLUB).unwrap(), 30);
}

#[tokio::test]
async fn unsigned_transaction_never_mutates() {
    let h = harness();
    let mut transaction = validated("40", NIGHT_OWL);
    transaction.signature_valid = false;

    let report = h.storefront.engine.reconcile(transaction).await.unwrap();

    assert!(matches!(report.outcome, ReconcileOutcome::Rejected(_)));
    assert!(!h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
    assert!(!h.storefront.store.is_applied("40").unwrap());
    assert_eq!(
        h.storefront.engine.state("40").unwrap(),
        Some(TransactionState::Rejected)
    );
}

#[tokio::test]
async fn finished_transactions_leave_the_state_map() {
    let h = harness();
    let engine = &h.storefront.engine;
    let mut entries: Vec<_> = (0..50)
        .map(|i| entry(&format!("5{:02}", i), RANDOM_OWLS))
        .collect();
    entries.push(entry("599", "owls.Phoenix"));

    let report = engine
        .process_receipt(&signed_receipt(entries))
        .await
        .unwrap();
    assert_eq!(engine.in_flight(), 51);

    engine.finish(&report);

    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.state("500").unwrap(), Some(TransactionState::Applied));
    assert_eq!(engine.state("549").unwrap(), Some(TransactionState::Applied));
    assert_eq!(engine.state("599").unwrap(), None);
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 150);

    // Redelivery after finishing is still deduplicated by the marker
    let replay = engine
        .process_receipt(&signed_receipt(vec![entry("500", RANDOM_OWLS)]))
        .await
        .unwrap();
    assert_eq!(replay.transactions[0].outcome, ReconcileOutcome::AlreadyApplied);
    engine.finish(&replay);
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 150);
}

#[tokio::test]
async fn forged_receipt_is_rejected_without_error() {
    let h = harness();

    let report = h
        .storefront
        .engine
        .process_receipt(&forged_receipt(vec![entry("41", NIGHT_OWL)]))
        .await
        .unwrap();

    assert!(report.is_rejected());
    assert!(report.transactions.is_empty());
    assert!(!h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
}

#[tokio::test]
async fn unknown_product_is_dropped() {
    let h = harness();

    let report = h
        .storefront
        .engine
        .reconcile(validated("50", "com.example.deleted_item"))
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        ReconcileOutcome::Dropped("com.example.deleted_item".to_string())
    );
    assert!(!h.storefront.store.is_applied("50").unwrap());
    assert!(h
        .storefront
        .entitlement("com.example.deleted_item")
        .is_err());
}

#[tokio::test]
async fn spend_at_zero_fails_without_mutation() {
    let h = harness();

    let result = h.storefront.spend_consumable(RANDOM_OWLS).await;

    assert!(matches!(
        result,
        Err(StoreError::InsufficientBalance { ref product_id }) if product_id == RANDOM_OWLS
    ));
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 0);
}

#[tokio::test]
async fn spending_a_non_consumable_is_refused() {
    let h = harness();
    let result = h.storefront.spend_consumable(NIGHT_OWL).await;
    assert!(matches!(result, Err(StoreError::NotConsumable(_))));
}

#[tokio::test]
async fn concurrent_spends_never_overdraw() {
    let h = harness();
    h.storefront.store.set_count(RANDOM_OWLS, 5).unwrap();

    let spends = (0..10).map(|_| h.storefront.spend_consumable(RANDOM_OWLS));
    let results = futures::future::join_all(spends).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(StoreError::InsufficientBalance { .. })))
        .count();

    assert_eq!(succeeded, 5);
    assert_eq!(refused, 5);
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 0);
}

#[tokio::test]
async fn concurrent_spend_and_credit_stay_consistent() {
    let h = harness();
    h.storefront.store.set_count(RANDOM_OWLS, 1).unwrap();

    let engine = h.storefront.engine.clone();
    let credit = tokio::spawn(async move { engine.reconcile(validated("60", RANDOM_OWLS)).await });
    let spends = futures::future::join_all((0..3).map(|_| h.storefront.spend_consumable(RANDOM_OWLS))).await;
    credit.await.unwrap().unwrap();

    let spent = spends.iter().filter(|r| r.is_ok()).count() as u32;
    assert!(spent >= 1);
    assert_eq!(
        h.storefront.entitlement(RANDOM_OWLS).unwrap().count(),
        1 + 3 - spent
    );
}

#[tokio::test]
async fn failed_commit_leaves_transaction_pending() {
    let h = harness_with(std::sync::Arc::new(FailingKeyValueStore::new(1)));

    let result = h.storefront.engine.reconcile(validated("70", NIGHT_OWL)).await;

    assert!(matches!(result, Err(StoreError::Persistence(_))));
    assert_eq!(
        h.storefront.engine.state("70").unwrap(),
        Some(TransactionState::Pending)
    );
    assert!(!h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
    assert!(!h.storefront.store.is_applied("70").unwrap());

    // Second delivery succeeds
    h.storefront.engine.reconcile(validated("70", NIGHT_OWL)).await.unwrap();
    assert!(h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
}
