/// Purchase-update feed: acknowledge only after the change is durable
use crate::support::*;
use owlstore::services::TransactionState;
use std::sync::Arc;

#[tokio::test]
async fn item_is_acknowledged_after_entitlement_persists() {
    let h = harness();
    let feed = MemoryFeed::new();
    let mut changes = h.storefront.subscribe_changes();
    feed.push(signed_receipt(vec![entry("100", NIGHT_OWL)]));

    let session = h.storefront.start_feed(&feed);
    eventually(|| feed.ack_count() == 1).await;

    assert!(h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
    assert!(h.storefront.store.is_applied("100").unwrap());
    assert_eq!(feed.pending_count(), 0);
    assert_eq!(
        h.storefront.engine.state("100").unwrap(),
        Some(TransactionState::Applied)
    );
    eventually(|| h.storefront.engine.in_flight() == 0).await;

    let change = changes.recv().await.unwrap();
    assert_eq!(change.transaction_id.as_deref(), Some("100"));
    assert!(change.entitlement.owned());

    session.cancel().await;
}

#[tokio::test]
async fn items_pushed_while_running_are_processed() {
    let h = harness();
    let feed = MemoryFeed::new();
    let session = h.storefront.start_feed(&feed);

    feed.push(signed_receipt(vec![entry("110", RANDOM_OWLS)]));
    feed.push(signed_receipt(vec![entry("111", RANDOM_OWLS)]));
    eventually(|| feed.ack_count() == 2).await;

    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 6);
    session.cancel().await;
}

#[tokio::test]
async fn crash_between_commit_and_ack_replays_once() {
    let h = harness();
    let feed = MemoryFeed::new();
    let receipt = signed_receipt(vec![entry("120", RANDOM_OWLS)]);
    feed.push(receipt.clone());

    // Committed, then the process died before finishing the item
    h.storefront.engine.process_receipt(&receipt).await.unwrap();
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 3);
    assert_eq!(feed.ack_count(), 0);

    let session = h.storefront.start_feed(&feed);
    eventually(|| feed.ack_count() == 1).await;

    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 3);
    assert_eq!(feed.pending_count(), 0);
    session.cancel().await;
}

#[tokio::test]
async fn invalid_receipt_is_acknowledged_without_mutation() {
    let h = harness();
    let feed = MemoryFeed::new();
    feed.push(forged_receipt(vec![entry("130", NIGHT_OWL)]));
    feed.push(signed_receipt(vec![entry("131", "com.example.deleted_item")]));

    let session = h.storefront.start_feed(&feed);
    eventually(|| feed.ack_count() == 2).await;

    assert!(!h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
    assert!(!h.storefront.store.is_applied("130").unwrap());
    session.cancel().await;
}

#[tokio::test]
async fn transient_storage_failure_is_retried() {
    let h = harness_with(Arc::new(FailingKeyValueStore::new(2)));
    let feed = MemoryFeed::new();
    feed.push(signed_receipt(vec![entry("140", RANDOM_OWLS)]));

    let session = h.storefront.start_feed(&feed);
    eventually(|| feed.ack_count() == 1).await;

    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 3);
    session.cancel().await;
}

#[tokio::test]
async fn exhausted_retries_leave_item_for_next_session() {
    let h = harness_with(Arc::new(FailingKeyValueStore::new(3)));
    let feed = MemoryFeed::new();
    feed.push(signed_receipt(vec![entry("150", RANDOM_OWLS)]));

    let session = h.storefront.start_feed(&feed);
    eventually(|| {
        h.storefront.engine.state("150").unwrap() == Some(TransactionState::Pending)
    })
    .await;
    feed.close();
    eventually(|| session.is_finished()).await;

    assert_eq!(feed.ack_count(), 0);
    assert_eq!(feed.pending_count(), 1);
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 0);
    session.cancel().await;

    // Storage recovered; the next session picks the item up
    let session = h.storefront.start_feed(&feed);
    eventually(|| feed.ack_count() == 1).await;
    assert_eq!(h.storefront.entitlement(RANDOM_OWLS).unwrap().count(), 3);
    session.cancel().await;
}

#[tokio::test]
async fn cancel_stops_the_session() {
    let h = harness();
    let feed = MemoryFeed::new();
    let session = h.storefront.start_feed(&feed);

    session.cancel().await;
    feed.push(signed_receipt(vec![entry("160", NIGHT_OWL)]));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(feed.ack_count(), 0);
    assert_eq!(feed.pending_count(), 1);
    assert!(!h.storefront.entitlement(NIGHT_OWL).unwrap().owned());
}

#[tokio::test]
async fn dropping_the_subscription_stops_the_task() {
    let h = harness();
    let feed = MemoryFeed::new();
    let session = h.storefront.start_feed(&feed);
    let session_id = session.session_id();
    drop(session);

    feed.push(signed_receipt(vec![entry("170", NIGHT_OWL)]));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(!session_id.is_nil());
    assert_eq!(feed.ack_count(), 0);
}
