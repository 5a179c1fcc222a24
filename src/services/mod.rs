// Service modules
pub mod classifier;
pub mod entitlement_store;
pub mod expiry_tracker;
pub mod feed;
pub mod kv_store;
pub mod purchase;
pub mod receipt_validator;
pub mod reconciliation;

pub use classifier::TransactionClassifier;
pub use entitlement_store::{EntitlementStore, EntitlementWrite};
pub use expiry_tracker::SubscriptionExpiryTracker;
pub use feed::FeedSubscription;
pub use kv_store::{FileKeyValueStore, KeyValueStore, KvValue, MemoryKeyValueStore, WriteBatch};
pub use purchase::{Acknowledger, FeedItem, PurchaseApi, PurchaseFeed, PurchaseOutcome};
pub use receipt_validator::{ReceiptValidator, TrustAnchor};
pub use reconciliation::{
    ReceiptReport, ReconcileOutcome, ReconciliationEngine, RewardRedemption, TransactionReport,
    TransactionState,
};
