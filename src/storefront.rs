use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::{
    config::Config,
    error::{Result, StoreError},
    models::{Catalog, CatalogEntry, Entitlement, EntitlementChange, ProductKind, SubscriptionStatus},
    services::{
        EntitlementStore, FeedSubscription, FileKeyValueStore, KeyValueStore, PurchaseApi,
        PurchaseFeed, PurchaseOutcome, ReceiptReport, ReceiptValidator, ReconciliationEngine,
        RewardRedemption, SubscriptionExpiryTracker,
    },
    utils::{Clock, SystemClock},
};

/// Outcome of a user-initiated purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseResult {
    Completed(ReceiptReport),
    Cancelled,
    /// Awaiting approval; the entitlement arrives through the feed
    Pending,
}

/// Entry point for the presentation layer
#[derive(Clone)]
pub struct Storefront {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub store: Arc<EntitlementStore>,
    pub engine: Arc<ReconciliationEngine>,
    pub tracker: SubscriptionExpiryTracker,
    purchases: Arc<dyn PurchaseApi>,
}

impl Storefront {
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        purchases: Arc<dyn PurchaseApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let catalog = Arc::new(Catalog::new(config.catalog.products.clone())?);
        let store = Arc::new(EntitlementStore::new(
            kv,
            catalog.clone(),
            config.reconciliation.change_buffer,
        ));
        let validator = Arc::new(ReceiptValidator::new(&config.verification)?);
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            validator,
            catalog.clone(),
            clock.clone(),
        ));
        let tracker = SubscriptionExpiryTracker::new(store.clone(), clock);

        info!(products = catalog.products().len(), "Storefront initialized");

        Ok(Self {
            config: Arc::new(config),
            catalog,
            store,
            engine,
            tracker,
            purchases,
        })
    }

    /// File-backed storage at the configured path, wall-clock time
    pub fn open(config: Config, purchases: Arc<dyn PurchaseApi>) -> Result<Self> {
        let kv = Arc::new(FileKeyValueStore::open(&config.storage.path)?);
        Self::new(config, kv, purchases, Arc::new(SystemClock))
    }

    /// Catalog products alongside their current entitlement
    pub fn products(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog
            .products()
            .iter()
            .map(|product| {
                Ok(CatalogEntry {
                    product: product.clone(),
                    entitlement: self.store.get(&product.id)?,
                })
            })
            .collect()
    }

    pub fn entitlement(&self, product_id: &str) -> Result<Entitlement> {
        self.store.get(product_id)
    }

    /// Owned non-consumable, or any active subscription
    pub fn is_unlocked(&self, product_id: &str) -> Result<bool> {
        let product = self.catalog.require(product_id)?;
        match product.kind {
            ProductKind::NonConsumable => {
                Ok(self.store.get(product_id)?.owned() || self.tracker.any_active()?)
            }
            ProductKind::Subscription { .. } => self.tracker.is_entitled(product_id),
            ProductKind::Consumable { .. } => Ok(self.store.get(product_id)?.count() > 0),
        }
    }

    pub fn subscription_status(&self, product_id: &str) -> Result<SubscriptionStatus> {
        self.catalog.require(product_id)?;
        self.tracker.status(product_id)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<EntitlementChange> {
        self.store.subscribe()
    }

    #[instrument(skip(self))]
    pub async fn buy(&self, product_id: &str) -> Result<PurchaseResult> {
        self.catalog.require(product_id)?;

        match self.purchases.purchase(product_id).await? {
            PurchaseOutcome::Success(receipt) => {
                let report = self.engine.process_receipt(&receipt).await?;
                if let Some(reason) = &report.rejection {
                    return Err(StoreError::Authenticity(reason.clone()));
                }
                // No platform handle to finish here; the marker is already durable
                self.engine.finish(&report);
                info!(applied = report.applied().count(), "Purchase completed");
                Ok(PurchaseResult::Completed(report))
            }
            PurchaseOutcome::UserCancelled => {
                info!("Purchase cancelled by user");
                Ok(PurchaseResult::Cancelled)
            }
            PurchaseOutcome::Pending => {
                info!("Purchase pending approval");
                Ok(PurchaseResult::Pending)
            }
            PurchaseOutcome::Failed(reason) => {
                warn!(%reason, "Purchase failed");
                Err(StoreError::PurchaseFailed(reason))
            }
        }
    }

    /// Re-fetch past purchases from the platform. Already-applied transactions are skipped.
    #[instrument(skip(self))]
    pub async fn restore_purchases(&self) -> Result<Vec<ReceiptReport>> {
        let receipts = self.purchases.restore().await?;
        let mut reports = Vec::with_capacity(receipts.len());

        for receipt in &receipts {
            let report = self.engine.process_receipt(receipt).await?;
            self.engine.finish(&report);
            reports.push(report);
        }

        info!(receipts = reports.len(), "Purchases restored");
        Ok(reports)
    }

    pub async fn spend_consumable(&self, product_id: &str) -> Result<Entitlement> {
        self.engine.spend_consumable(product_id).await
    }

    pub async fn redeem_random_reward(&self, consumable_id: &str) -> Result<Option<RewardRedemption>> {
        self.engine.redeem_random_reward(consumable_id).await
    }

    /// Start consuming the purchase-update feed
    pub fn start_feed(&self, feed: &dyn PurchaseFeed) -> FeedSubscription {
        FeedSubscription::spawn(self.engine.clone(), feed, &self.config.reconciliation)
    }
}
