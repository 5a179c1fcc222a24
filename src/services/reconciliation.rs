use rand::seq::SliceRandom;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Result, StoreError},
    models::{
        Catalog, ClassifiedTransaction, Entitlement, ProductKind, RawReceipt, TransactionKind,
        ValidatedTransaction,
    },
    services::{
        classifier::TransactionClassifier,
        entitlement_store::{EntitlementStore, EntitlementWrite},
        receipt_validator::ReceiptValidator,
    },
    utils::Clock,
};

/// Lifecycle of one transaction id within this session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    /// Mutation in progress or committed, not yet finished on the feed
    Applying,
    Applied,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Mutation committed by this call
    Applied(Entitlement),
    /// Marker already present; acknowledge only
    AlreadyApplied,
    /// Product missing from the catalog; acknowledged and dropped
    Dropped(String),
    /// Failed the authenticity gate; acknowledged, never applied
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    pub transaction_id: String,
    pub product_id: String,
    pub outcome: ReconcileOutcome,
}

/// Result of processing one receipt. Safe to acknowledge once returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptReport {
    pub transactions: Vec<TransactionReport>,
    /// Why the whole receipt was refused, if it was
    pub rejection: Option<String>,
}

impl ReceiptReport {
    fn rejected(reason: String) -> Self {
        Self {
            transactions: Vec::new(),
            rejection: Some(reason),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    pub fn applied(&self) -> impl Iterator<Item = &Entitlement> {
        self.transactions.iter().filter_map(|t| match &t.outcome {
            ReconcileOutcome::Applied(entitlement) => Some(entitlement),
            _ => None,
        })
    }
}

/// Consumable spent on a random unowned non-consumable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardRedemption {
    pub reward: Entitlement,
    pub balance: Entitlement,
}

/// Applies authenticated transactions to the entitlement store exactly once
pub struct ReconciliationEngine {
    store: Arc<EntitlementStore>,
    validator: Arc<ReceiptValidator>,
    classifier: TransactionClassifier,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, TransactionState>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<EntitlementStore>,
        validator: Arc<ReceiptValidator>,
        catalog: Arc<Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            validator,
            classifier: TransactionClassifier::new(catalog),
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a transaction. Finished transactions leave the
    /// in-memory map and are answered from the processed marker.
    pub fn state(&self, transaction_id: &str) -> Result<Option<TransactionState>> {
        if let Some(state) = self.tracked(transaction_id) {
            return Ok(Some(state));
        }
        Ok(self
            .store
            .is_applied(transaction_id)?
            .then_some(TransactionState::Applied))
    }

    /// Transactions seen but not yet finished
    pub fn in_flight(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn tracked(&self, transaction_id: &str) -> Option<TransactionState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(transaction_id)
            .copied()
    }

    fn set_state(&self, transaction_id: &str, state: TransactionState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transaction_id.to_string(), state);
    }

    /// Validate a receipt and reconcile every transaction in it.
    ///
    /// Authenticity and decoding failures come back as a rejected report so the
    /// caller still finishes the item. Retryable failures are errors; nothing
    /// was acknowledged and the transaction stays pending.
    #[instrument(skip(self, raw), fields(format = ?raw.format))]
    pub async fn process_receipt(&self, raw: &RawReceipt) -> Result<ReceiptReport> {
        let transactions = match self.validator.validate(raw).await {
            Ok(transactions) => transactions,
            Err(e @ (StoreError::Authenticity(_) | StoreError::MalformedReceipt(_))) => {
                warn!(error = %e, "Rejecting receipt");
                return Ok(ReceiptReport::rejected(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut reports = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            reports.push(self.reconcile(transaction).await?);
        }

        Ok(ReceiptReport {
            transactions: reports,
            rejection: None,
        })
    }

    /// Apply one validated transaction, deduplicated by transaction id
    #[instrument(skip(self, transaction), fields(
        transaction_id = %transaction.transaction_id,
        product_id = %transaction.product_id,
    ))]
    pub async fn reconcile(&self, transaction: ValidatedTransaction) -> Result<TransactionReport> {
        let transaction_id = transaction.transaction_id.clone();
        let product_id = transaction.product_id.clone();
        let report = |outcome| TransactionReport {
            transaction_id: transaction_id.clone(),
            product_id: product_id.clone(),
            outcome,
        };

        if self.tracked(&transaction_id).is_none() {
            self.set_state(&transaction_id, TransactionState::Pending);
        }

        if !transaction.signature_valid {
            warn!("Transaction failed signature check, rejecting");
            self.set_state(&transaction_id, TransactionState::Rejected);
            return Ok(report(ReconcileOutcome::Rejected(
                "signature invalid".to_string(),
            )));
        }

        let classified = match self.classifier.classify(transaction) {
            Ok(classified) => classified,
            Err(StoreError::UnknownProduct(id)) => {
                warn!("Transaction for unknown product, acknowledging and dropping");
                self.set_state(&transaction_id, TransactionState::Rejected);
                return Ok(report(ReconcileOutcome::Dropped(id)));
            }
            Err(e) => return Err(e),
        };

        let _guard = self.store.lock(&product_id).await;

        // A marker means a previous delivery committed; only the ack is missing
        if self.store.is_applied(&transaction_id)? {
            info!("Transaction already applied, acknowledge only");
            self.set_state(&transaction_id, TransactionState::Applying);
            return Ok(report(ReconcileOutcome::AlreadyApplied));
        }

        self.set_state(&transaction_id, TransactionState::Applying);

        let committed = self
            .plan(&classified)
            .and_then(|write| self.store.commit(write, Some(&transaction_id)));

        match committed {
            Ok(entitlement) => {
                info!(
                    kind = ?classified.kind,
                    quantity = classified.transaction.quantity,
                    ?entitlement,
                    "Transaction applied"
                );
                Ok(report(ReconcileOutcome::Applied(entitlement)))
            }
            Err(e) => {
                self.set_state(&transaction_id, TransactionState::Pending);
                Err(e)
            }
        }
    }

    /// Entitlement write for a classified transaction. Caller holds the product lock.
    fn plan(&self, classified: &ClassifiedTransaction) -> Result<EntitlementWrite> {
        let product_id = classified.product.id.as_str();

        let write = match (classified.kind, classified.product.kind) {
            (_, ProductKind::NonConsumable) => EntitlementStore::owned_write(product_id, true),
            // Consumables are not restorable
            (TransactionKind::Restoration, ProductKind::Consumable { .. }) => {
                debug!("Restored consumable grants nothing");
                EntitlementWrite::unchanged(product_id)
            }
            (_, ProductKind::Consumable { .. }) => {
                let current = self.store.get(product_id)?.count();
                let count = current.checked_add(classified.credit()).ok_or_else(|| {
                    StoreError::Internal(anyhow::anyhow!(
                        "Consumable balance overflow for {}",
                        product_id
                    ))
                })?;
                EntitlementStore::count_write(product_id, count)
            }
            (_, ProductKind::Subscription { .. }) => {
                let period = classified.product.period().ok_or_else(|| {
                    StoreError::InvalidCatalog(format!("{} has no subscription period", product_id))
                })?;
                let now = self.clock.now();
                let current = self.store.get(product_id)?.expires_at();
                // Extend from the later of now and the current expiry, never from the purchase date
                let base = current.filter(|expires| *expires > now).unwrap_or(now);
                EntitlementStore::expires_write(product_id, base + period)
            }
        };

        Ok(write)
    }

    /// Record that the receipt's feed item has been finished. Every outcome in a
    /// report is terminal, so its transactions leave the map; the processed
    /// marker keeps `Applied` answerable afterwards.
    pub fn finish(&self, report: &ReceiptReport) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        for transaction in &report.transactions {
            states.remove(&transaction.transaction_id);
        }
        debug!(finished = report.transactions.len(), in_flight = states.len(), "Receipt finished");
    }

    /// Spend one unit of a consumable. Fails without mutating at zero balance.
    #[instrument(skip(self))]
    pub async fn spend_consumable(&self, product_id: &str) -> Result<Entitlement> {
        let product = self.store.catalog().require(product_id)?;
        if !product.is_consumable() {
            return Err(StoreError::NotConsumable(product_id.to_string()));
        }

        let _guard = self.store.lock(product_id).await;

        let count = self.store.get(product_id)?.count();
        if count == 0 {
            debug!("Spend refused, balance is zero");
            return Err(StoreError::InsufficientBalance {
                product_id: product_id.to_string(),
            });
        }

        let entitlement = self
            .store
            .commit(EntitlementStore::count_write(product_id, count - 1), None)?;

        info!(remaining = entitlement.count(), "Consumable spent");
        Ok(entitlement)
    }

    /// Spend one consumable unit on a random unowned non-consumable, atomically.
    /// Returns `None` without spending when everything is already owned.
    #[instrument(skip(self))]
    pub async fn redeem_random_reward(
        &self,
        consumable_id: &str,
    ) -> Result<Option<RewardRedemption>> {
        let catalog = self.store.catalog();
        let product = catalog.require(consumable_id)?;
        if !product.is_consumable() {
            return Err(StoreError::NotConsumable(consumable_id.to_string()));
        }

        let mut lock_ids: Vec<&str> = catalog
            .products()
            .iter()
            .filter(|p| p.kind == ProductKind::NonConsumable)
            .map(|p| p.id.as_str())
            .collect();
        lock_ids.push(consumable_id);
        let _guards = self.store.lock_many(&lock_ids).await;

        let mut candidates = Vec::new();
        for product in catalog.products() {
            if product.kind == ProductKind::NonConsumable && !self.store.get(&product.id)?.owned() {
                candidates.push(product.id.as_str());
            }
        }

        let Some(reward_id) = candidates.choose(&mut rand::thread_rng()).copied() else {
            debug!("Every reward already owned");
            return Ok(None);
        };

        let count = self.store.get(consumable_id)?.count();
        if count == 0 {
            return Err(StoreError::InsufficientBalance {
                product_id: consumable_id.to_string(),
            });
        }

        let write = EntitlementStore::owned_write(reward_id, true)
            .and(EntitlementStore::count_write(consumable_id, count - 1));
        let reward = self.store.commit(write, None)?;
        let balance = self.store.get(consumable_id)?;

        info!(reward = %reward_id, remaining = balance.count(), "Random reward redeemed");

        Ok(Some(RewardRedemption { reward, balance }))
    }
}
