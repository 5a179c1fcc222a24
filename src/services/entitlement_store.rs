use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::{
    error::{Result, StoreError},
    models::{Catalog, Entitlement, EntitlementChange, ProductKind},
    services::kv_store::{KeyValueStore, WriteBatch},
};

/// Key layout inside the key-value store
pub mod keys {
    pub fn owned(product_id: &str) -> String {
        format!("owned:{}", product_id)
    }

    pub fn count(product_id: &str) -> String {
        format!("count:{}", product_id)
    }

    pub fn expires_at(product_id: &str) -> String {
        format!("expires:{}", product_id)
    }

    /// Processed-transaction marker
    pub fn applied(transaction_id: &str) -> String {
        format!("txn:{}", transaction_id)
    }
}

/// Sole owner of entitlement state.
///
/// Mutations are serialized per product through [`EntitlementStore::lock`];
/// callers hold the guard across their read-modify-write.
pub struct EntitlementStore {
    kv: Arc<dyn KeyValueStore>,
    catalog: Arc<Catalog>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    changes: broadcast::Sender<EntitlementChange>,
}

impl EntitlementStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, catalog: Arc<Catalog>, change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        Self {
            kv,
            catalog,
            locks: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Current entitlement of a catalog product
    pub fn get(&self, product_id: &str) -> Result<Entitlement> {
        let product = self.catalog.require(product_id)?;
        let product_id = product.id.clone();

        let entitlement = match product.kind {
            ProductKind::NonConsumable => Entitlement::NonConsumable {
                owned: self.kv.get_bool(&keys::owned(&product_id))?.unwrap_or(false),
                product_id,
            },
            ProductKind::Consumable { .. } => {
                let stored = self.kv.get_int(&keys::count(&product_id))?.unwrap_or(0);
                let count = u32::try_from(stored).map_err(|_| {
                    StoreError::Persistence(format!(
                        "Stored count {} for {} is out of range",
                        stored, product_id
                    ))
                })?;
                Entitlement::Consumable { product_id, count }
            }
            ProductKind::Subscription { .. } => Entitlement::Subscription {
                expires_at: self.kv.get_date(&keys::expires_at(&product_id))?,
                product_id,
            },
        };

        Ok(entitlement)
    }

    #[instrument(skip(self))]
    pub fn set_owned(&self, product_id: &str, owned: bool) -> Result<Entitlement> {
        self.commit(Self::owned_write(product_id, owned), None)
    }

    #[instrument(skip(self))]
    pub fn set_count(&self, product_id: &str, count: u32) -> Result<Entitlement> {
        self.commit(Self::count_write(product_id, count), None)
    }

    #[instrument(skip(self))]
    pub fn set_expires_at(&self, product_id: &str, expires_at: OffsetDateTime) -> Result<Entitlement> {
        self.commit(Self::expires_write(product_id, expires_at), None)
    }

    pub fn owned_write(product_id: &str, owned: bool) -> EntitlementWrite {
        EntitlementWrite {
            product_ids: vec![product_id.to_string()],
            batch: WriteBatch::new().set_bool(keys::owned(product_id), owned),
        }
    }

    pub fn count_write(product_id: &str, count: u32) -> EntitlementWrite {
        EntitlementWrite {
            product_ids: vec![product_id.to_string()],
            batch: WriteBatch::new().set_int(keys::count(product_id), i64::from(count)),
        }
    }

    pub fn expires_write(product_id: &str, expires_at: OffsetDateTime) -> EntitlementWrite {
        EntitlementWrite {
            product_ids: vec![product_id.to_string()],
            batch: WriteBatch::new().set_date(keys::expires_at(product_id), expires_at),
        }
    }

    /// Durably apply an entitlement write, together with the processed marker
    /// of the transaction that caused it, in one atomic batch.
    /// Returns the entitlement of the first product touched.
    pub fn commit(
        &self,
        write: EntitlementWrite,
        transaction_id: Option<&str>,
    ) -> Result<Entitlement> {
        let EntitlementWrite { product_ids, batch } = write;

        for product_id in &product_ids {
            self.catalog.require(product_id)?;
        }

        let batch = match transaction_id {
            Some(id) => batch.set_bool(keys::applied(id), true),
            None => batch,
        };

        if !batch.is_empty() {
            self.kv.commit(batch)?;
        }

        let mut first = None;
        for product_id in &product_ids {
            let entitlement = self.get(product_id)?;
            debug!(product_id = %product_id, ?entitlement, "Entitlement committed");

            // Nobody listening is fine
            let _ = self.changes.send(EntitlementChange {
                entitlement: entitlement.clone(),
                transaction_id: transaction_id.map(str::to_string),
            });

            first.get_or_insert(entitlement);
        }

        first.ok_or_else(|| {
            StoreError::Internal(anyhow::anyhow!("Entitlement write touched no product"))
        })
    }

    pub fn is_applied(&self, transaction_id: &str) -> Result<bool> {
        Ok(self
            .kv
            .get_bool(&keys::applied(transaction_id))?
            .unwrap_or(false))
    }

    /// Exclusive access to one product's entitlement
    pub async fn lock(&self, product_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(product_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Lock several products in a stable order
    pub async fn lock_many(&self, product_ids: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&str> = product_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntitlementChange> {
        self.changes.subscribe()
    }
}

/// Pending entitlement write, possibly spanning several products
#[derive(Debug, Clone)]
pub struct EntitlementWrite {
    product_ids: Vec<String>,
    batch: WriteBatch,
}

impl EntitlementWrite {
    /// Write nothing but still report the product's entitlement
    pub fn unchanged(product_id: &str) -> Self {
        Self {
            product_ids: vec![product_id.to_string()],
            batch: WriteBatch::new(),
        }
    }

    pub fn and(mut self, other: EntitlementWrite) -> Self {
        self.product_ids.extend(other.product_ids);
        self.batch = self.batch.append(other.batch);
        self
    }
}
