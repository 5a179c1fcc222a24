use std::sync::Arc;
use tracing::warn;

use crate::{
    error::{Result, StoreError},
    models::{Catalog, ClassifiedTransaction, ProductKind, TransactionKind, ValidatedTransaction},
};

/// Resolves a validated transaction against the catalog
#[derive(Clone)]
pub struct TransactionClassifier {
    catalog: Arc<Catalog>,
}

impl TransactionClassifier {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn classify(&self, transaction: ValidatedTransaction) -> Result<ClassifiedTransaction> {
        let product = self
            .catalog
            .get(&transaction.product_id)
            .ok_or_else(|| StoreError::UnknownProduct(transaction.product_id.clone()))?
            .clone();

        if let Some(declared) = transaction.kind.as_deref() {
            if !product.kind.matches_label(declared) {
                warn!(
                    product_id = %product.id,
                    declared,
                    catalog_kind = product.kind.as_str(),
                    "Platform-declared kind disagrees with catalog, using catalog"
                );
            }
        }

        let kind = match (product.kind, transaction.is_derived()) {
            (ProductKind::Subscription { .. }, true) => TransactionKind::SubscriptionRenewal,
            (ProductKind::Subscription { .. }, false) => TransactionKind::SubscriptionPurchase,
            (_, true) => TransactionKind::Restoration,
            (ProductKind::Consumable { .. }, false) => TransactionKind::ConsumablePurchase,
            (ProductKind::NonConsumable, false) => TransactionKind::NonConsumablePurchase,
        };

        Ok(ClassifiedTransaction {
            effective_date: transaction.purchase_date,
            transaction,
            product,
            kind,
        })
    }
}
