use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use crate::error::{Result, StoreError};

/// Product kind, with the parameters each kind needs at reconciliation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductKind {
    Consumable { units_per_purchase: u32 },
    NonConsumable,
    Subscription { period_days: u32 },
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumable { .. } => "consumable",
            Self::NonConsumable => "non_consumable",
            Self::Subscription { .. } => "subscription",
        }
    }

    /// Whether a platform-declared kind label matches this kind
    pub fn matches_label(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        match self {
            Self::Consumable { .. } => label == "consumable",
            Self::NonConsumable => label == "non-consumable" || label == "non_consumable",
            Self::Subscription { .. } => label.contains("subscription"),
        }
    }
}

/// Immutable catalog fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Product {
    #[validate(length(min = 1, max = 255))]
    pub id: String,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub price_cents: u32,
    pub kind: ProductKind,
}

impl Product {
    pub fn is_consumable(&self) -> bool {
        matches!(self.kind, ProductKind::Consumable { .. })
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self.kind, ProductKind::Subscription { .. })
    }

    /// Entitlement period of a subscription product
    pub fn period(&self) -> Option<time::Duration> {
        match self.kind {
            ProductKind::Subscription { period_days } => {
                Some(time::Duration::days(i64::from(period_days)))
            }
            _ => None,
        }
    }
}

/// Validated product list, indexed by product id
#[derive(Debug, Clone)]
pub struct Catalog {
    products: Vec<Product>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Result<Self> {
        let mut index = HashMap::with_capacity(products.len());

        for (position, product) in products.iter().enumerate() {
            product.validate().map_err(|e| {
                StoreError::InvalidCatalog(format!("Product {}: {}", product.id, e))
            })?;

            match product.kind {
                ProductKind::Consumable {
                    units_per_purchase: 0,
                } => {
                    return Err(StoreError::InvalidCatalog(format!(
                        "Consumable {} grants zero units",
                        product.id
                    )));
                }
                ProductKind::Subscription { period_days: 0 } => {
                    return Err(StoreError::InvalidCatalog(format!(
                        "Subscription {} has an empty period",
                        product.id
                    )));
                }
                _ => {}
            }

            if index.insert(product.id.clone(), position).is_some() {
                return Err(StoreError::InvalidCatalog(format!(
                    "Duplicate product id {}",
                    product.id
                )));
            }
        }

        Ok(Self { products, index })
    }

    pub fn get(&self, product_id: &str) -> Option<&Product> {
        self.index.get(product_id).map(|&i| &self.products[i])
    }

    pub fn require(&self, product_id: &str) -> Result<&Product> {
        self.get(product_id)
            .ok_or_else(|| StoreError::UnknownProduct(product_id.to_string()))
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Product> {
        self.products.iter().filter(|p| p.is_subscription())
    }
}
