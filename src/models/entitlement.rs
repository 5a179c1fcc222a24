use serde::Serialize;
use time::OffsetDateTime;

use super::common::Product;

/// Durable record of what a product currently grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entitlement {
    NonConsumable {
        product_id: String,
        owned: bool,
    },
    Consumable {
        product_id: String,
        count: u32,
    },
    Subscription {
        product_id: String,
        #[serde(with = "time::serde::rfc3339::option")]
        expires_at: Option<OffsetDateTime>,
    },
}

impl Entitlement {
    pub fn product_id(&self) -> &str {
        match self {
            Self::NonConsumable { product_id, .. }
            | Self::Consumable { product_id, .. }
            | Self::Subscription { product_id, .. } => product_id,
        }
    }

    pub fn owned(&self) -> bool {
        matches!(self, Self::NonConsumable { owned: true, .. })
    }

    pub fn count(&self) -> u32 {
        match self {
            Self::Consumable { count, .. } => *count,
            _ => 0,
        }
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Subscription { expires_at, .. } => *expires_at,
            _ => None,
        }
    }
}

/// Published after every committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementChange {
    pub entitlement: Entitlement,
    /// Transaction that caused the change, absent for in-app spends
    pub transaction_id: Option<String>,
}

/// Catalog row as the presentation layer renders it
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub product: Product,
    pub entitlement: Entitlement,
}

/// Subscription summary for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub product_id: String,
    pub entitled: bool,
    pub days_remaining: i64,
    pub description: String,
}
