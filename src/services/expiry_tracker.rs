use std::sync::Arc;
use time::{macros::format_description, Duration};

use crate::{
    error::Result,
    models::SubscriptionStatus,
    services::entitlement_store::EntitlementStore,
    utils::Clock,
};

/// Read-side view of subscription expiry. Never mutates.
#[derive(Clone)]
pub struct SubscriptionExpiryTracker {
    store: Arc<EntitlementStore>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionExpiryTracker {
    pub fn new(store: Arc<EntitlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn is_entitled(&self, product_id: &str) -> Result<bool> {
        Ok(self.remaining_duration(product_id)? > Duration::ZERO)
    }

    /// Time left before expiry, zero when expired or never purchased
    pub fn remaining_duration(&self, product_id: &str) -> Result<Duration> {
        let expires_at = self.store.get(product_id)?.expires_at();
        let now = self.clock.now();

        Ok(expires_at
            .map(|expires| expires - now)
            .filter(|remaining| remaining.is_positive())
            .unwrap_or(Duration::ZERO))
    }

    pub fn days_remaining(&self, product_id: &str) -> Result<i64> {
        Ok(self.remaining_duration(product_id)?.whole_days())
    }

    /// Whether any subscription in the catalog is currently active
    pub fn any_active(&self) -> Result<bool> {
        for product in self.store.catalog().subscriptions() {
            if self.is_entitled(&product.id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Human-readable status. Agrees with [`Self::is_entitled`] down to the last second.
    pub fn describe(&self, product_id: &str) -> Result<String> {
        let expires_at = match self.store.get(product_id)?.expires_at() {
            Some(expires) if self.is_entitled(product_id)? => expires,
            _ => return Ok("Not Subscribed".to_string()),
        };

        let date = expires_at
            .format(format_description!("[day]/[month]/[year]"))
            .map_err(|e| anyhow::anyhow!("Failed to format expiry date: {}", e))?;
        let remaining = match self.days_remaining(product_id)? {
            0 => "< 1 Day".to_string(),
            days => format!("{} Days", days),
        };

        Ok(format!("Subscribed! \nExpires: {} ({})", date, remaining))
    }

    pub fn status(&self, product_id: &str) -> Result<SubscriptionStatus> {
        Ok(SubscriptionStatus {
            product_id: product_id.to_string(),
            entitled: self.is_entitled(product_id)?,
            days_remaining: self.days_remaining(product_id)?,
            description: self.describe(product_id)?,
        })
    }
}
