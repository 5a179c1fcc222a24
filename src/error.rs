use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Receipt failed authenticity check: {0}")]
    Authenticity(String),

    #[error("Malformed receipt: {0}")]
    MalformedReceipt(String),

    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("Product {0} is not consumable")]
    NotConsumable(String),

    #[error("Insufficient balance for {product_id}")]
    InsufficientBalance { product_id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Purchase failed: {0}")]
    PurchaseFailed(String),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

/// Coarse failure category surfaced to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseFailure {
    RetryLater,
    NotEntitled,
    InsufficientBalance,
}

impl StoreError {
    /// Whether the failed attempt may succeed if repeated later.
    /// The item stays pending on the purchase-update feed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Network(_) | StoreError::Persistence(_))
    }

    /// Map to the category shown to the user. Internal detail is logged here
    /// and never leaves the crate.
    pub fn user_facing(&self) -> PurchaseFailure {
        match self {
            StoreError::Network(ref msg) => {
                tracing::warn!("Network error: {}", msg);
                PurchaseFailure::RetryLater
            }
            StoreError::Persistence(ref msg) => {
                tracing::error!("Persistence error: {}", msg);
                PurchaseFailure::RetryLater
            }
            StoreError::Authenticity(ref msg) => {
                tracing::warn!("Receipt rejected: {}", msg);
                PurchaseFailure::NotEntitled
            }
            StoreError::MalformedReceipt(ref msg) => {
                tracing::warn!("Receipt undecodable: {}", msg);
                PurchaseFailure::NotEntitled
            }
            StoreError::UnknownProduct(ref id) => {
                tracing::warn!("Unknown product: {}", id);
                PurchaseFailure::NotEntitled
            }
            StoreError::NotConsumable(ref id) => {
                tracing::warn!("Spend attempted on non-consumable: {}", id);
                PurchaseFailure::NotEntitled
            }
            StoreError::InsufficientBalance { .. } => PurchaseFailure::InsufficientBalance,
            StoreError::PurchaseFailed(ref reason) => {
                tracing::info!("Purchase failed: {}", reason);
                PurchaseFailure::RetryLater
            }
            StoreError::InvalidCatalog(ref msg) => {
                tracing::error!("Invalid catalog: {}", msg);
                PurchaseFailure::NotEntitled
            }
            StoreError::Config(ref e) => {
                tracing::error!("Configuration error: {:?}", e);
                PurchaseFailure::RetryLater
            }
            StoreError::Internal(ref e) => {
                tracing::error!("Internal error: {:?}", e);
                PurchaseFailure::RetryLater
            }
        }
    }
}

// Helper type for results
pub type Result<T> = std::result::Result<T, StoreError>;
