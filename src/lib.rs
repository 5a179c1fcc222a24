//! Storefront purchase verification and entitlement reconciliation.
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storefront;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{PurchaseFailure, Result, StoreError};
pub use storefront::{PurchaseResult, Storefront};
