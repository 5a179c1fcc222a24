// Domain models
pub mod common;
pub mod entitlement;
pub mod receipt;

pub use common::{Catalog, Product, ProductKind};
pub use entitlement::{CatalogEntry, Entitlement, EntitlementChange, SubscriptionStatus};
pub use receipt::{
    ClassifiedTransaction, RawReceipt, ReceiptFormat, TransactionKind, ValidatedTransaction,
};
