use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::common::{Product, ProductKind};

/// How a receipt blob is authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptFormat {
    /// Compact JWS signed by the platform, verified against the embedded trust anchor
    SignedTransaction,
    /// Base64 app receipt, verified by the remote endpoint
    AppReceipt,
}

/// Opaque signed blob from a purchase, restore or feed delivery. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct RawReceipt {
    pub format: ReceiptFormat,
    pub data: String,
}

impl RawReceipt {
    pub fn signed_transaction(jws: impl Into<String>) -> Self {
        Self {
            format: ReceiptFormat::SignedTransaction,
            data: jws.into(),
        }
    }

    pub fn app_receipt(base64: impl Into<String>) -> Self {
        Self {
            format: ReceiptFormat::AppReceipt,
            data: base64.into(),
        }
    }

    /// Wrap the raw bytes of an on-device app receipt
    pub fn app_receipt_bytes(bytes: &[u8]) -> Self {
        Self::app_receipt(STANDARD.encode(bytes))
    }
}

impl std::fmt::Debug for RawReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawReceipt")
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Decoded, authenticated transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedTransaction {
    pub transaction_id: String,
    pub product_id: String,
    /// Kind label declared by the platform, when the receipt carries one
    pub kind: Option<String>,
    pub quantity: u32,
    pub purchase_date: OffsetDateTime,
    pub original_transaction_id: String,
    pub signature_valid: bool,
}

impl ValidatedTransaction {
    /// True when this entry refers back to an earlier purchase
    pub fn is_derived(&self) -> bool {
        self.original_transaction_id != self.transaction_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    ConsumablePurchase,
    NonConsumablePurchase,
    SubscriptionPurchase,
    SubscriptionRenewal,
    Restoration,
}

#[derive(Debug, Clone)]
pub struct ClassifiedTransaction {
    pub transaction: ValidatedTransaction,
    pub product: Product,
    pub kind: TransactionKind,
    /// Purchase date carried forward for expiration bookkeeping
    pub effective_date: OffsetDateTime,
}

impl ClassifiedTransaction {
    /// Consumable units this transaction credits
    pub fn credit(&self) -> u32 {
        match (self.kind, self.product.kind) {
            (
                TransactionKind::ConsumablePurchase,
                ProductKind::Consumable { units_per_purchase },
            ) => units_per_purchase.saturating_mul(self.transaction.quantity),
            _ => 0,
        }
    }
}
