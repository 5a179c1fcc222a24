use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::Result, models::RawReceipt};

/// Result of asking the platform to start a purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Success(RawReceipt),
    UserCancelled,
    /// Awaiting external approval; the transaction arrives later on the feed
    Pending,
    Failed(String),
}

/// Platform purchase API
#[async_trait]
pub trait PurchaseApi: Send + Sync {
    async fn purchase(&self, product_id: &str) -> Result<PurchaseOutcome>;

    /// Receipts for previously completed purchases
    async fn restore(&self) -> Result<Vec<RawReceipt>>;
}

/// Platform purchase-update feed.
///
/// Each call to [`PurchaseFeed::updates`] opens a new session that first
/// redelivers every item not yet acknowledged.
pub trait PurchaseFeed: Send + Sync {
    fn updates(&self) -> mpsc::Receiver<FeedItem>;
}

/// Finishes one delivered transaction on the platform side
pub struct Acknowledger(Box<dyn FnOnce() + Send>);

impl Acknowledger {
    pub fn new(finish: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(finish))
    }

    /// Consumes the acknowledger, so an item can be finished at most once
    pub fn ack(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Acknowledger")
    }
}

#[derive(Debug)]
pub struct FeedItem {
    pub receipt: RawReceipt,
    pub ack: Acknowledger,
}

impl FeedItem {
    pub fn new(receipt: RawReceipt, finish: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receipt,
            ack: Acknowledger::new(finish),
        }
    }
}
