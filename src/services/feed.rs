use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::ReconciliationConfig,
    services::{
        purchase::{FeedItem, PurchaseFeed},
        reconciliation::ReconciliationEngine,
    },
};

/// Long-lived consumer of the purchase-update feed.
///
/// Items are acknowledged only after their entitlement change is durable.
/// Dropping the subscription stops the loop at its next await point.
pub struct FeedSubscription {
    session_id: Uuid,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn spawn(
        engine: Arc<ReconciliationEngine>,
        feed: &dyn PurchaseFeed,
        config: &ReconciliationConfig,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let updates = feed.updates();

        let span = info_span!("purchase_feed", session_id = %session_id);
        let handle = tokio::spawn(run(engine, updates, shutdown_rx, config.clone()).instrument(span));

        Self {
            session_id,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop consuming and wait for the loop to exit. Unacknowledged items are
    /// redelivered to the next session.
    pub async fn cancel(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(session_id = %self.session_id, error = %e, "Purchase feed task failed");
            }
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    engine: Arc<ReconciliationEngine>,
    mut updates: mpsc::Receiver<FeedItem>,
    mut shutdown: watch::Receiver<bool>,
    config: ReconciliationConfig,
) {
    info!("Purchase feed session started");

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break,
            item = updates.recv() => match item {
                Some(item) => item,
                None => {
                    debug!("Purchase feed closed");
                    break;
                }
            },
        };

        if !process_item(&engine, item, &mut shutdown, &config).await {
            break;
        }
    }

    info!("Purchase feed session ended");
}

/// Returns false when shutdown interrupted processing
async fn process_item(
    engine: &ReconciliationEngine,
    item: FeedItem,
    shutdown: &mut watch::Receiver<bool>,
    config: &ReconciliationConfig,
) -> bool {
    let FeedItem { receipt, ack } = item;
    let max_attempts = u32::from(config.retry_attempts.max(1));
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = shutdown_signalled(shutdown) => return false,
            result = engine.process_receipt(&receipt) => result,
        };

        match result {
            Ok(report) => {
                ack.ack();
                engine.finish(&report);
                debug!(
                    transactions = report.transactions.len(),
                    rejected = report.is_rejected(),
                    "Feed item finished"
                );
                return true;
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff(config.retry_backoff_ms, attempt);
                warn!(error = %e, attempt, ?delay, "Feed item failed, retrying");
                tokio::select! {
                    biased;
                    _ = shutdown_signalled(shutdown) => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                // Left unacknowledged; the platform redelivers it next session
                warn!(error = %e, attempt, "Feed item left pending");
                return true;
            }
        }
    }
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
