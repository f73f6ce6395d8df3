use crate::error::Cancelled;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output side of one fetch invocation.
///
/// Wraps a bounded channel: `send` waits while the consumer is busy, so a
/// resolver emitting many small pages never buffers more than the channel
/// capacity. All sends fail with [`Cancelled`] once the sync is cancelled.
#[derive(Debug, Clone)]
pub struct ResourceSender {
    tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    sent: Arc<AtomicU64>,
}

impl ResourceSender {
    pub(crate) fn new(tx: mpsc::Sender<Value>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit one item
    pub async fn send(&self, item: Value) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            sent = self.tx.send(item) => {
                sent.map_err(|_| Cancelled)?;
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Emit every item of a page, in order
    pub async fn send_all<I>(&self, items: I) -> Result<(), Cancelled>
    where
        I: IntoIterator<Item = Value>,
    {
        for item in items {
            self.send(item).await?;
        }
        Ok(())
    }

    /// Emit a page as returned by an API: arrays are flattened, null is
    /// ignored, anything else is a single item.
    pub async fn send_page(&self, page: Value) -> Result<(), Cancelled> {
        match page {
            Value::Null => Ok(()),
            Value::Array(items) => self.send_all(items).await,
            item => self.send(item).await,
        }
    }

    /// Items emitted through this sender and its clones
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
