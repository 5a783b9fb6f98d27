//! Event-queue publishing, decoupled from the read path.
//!
//! Handlers call [`Outbox::enqueue`], which never waits. A single worker task
//! drains the bounded queue into an [`EventPublisher`]. Publish failures are
//! logged and not retried. When the queue is full the event is dropped and
//! counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SMS_QUEUE: &str = "sms_queue";
pub const USSD_QUEUE: &str = "ussd_queue";
pub const ALARM_QUEUE: &str = "alarm_queue";
pub const DEVICE_QUEUE: &str = "device_queue";
pub const DELIVERY_REPORT_QUEUE: &str = "deliveryreport";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
    #[error("rejected by broker: {0}")]
    Rejected(String),
}

/// Downstream event queue.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, queue: &str, payload: &Value) -> Result<(), PublishError>;
}

/// Emits one structured log line per event.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, queue: &str, payload: &Value) -> Result<(), PublishError> {
        info!(queue, event = %payload, "Published event");
        Ok(())
    }
}

/// Records events in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, queue: &str) -> Vec<Value> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, queue: &str, payload: &Value) -> Result<(), PublishError> {
        self.events
            .lock()
            .await
            .push((queue.to_string(), payload.clone()));
        Ok(())
    }
}

#[derive(Debug)]
struct OutboxEvent {
    queue: &'static str,
    payload: Value,
}

/// Handle to the outbox queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboxEvent>,
    dropped: Arc<AtomicU64>,
}

impl Outbox {
    /// Start the worker. It stops taking new events once `shutdown` fires and
    /// publishes whatever is still queued before exiting.
    pub fn spawn(
        publisher: Arc<dyn EventPublisher>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(publisher, rx, shutdown));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, queue: &'static str, payload: Value) -> bool {
        match self.tx.try_send(OutboxEvent { queue, payload }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(queue = ev.queue, dropped_total = total, "Outbox full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(queue = ev.queue, "Outbox closed, dropping event");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_worker(
    publisher: Arc<dyn EventPublisher>,
    mut rx: mpsc::Receiver<OutboxEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => publish(publisher.as_ref(), ev).await,
                None => return,
            },
            () = shutdown.cancelled() => break,
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(ev) = rx.recv().await {
        publish(publisher.as_ref(), ev).await;
        drained += 1;
    }
    debug!(drained, "Outbox drained");
}

async fn publish(publisher: &dyn EventPublisher, ev: OutboxEvent) {
    if let Err(e) = publisher.publish(ev.queue, &ev.payload).await {
        warn!(queue = ev.queue, error = %e, "Failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _queue: &str, _payload: &Value) -> Result<(), PublishError> {
            Err(PublishError::Unavailable("down".into()))
        }
    }

    /// Blocks every publish until released.
    struct GatedPublisher {
        gate: tokio::sync::Semaphore,
        inner: MemoryPublisher,
    }

    #[async_trait]
    impl EventPublisher for GatedPublisher {
        async fn publish(&self, queue: &str, payload: &Value) -> Result<(), PublishError> {
            let _permit = self.gate.acquire().await.map_err(|e| {
                PublishError::Unavailable(e.to_string())
            })?;
            self.inner.publish(queue, payload).await
        }
    }

    #[tokio::test]
    async fn test_events_reach_publisher_in_order() {
        let publisher = Arc::new(MemoryPublisher::new());
        let shutdown = CancellationToken::new();
        let (outbox, handle) = Outbox::spawn(publisher.clone(), 8, shutdown.clone());

        assert!(outbox.enqueue(SMS_QUEUE, json!({"n": 1})));
        assert!(outbox.enqueue(ALARM_QUEUE, json!({"n": 2})));
        shutdown.cancel();
        handle.await.unwrap();

        let events = publisher.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, SMS_QUEUE);
        assert_eq!(events[1].1["n"], 2);
    }

    #[tokio::test]
    async fn test_full_outbox_drops_and_counts() {
        let publisher = Arc::new(GatedPublisher {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryPublisher::new(),
        });
        let shutdown = CancellationToken::new();
        let (outbox, handle) = Outbox::spawn(publisher.clone(), 1, shutdown.clone());

        // First event is taken by the worker (blocked on the gate), second fills
        // the single slot, later ones are dropped.
        assert!(outbox.enqueue(SMS_QUEUE, json!(1)));
        tokio::task::yield_now().await;
        let mut accepted = 1;
        for i in 0..5 {
            if outbox.enqueue(SMS_QUEUE, json!(i)) {
                accepted += 1;
            }
        }
        assert!(accepted <= 2);
        assert_eq!(outbox.dropped(), 6 - accepted);

        publisher.gate.add_permits(16);
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(publisher.inner.events().await.len() as u64, accepted);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_worker() {
        let shutdown = CancellationToken::new();
        let (outbox, handle) = Outbox::spawn(Arc::new(FailingPublisher), 4, shutdown.clone());
        assert!(outbox.enqueue(SMS_QUEUE, json!({})));
        assert!(outbox.enqueue(SMS_QUEUE, json!({})));
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(outbox.dropped(), 0);
    }
}
