use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::QueueError;
use crate::service::{Provider, QueueService, SharedHandler};

/// Process-local [`QueueService`] that stands in for a broker.
///
/// Every published envelope is recorded and, once a handler is subscribed,
/// delivered to it in publish order. Handler failures are logged and the
/// envelope is dropped; there is no redelivery.
#[derive(Clone)]
pub struct InMemoryQueue {
    provider: Provider,
    published: Arc<Mutex<Vec<Envelope>>>,
    deliveries: Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<Envelope>>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryQueue {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            published: Arc::new(Mutex::new(Vec::new())),
            deliveries: Arc::new(std::sync::Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn take_published(&self) -> Vec<Envelope> {
        let mut guard = self.published.lock().await;
        std::mem::take(&mut *guard)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            Err(QueueError::Closed(self.provider))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.ensure_open()?;
        envelope.validate()?;
        self.published.lock().await.push(envelope.clone());

        let sender = self
            .deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(sender) = sender {
            if sender.send(envelope.clone()).is_err() {
                debug!("in-memory delivery task has stopped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, handler: SharedHandler) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut slot = self
            .deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            warn!("in-memory queue already has a subscriber");
            return Ok(());
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        *slot = Some(tx);
        drop(slot);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let kind = envelope.kind.clone();
                if let Err(err) = handler.handle(envelope).await {
                    warn!(message_type = %kind, error = %err, "in-memory handler failed");
                }
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}
