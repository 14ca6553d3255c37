//! Polling-queue adapter.
//!
//! There is no connection to keep alive: the queue URL is resolved once when
//! the adapter starts and every call after that is an independent round trip.
//! `subscribe` spawns one polling task that long-polls, hands each message to
//! the handler and deletes it only once the handler succeeded.
//!
//! After a successful receive the next cycle starts immediately. After a
//! failed one it waits first: 200 ms, doubling per consecutive failure up to
//! 5 s, reset by the next success. `close` cancels that wait, and messages of
//! a batch not yet handled when `close` runs stay on the queue.

#[cfg(feature = "sqs")]
mod aws_client;

#[cfg(feature = "sqs")]
pub use aws_client::AwsSqsApi;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{QueueLocator, SqsSettings};
use crate::envelope::{Envelope, SQS_TIMESTAMP_ATTRIBUTE, SQS_TYPE_ATTRIBUTE};
use crate::error::QueueError;
use crate::service::{Provider, QueueService, SharedHandler};

const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(200);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// One message returned by a receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub receipt_handle: String,
    pub body: String,
}

/// Request/response calls the adapter needs from the queue service.
#[async_trait]
pub trait SqsApi: Send + Sync {
    async fn queue_url(&self, queue_name: &str) -> anyhow::Result<String>;

    /// Sends one message with string attributes; returns the broker's message id.
    async fn send(
        &self,
        queue_url: &str,
        body: String,
        attributes: BTreeMap<String, String>,
    ) -> anyhow::Result<Option<String>>;

    /// Long-polls for up to `max_messages`, waiting at most `wait_time`.
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time: Duration,
    ) -> anyhow::Result<Vec<ReceivedMessage>>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> anyhow::Result<()>;
}

pub type SharedSqsApi = Arc<dyn SqsApi>;

pub struct PollingQueue {
    queue_url: String,
    max_messages: i32,
    wait_time: Duration,
    /// `None` once the adapter has been closed.
    client: RwLock<Option<SharedSqsApi>>,
    polling: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl PollingQueue {
    /// Builds the AWS SDK client from `settings` and resolves the queue.
    #[cfg(feature = "sqs")]
    pub async fn connect(settings: SqsSettings) -> Result<Self, QueueError> {
        let api = AwsSqsApi::from_settings(&settings).await;
        Self::start(settings, Arc::new(api)).await
    }

    /// Resolves the queue URL; failure here is fatal to construction.
    pub async fn start(settings: SqsSettings, api: SharedSqsApi) -> Result<Self, QueueError> {
        let queue_url = match &settings.queue {
            QueueLocator::Url(url) => {
                info!(queue_url = %url, "using sqs queue url");
                url.clone()
            }
            QueueLocator::Name(name) => {
                let url = api.queue_url(name).await.map_err(|err| {
                    error!(queue = %name, error = %err, "failed to initialize sqs queue");
                    QueueError::backend("resolve sqs queue url", err)
                })?;
                info!(queue = %name, queue_url = %url, "retrieved sqs queue url");
                url
            }
        };

        Ok(Self {
            queue_url,
            max_messages: settings.max_messages,
            wait_time: settings.wait_time,
            client: RwLock::new(Some(api)),
            polling: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    fn client(&self) -> Result<SharedSqsApi, QueueError> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(QueueError::Closed(Provider::Sqs))
    }
}

#[async_trait]
impl QueueService for PollingQueue {
    fn provider(&self) -> Provider {
        Provider::Sqs
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let client = self.client()?;
        envelope.validate()?;

        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into());
        let mut attributes = BTreeMap::new();
        attributes.insert(SQS_TIMESTAMP_ATTRIBUTE.to_string(), timestamp);
        attributes.insert(SQS_TYPE_ATTRIBUTE.to_string(), envelope.kind.clone());

        let message_id = client
            .send(&self.queue_url, envelope.to_json()?, attributes)
            .await
            .map_err(|err| {
                error!(message_type = %envelope.kind, error = %err, "failed to publish message to sqs");
                QueueError::backend("sqs send", err)
            })?;

        counter!("brokerline_messages_published_total", "provider" => "sqs").increment(1);
        info!(
            message_type = %envelope.kind,
            sqs_message_id = message_id.as_deref().unwrap_or(""),
            "message published to sqs"
        );
        Ok(())
    }

    async fn subscribe(&self, handler: SharedHandler) -> Result<(), QueueError> {
        let client = self.client()?;
        if self
            .polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("already polling for messages");
            return Ok(());
        }

        info!(queue_url = %self.queue_url, "starting to poll sqs for messages");
        let poller = Poller {
            client,
            handler,
            queue_url: self.queue_url.clone(),
            max_messages: self.max_messages,
            wait_time: self.wait_time,
            polling: Arc::clone(&self.polling),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(poller.run());
        Ok(())
    }

    async fn close(&self) {
        let released = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.polling.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if released.is_some() {
            info!("sqs adapter closed");
        } else {
            debug!("sqs adapter already closed");
        }
    }
}

/// State owned by the polling task.
struct Poller {
    client: SharedSqsApi,
    handler: SharedHandler,
    queue_url: String,
    max_messages: i32,
    wait_time: Duration,
    polling: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Poller {
    fn active(&self) -> bool {
        self.polling.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    async fn run(self) {
        let mut failures: u32 = 0;
        while self.active() {
            let delay = match self.poll_once().await {
                Ok(()) => {
                    failures = 0;
                    Duration::ZERO
                }
                Err(err) => {
                    counter!("brokerline_poll_errors_total", "provider" => "sqs").increment(1);
                    error!(error = %err, "error polling sqs");
                    failures = failures.saturating_add(1);
                    error_backoff(failures)
                }
            };

            // Re-arm: yield (or back off) unless close() cancels the next cycle.
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = pause(delay) => {}
            }
        }
        debug!(queue_url = %self.queue_url, "sqs polling stopped");
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let messages = self
            .client
            .receive(&self.queue_url, self.max_messages, self.wait_time)
            .await?;

        if !self.active() {
            if !messages.is_empty() {
                debug!(
                    discarded = messages.len(),
                    "polling stopped while receiving; leaving messages for redelivery"
                );
            }
            return Ok(());
        }
        if messages.is_empty() {
            return Ok(());
        }

        let total = messages.len();
        info!(count = total, "received message(s) from sqs");
        for (handled, message) in messages.into_iter().enumerate() {
            if !self.active() {
                debug!(
                    left = total - handled,
                    "polling stopped mid-batch; leaving the rest for redelivery"
                );
                break;
            }
            self.process(message).await;
        }
        Ok(())
    }

    async fn process(&self, message: ReceivedMessage) {
        counter!("brokerline_messages_received_total", "provider" => "sqs").increment(1);
        let message_id = message.message_id.as_deref().unwrap_or("");

        let envelope = match Envelope::from_slice(message.body.as_bytes()) {
            Ok(envelope) => envelope,
            Err(err) => {
                counter!("brokerline_messages_failed_total", "provider" => "sqs").increment(1);
                error!(sqs_message_id = message_id, error = %err, "error processing message");
                return;
            }
        };

        if let Err(err) = self.handler.handle(envelope).await {
            counter!("brokerline_messages_failed_total", "provider" => "sqs").increment(1);
            error!(sqs_message_id = message_id, error = %err, "error processing message");
            return;
        }

        match self
            .client
            .delete(&self.queue_url, &message.receipt_handle)
            .await
        {
            Ok(()) => debug!(sqs_message_id = message_id, "message deleted from sqs"),
            Err(err) => {
                error!(sqs_message_id = message_id, error = %err, "failed to delete message from sqs")
            }
        }
    }
}

fn error_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE
        .saturating_mul(factor)
        .min(ERROR_BACKOFF_MAX)
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}
