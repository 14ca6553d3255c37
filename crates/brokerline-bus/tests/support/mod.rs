#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use brokerline_bus::rabbitmq::{
    Acknowledger, AmqpTransport, ConnectionLostHook, Delivery, DeliveryStream, OutboundMessage,
    PublishOutcome,
};
use brokerline_bus::sqs::{ReceivedMessage, SqsApi};
use futures::StreamExt;
use tokio::sync::mpsc;

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Queued {
    redelivered: bool,
    body: Vec<u8>,
}

/// In-process stand-in for a RabbitMQ connection + channel. Published
/// messages are routed straight into the bound queue.
#[derive(Clone)]
pub struct FakeAmqp {
    state: Arc<AmqpState>,
}

struct AmqpState {
    calls: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, String, OutboundMessage)>>,
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<(u64, bool)>>,
    prefetch: Mutex<Option<u16>>,
    lost_hook: Mutex<Option<ConnectionLostHook>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Queued>>>,
    next_tag: AtomicU64,
    fail_on: Mutex<Option<&'static str>>,
    reject_publish: AtomicBool,
    redeliver_on_nack: AtomicBool,
}

impl Default for FakeAmqp {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(AmqpState {
                calls: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                nacked: Mutex::new(Vec::new()),
                prefetch: Mutex::new(None),
                lost_hook: Mutex::new(None),
                sender: Mutex::new(Some(tx)),
                receiver: Mutex::new(Some(rx)),
                next_tag: AtomicU64::new(1),
                fail_on: Mutex::new(None),
                reject_publish: AtomicBool::new(false),
                redeliver_on_nack: AtomicBool::new(true),
            }),
        }
    }
}

impl FakeAmqp {
    pub fn failing_on(operation: &'static str) -> Self {
        let fake = Self::default();
        *fake.state.fail_on.lock().unwrap() = Some(operation);
        fake
    }

    pub fn reject_publishes(&self) {
        self.state.reject_publish.store(true, Ordering::SeqCst);
    }

    pub fn drop_nacked(&self) {
        self.state.redeliver_on_nack.store(false, Ordering::SeqCst);
    }

    /// Puts a raw body on the queue, bypassing the exchange.
    pub fn inject(&self, body: &[u8]) {
        self.enqueue(Queued {
            redelivered: false,
            body: body.to_vec(),
        });
    }

    /// Fires the connection-lost hook the adapter registered.
    pub fn lose_connection(&self, reason: &str) {
        if let Some(hook) = self.state.lost_hook.lock().unwrap().as_ref() {
            hook(reason.to_string());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, String, OutboundMessage)> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.state.nacked.lock().unwrap().clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        *self.state.prefetch.lock().unwrap()
    }

    fn enqueue(&self, message: Queued) {
        if let Some(sender) = self.state.sender.lock().unwrap().as_ref() {
            let _ = sender.send(message);
        }
    }

    fn record(&self, call: String) -> Result<()> {
        let failing = *self.state.fail_on.lock().unwrap();
        let name = call.split(':').next().unwrap_or_default().to_string();
        self.state.calls.lock().unwrap().push(call);
        if failing == Some(name.as_str()) {
            bail!("{name} refused by fake broker");
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpTransport for FakeAmqp {
    fn on_connection_lost(&self, hook: ConnectionLostHook) {
        *self.state.lost_hook.lock().unwrap() = Some(hook);
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.record(format!("declare_exchange:{exchange}"))
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.record(format!("declare_queue:{queue}"))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.record(format!("bind_queue:{queue}:{exchange}:{routing_key}"))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PublishOutcome> {
        self.record(format!("publish:{exchange}:{routing_key}"))?;
        if self.state.reject_publish.load(Ordering::SeqCst) {
            return Ok(PublishOutcome::NotAccepted);
        }
        self.state.published.lock().unwrap().push((
            exchange.to_string(),
            routing_key.to_string(),
            message.clone(),
        ));
        self.enqueue(Queued {
            redelivered: false,
            body: message.body,
        });
        Ok(PublishOutcome::Accepted)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.record(format!("set_prefetch:{count}"))?;
        *self.state.prefetch.lock().unwrap() = Some(count);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.record(format!("consume:{queue}"))?;
        let Some(receiver) = self.state.receiver.lock().unwrap().take() else {
            bail!("queue already has a consumer");
        };
        let fake = self.clone();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let fake = fake.clone();
            async move {
                let queued = receiver.recv().await?;
                let tag = fake.state.next_tag.fetch_add(1, Ordering::SeqCst);
                let acker = FakeAcker {
                    fake: fake.clone(),
                    tag,
                    body: queued.body.clone(),
                };
                let delivery = Delivery::new(tag, queued.redelivered, queued.body, Box::new(acker));
                Some((Ok(delivery), receiver))
            }
        });
        Ok(stream.boxed())
    }

    async fn close_channel(&self) -> Result<()> {
        self.record("close_channel".to_string())
    }

    async fn close_connection(&self) -> Result<()> {
        self.state.sender.lock().unwrap().take();
        self.record("close_connection".to_string())
    }
}

struct FakeAcker {
    fake: FakeAmqp,
    tag: u64,
    body: Vec<u8>,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<()> {
        self.fake.state.acked.lock().unwrap().push(self.tag);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.fake
            .state
            .nacked
            .lock()
            .unwrap()
            .push((self.tag, requeue));
        if requeue && self.fake.state.redeliver_on_nack.load(Ordering::SeqCst) {
            self.fake.enqueue(Queued {
                redelivered: true,
                body: self.body.clone(),
            });
        }
        Ok(())
    }
}

/// In-process SQS stand-in. Received messages stay invisible until deleted
/// or until [`FakeSqs::expire_visibility`] is called.
#[derive(Clone, Default)]
pub struct FakeSqs {
    state: Arc<SqsState>,
}

#[derive(Default)]
struct SqsState {
    visible: Mutex<VecDeque<ReceivedMessage>>,
    invisible: Mutex<Vec<ReceivedMessage>>,
    sent: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    deleted: Mutex<Vec<String>>,
    resolve_calls: AtomicUsize,
    receive_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failing_receives: AtomicUsize,
    next_id: AtomicU64,
    fail_resolve: AtomicBool,
    fail_send: AtomicBool,
    receive_delay_ms: AtomicU64,
}

impl FakeSqs {
    pub fn fail_resolve(&self) {
        self.state.fail_resolve.store(true, Ordering::SeqCst);
    }

    pub fn fail_send(&self) {
        self.state.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.state.failing_receives.store(count, Ordering::SeqCst);
    }

    pub fn delay_receives(&self, delay: Duration) {
        self.state
            .receive_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Enqueues a raw body and returns its receipt handle.
    pub fn inject(&self, body: &str) -> String {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let receipt_handle = format!("receipt-{id}");
        self.state.visible.lock().unwrap().push_back(ReceivedMessage {
            message_id: Some(format!("msg-{id}")),
            receipt_handle: receipt_handle.clone(),
            body: body.to_string(),
        });
        receipt_handle
    }

    /// Makes every received-but-undeleted message visible again.
    pub fn expire_visibility(&self) {
        let expired: Vec<_> = self.state.invisible.lock().unwrap().drain(..).collect();
        self.state.visible.lock().unwrap().extend(expired);
    }

    pub fn sent(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().unwrap().clone()
    }

    pub fn invisible_receipts(&self) -> Vec<String> {
        self.state
            .invisible
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.receipt_handle.clone())
            .collect()
    }

    pub fn resolve_calls(&self) -> usize {
        self.state.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn receive_calls(&self) -> usize {
        self.state.receive_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqsApi for FakeSqs {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        self.state.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_resolve.load(Ordering::SeqCst) {
            bail!("queue {queue_name} does not exist");
        }
        Ok(format!("https://sqs.local/000000000000/{queue_name}"))
    }

    async fn send(
        &self,
        _queue_url: &str,
        body: String,
        attributes: BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        if self.state.fail_send.load(Ordering::SeqCst) {
            bail!("send refused by fake queue");
        }
        self.state
            .sent
            .lock()
            .unwrap()
            .push((body.clone(), attributes));
        let receipt = self.inject(&body);
        Ok(Some(receipt.replace("receipt-", "msg-")))
    }

    async fn receive(
        &self,
        _queue_url: &str,
        max_messages: i32,
        _wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        self.state.receive_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.state.receive_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failing = self
            .state
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            bail!("receive refused by fake queue");
        }

        let batch: Vec<ReceivedMessage> = {
            let mut visible = self.state.visible.lock().unwrap();
            let take = visible.len().min(max_messages.max(0) as usize);
            visible.drain(..take).collect()
        };
        self.state
            .invisible
            .lock()
            .unwrap()
            .extend(batch.iter().cloned());

        if batch.is_empty() && delay == 0 {
            // Stand-in for the long-poll wait.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(batch)
    }

    async fn delete(&self, _queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.state
            .invisible
            .lock()
            .unwrap()
            .retain(|message| message.receipt_handle != receipt_handle);
        self.state
            .deleted
            .lock()
            .unwrap()
            .push(receipt_handle.to_string());
        Ok(())
    }
}
