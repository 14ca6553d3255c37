use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::QueueError;

/// Broker backends known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Sqs,
    RabbitMq,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::RabbitMq, Provider::Sqs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Sqs => "sqs",
            Provider::RabbitMq => "rabbitmq",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied processing step for delivered envelopes.
///
/// An `Err` tells the adapter the message was not handled; it will be
/// redelivered (nack with requeue, or left undeleted until the visibility
/// timeout expires). Handlers must therefore tolerate duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

pub type SharedHandler = Arc<dyn MessageHandler>;

/// Capability set every broker adapter provides.
#[async_trait]
pub trait QueueService: Send + Sync {
    fn provider(&self) -> Provider;

    /// Sends one envelope. Failures are always returned to the caller.
    async fn publish(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Registers `handler` and starts delivering messages to it.
    async fn subscribe(&self, handler: SharedHandler) -> Result<(), QueueError>;

    /// Stops delivery and releases backend resources. Never fails; calling
    /// it again is a no-op.
    async fn close(&self);
}

pub type SharedQueueService = Arc<dyn QueueService>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Degraded = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Degraded,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Lock-free holder for an adapter's [`ConnectionState`], shareable with
/// backend callbacks.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Moves `from -> to` only if the current state is `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the adapter closed, returning the state it was in before.
    pub(crate) fn close(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(ConnectionState::Closed as u8, Ordering::SeqCst))
    }
}
