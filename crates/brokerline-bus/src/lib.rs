//! Provider-agnostic queue facade.
//!
//! Application code talks to a [`QueueService`] and never to a broker client
//! directly. Two adapters ship with the crate:
//!
//! * [`rabbitmq::TopicExchangeQueue`] pushes deliveries from a durable queue
//!   bound to a topic exchange and acknowledges them manually.
//! * [`sqs::PollingQueue`] long-polls a queue and deletes each message once
//!   the handler accepted it.
//!
//! [`AdapterRegistry`] picks one of them from configuration at startup.
//!
//! ```no_run
//! use std::sync::Arc;
//! use brokerline_bus::{Envelope, QueueConfig, SharedHandler, select};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = QueueConfig::from_env();
//! let queue = select(&config, None).await?;
//! let handler: SharedHandler = Arc::new(|envelope: Envelope| async move {
//!     tracing::info!(message_type = %envelope.kind, "received");
//!     anyhow::Ok(())
//! });
//! queue.subscribe(handler).await?;
//! queue.publish(&Envelope::new("order.created")).await?;
//! queue.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod rabbitmq;
pub mod registry;
pub mod service;
pub mod sqs;

pub use config::{QueueConfig, QueueLocator, RabbitMqSettings, SqsCredentials, SqsSettings};
pub use envelope::Envelope;
pub use error::{ConfigError, QueueError};
pub use memory::InMemoryQueue;
pub use rabbitmq::TopicExchangeQueue;
pub use registry::{AdapterFactory, AdapterRegistry, resolve_provider, select};
pub use service::{
    ConnectionState, MessageHandler, Provider, QueueService, SharedHandler, SharedQueueService,
};
pub use sqs::PollingQueue;
