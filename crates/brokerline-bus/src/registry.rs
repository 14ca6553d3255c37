use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::QueueConfig;
use crate::error::{ConfigError, QueueError};
use crate::service::{Provider, SharedQueueService};

/// Builds an adapter from configuration. Factories validate the settings
/// they need before touching the network.
pub type AdapterFactory = Arc<
    dyn Fn(QueueConfig) -> BoxFuture<'static, Result<SharedQueueService, QueueError>>
        + Send
        + Sync,
>;

/// Provider name -> adapter constructor.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    entries: BTreeMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the adapters shipped with this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.entries.insert(
            Provider::Sqs.as_str().to_string(),
            Arc::new(|config: QueueConfig| async move { build_sqs(&config).await }.boxed()),
        );
        registry.entries.insert(
            Provider::RabbitMq.as_str().to_string(),
            Arc::new(|config: QueueConfig| async move { build_rabbitmq(&config).await }.boxed()),
        );
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: AdapterFactory,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(ConfigError::AlreadyRegistered(name));
        }
        self.entries.insert(name, factory);
        Ok(())
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Looks up `name` and builds the adapter. Unknown names fail before any
    /// backend is contacted.
    pub async fn build(
        &self,
        name: &str,
        config: &QueueConfig,
    ) -> Result<SharedQueueService, QueueError> {
        let factory = self.entries.get(name).ok_or_else(|| ConfigError::UnknownProvider {
            name: name.to_string(),
            available: self.names().join(", "),
        })?;
        let service = factory(config.clone()).await?;
        info!(provider = %name, "queue adapter ready");
        Ok(service)
    }
}

/// Picks the provider name: explicit override first, then `QUEUE_PROVIDER`.
pub fn resolve_provider(
    registry: &AdapterRegistry,
    config: &QueueConfig,
    provider_override: Option<&str>,
) -> Result<String, ConfigError> {
    provider_override
        .map(str::to_string)
        .or_else(|| config.provider.clone())
        .ok_or_else(|| ConfigError::ProviderUnset {
            available: registry.names().join(", "),
        })
}

/// Builds the single adapter this process runs with, from the builtin registry.
pub async fn select(
    config: &QueueConfig,
    provider_override: Option<&str>,
) -> Result<SharedQueueService, QueueError> {
    let registry = AdapterRegistry::builtin();
    let name = resolve_provider(&registry, config, provider_override)?;
    registry.build(&name, config).await
}

#[cfg(feature = "sqs")]
async fn build_sqs(config: &QueueConfig) -> Result<SharedQueueService, QueueError> {
    let settings = config.sqs()?;
    let queue = crate::sqs::PollingQueue::connect(settings).await?;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "sqs"))]
async fn build_sqs(config: &QueueConfig) -> Result<SharedQueueService, QueueError> {
    config.sqs()?;
    Err(ConfigError::ProviderUnavailable(Provider::Sqs.as_str().to_string()).into())
}

#[cfg(feature = "rabbitmq")]
async fn build_rabbitmq(config: &QueueConfig) -> Result<SharedQueueService, QueueError> {
    let settings = config.rabbitmq()?;
    let queue = crate::rabbitmq::TopicExchangeQueue::connect(settings).await?;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "rabbitmq"))]
async fn build_rabbitmq(config: &QueueConfig) -> Result<SharedQueueService, QueueError> {
    config.rabbitmq()?;
    Err(ConfigError::ProviderUnavailable(Provider::RabbitMq.as_str().to_string()).into())
}
