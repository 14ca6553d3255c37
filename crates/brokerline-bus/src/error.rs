use crate::service::Provider;

/// Startup misconfiguration. Always fatal.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Unknown queue provider: \"{name}\". Available providers: {available}")]
    UnknownProvider { name: String, available: String },
    #[error("queue provider not set; set QUEUE_PROVIDER to one of: {available}")]
    ProviderUnset { available: String },
    #[error("queue provider `{0}` was compiled out of this build")]
    ProviderUnavailable(String),
    #[error("provider `{0}` already registered")]
    AlreadyRegistered(String),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0} is not connected")]
    NotConnected(Provider),
    #[error("{0} adapter is closed")]
    Closed(Provider),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("failed to encode envelope")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message body")]
    Decode(#[source] serde_json::Error),
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl QueueError {
    pub(crate) fn backend(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        QueueError::Backend {
            operation,
            source: source.into(),
        }
    }

    /// True when the adapter cannot serve requests until it is rebuilt.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::NotConnected(_) | QueueError::Closed(_))
    }
}
