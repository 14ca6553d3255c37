use std::time::Duration;

use crate::error::ConfigError;

pub const QUEUE_PROVIDER_ENV: &str = "QUEUE_PROVIDER";
pub const RABBITMQ_URL_ENV: &str = "RABBITMQ_URL";
pub const RABBITMQ_QUEUE_ENV: &str = "RABBITMQ_QUEUE_NAME";
pub const RABBITMQ_EXCHANGE_ENV: &str = "RABBITMQ_EXCHANGE";
pub const RABBITMQ_ROUTING_KEY_ENV: &str = "RABBITMQ_ROUTING_KEY";
pub const AWS_REGION_ENV: &str = "AWS_REGION";
pub const AWS_ENDPOINT_ENV: &str = "AWS_ENDPOINT";
pub const AWS_ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const SQS_QUEUE_URL_ENV: &str = "SQS_QUEUE_URL";

/// Upper bound SQS accepts for one receive call.
pub const SQS_MAX_MESSAGES: i32 = 10;
/// Long-poll wait used for each receive call.
pub const SQS_WAIT_TIME: Duration = Duration::from_secs(20);

/// Raw queue settings as read from the environment.
///
/// Nothing is validated here; each adapter pulls its own typed settings
/// through [`QueueConfig::rabbitmq`] / [`QueueConfig::sqs`] so that only the
/// selected provider's parameters are required.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub provider: Option<String>,
    pub rabbitmq_url: Option<String>,
    pub rabbitmq_queue: Option<String>,
    pub rabbitmq_exchange: Option<String>,
    pub rabbitmq_routing_key: Option<String>,
    pub aws_region: Option<String>,
    pub aws_endpoint: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub sqs_queue: Option<String>,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            provider: get(QUEUE_PROVIDER_ENV),
            rabbitmq_url: get(RABBITMQ_URL_ENV),
            rabbitmq_queue: get(RABBITMQ_QUEUE_ENV),
            rabbitmq_exchange: get(RABBITMQ_EXCHANGE_ENV),
            rabbitmq_routing_key: get(RABBITMQ_ROUTING_KEY_ENV),
            aws_region: get(AWS_REGION_ENV),
            aws_endpoint: get(AWS_ENDPOINT_ENV),
            aws_access_key_id: get(AWS_ACCESS_KEY_ID_ENV),
            aws_secret_access_key: get(AWS_SECRET_ACCESS_KEY_ENV),
            sqs_queue: get(SQS_QUEUE_URL_ENV),
        }
    }

    pub fn rabbitmq(&self) -> Result<RabbitMqSettings, ConfigError> {
        Ok(RabbitMqSettings {
            url: require(&self.rabbitmq_url, RABBITMQ_URL_ENV)?,
            queue: require(&self.rabbitmq_queue, RABBITMQ_QUEUE_ENV)?,
            exchange: require(&self.rabbitmq_exchange, RABBITMQ_EXCHANGE_ENV)?,
            routing_key: require(&self.rabbitmq_routing_key, RABBITMQ_ROUTING_KEY_ENV)?,
        })
    }

    pub fn sqs(&self) -> Result<SqsSettings, ConfigError> {
        let region = require(&self.aws_region, AWS_REGION_ENV)?;
        let queue = QueueLocator::parse(&require(&self.sqs_queue, SQS_QUEUE_URL_ENV)?);
        let credentials = match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(SqsCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing(AWS_SECRET_ACCESS_KEY_ENV)),
            (None, Some(_)) => return Err(ConfigError::Missing(AWS_ACCESS_KEY_ID_ENV)),
        };
        Ok(SqsSettings {
            region,
            endpoint: self.aws_endpoint.clone(),
            credentials,
            queue,
            max_messages: SQS_MAX_MESSAGES,
            wait_time: SQS_WAIT_TIME,
        })
    }
}

fn require(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value.clone().ok_or(ConfigError::Missing(key))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMqSettings {
    pub url: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SqsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for SqsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Where the SQS queue lives: a full URL, or a name resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueLocator {
    Url(String),
    Name(String),
}

impl QueueLocator {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            QueueLocator::Url(raw.to_string())
        } else {
            QueueLocator::Name(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub credentials: Option<SqsCredentials>,
    pub queue: QueueLocator,
    pub max_messages: i32,
    pub wait_time: Duration,
}

impl SqsSettings {
    pub fn new(region: impl Into<String>, queue: QueueLocator) -> Self {
        Self {
            region: region.into(),
            endpoint: None,
            credentials: None,
            queue,
            max_messages: SQS_MAX_MESSAGES,
            wait_time: SQS_WAIT_TIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> QueueConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueueConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn rabbitmq_requires_every_setting() {
        let cfg = config(&[
            (RABBITMQ_URL_ENV, "amqp://localhost:5672"),
            (RABBITMQ_QUEUE_ENV, "orders"),
            (RABBITMQ_EXCHANGE_ENV, "events"),
        ]);
        let err = cfg.rabbitmq().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(RABBITMQ_ROUTING_KEY_ENV)));
    }

    #[test]
    fn rabbitmq_settings_are_read() {
        let cfg = config(&[
            (RABBITMQ_URL_ENV, "amqp://localhost:5672"),
            (RABBITMQ_QUEUE_ENV, "orders"),
            (RABBITMQ_EXCHANGE_ENV, "events"),
            (RABBITMQ_ROUTING_KEY_ENV, "orders.*"),
        ]);
        let settings = cfg.rabbitmq().unwrap();
        assert_eq!(settings.exchange, "events");
        assert_eq!(settings.routing_key, "orders.*");
    }

    #[test]
    fn blank_values_count_as_missing() {
        let cfg = config(&[(QUEUE_PROVIDER_ENV, "   "), (AWS_REGION_ENV, "")]);
        assert_eq!(cfg.provider, None);
        assert!(matches!(
            cfg.sqs().unwrap_err(),
            ConfigError::Missing(AWS_REGION_ENV)
        ));
    }

    #[test]
    fn sqs_queue_locator_distinguishes_url_and_name() {
        let by_url = config(&[
            (AWS_REGION_ENV, "eu-west-1"),
            (SQS_QUEUE_URL_ENV, "http://localhost:4566/000000000000/orders"),
        ]);
        assert_eq!(
            by_url.sqs().unwrap().queue,
            QueueLocator::Url("http://localhost:4566/000000000000/orders".into())
        );

        let by_name = config(&[(AWS_REGION_ENV, "eu-west-1"), (SQS_QUEUE_URL_ENV, "orders")]);
        let settings = by_name.sqs().unwrap();
        assert_eq!(settings.queue, QueueLocator::Name("orders".into()));
        assert_eq!(settings.max_messages, 10);
        assert_eq!(settings.wait_time, Duration::from_secs(20));
    }

    #[test]
    fn sqs_credentials_come_in_pairs() {
        let cfg = config(&[
            (AWS_REGION_ENV, "eu-west-1"),
            (SQS_QUEUE_URL_ENV, "orders"),
            (AWS_ACCESS_KEY_ID_ENV, "AKIA"),
        ]);
        assert!(matches!(
            cfg.sqs().unwrap_err(),
            ConfigError::Missing(AWS_SECRET_ACCESS_KEY_ENV)
        ));
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = SqsCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "shh".into(),
        };
        assert!(!format!("{creds:?}").contains("shh"));
    }
}
