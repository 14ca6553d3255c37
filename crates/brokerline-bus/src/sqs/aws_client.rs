use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::{Credentials, Region};
use aws_sdk_sqs::types::MessageAttributeValue;

use super::{ReceivedMessage, SqsApi};
use crate::config::SqsSettings;

const ALL_ATTRIBUTES: &str = "All";

/// [`SqsApi`] backed by the AWS SDK client.
#[derive(Clone)]
pub struct AwsSqsApi {
    client: Client,
}

impl AwsSqsApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Region is mandatory; endpoint and static credentials override the
    /// default provider chain when present (e.g. LocalStack).
    pub async fn from_settings(settings: &SqsSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let Some(credentials) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                None,
                None,
                "brokerline-static",
            ));
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

#[async_trait]
impl SqsApi for AwsSqsApi {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .with_context(|| format!("get url of sqs queue {queue_name}"))?;
        output
            .queue_url
            .with_context(|| format!("sqs returned no url for queue {queue_name}"))
    }

    async fn send(
        &self,
        queue_url: &str,
        body: String,
        attributes: BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let mut request = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(body);
        for (name, value) in attributes {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .with_context(|| format!("build sqs attribute {name}"))?;
            request = request.message_attributes(name, attribute);
        }
        let output = request.send().await.context("send sqs message")?;
        Ok(output.message_id)
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time.as_secs().min(20) as i32)
            .message_attribute_names(ALL_ATTRIBUTES)
            .send()
            .await
            .context("receive sqs messages")?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                Some(ReceivedMessage {
                    message_id: message.message_id,
                    receipt_handle: message.receipt_handle?,
                    body: message.body.unwrap_or_default(),
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("delete sqs message")?;
        Ok(())
    }
}
