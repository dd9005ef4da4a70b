// SPDX-License-Identifier: Apache-2.0

//! AWS SQS implementation of the siphon queue-client contract.
//!
//! [`SqsQueueClient`] is a thin translation layer: every operation maps onto
//! one SDK call and failures are reported verbatim as transport errors. It
//! performs no retries of its own; retry and backoff policy belongs to the
//! container runtime.

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::SdkError;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, Message, MessageSystemAttributeName,
};
use siphon_engine::{
    DeleteBatchOutcome, DeleteEntry, DeleteFailure, QueueClient, QueueClientError, RawMessage,
    ReceiveRequest,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Queue client backed by `aws-sdk-sqs`.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    client: Client,
}

impl SqsQueueClient {
    /// Wraps an existing SDK client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the ambient AWS environment (region, credentials
    /// provider chain).
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }

    /// The underlying SDK client.
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_messages(
        &self,
        request: ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueClientError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&request.queue_url)
            .wait_time_seconds(seconds(request.poll_timeout))
            .max_number_of_messages(i32::try_from(request.max_messages).unwrap_or(10))
            .set_visibility_timeout(request.visibility_timeout.map(seconds))
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(into_transport)?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|message| raw_message_from(message, &request.queue_url))
            .collect())
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueClientError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(into_transport)?;
        Ok(())
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, QueueClientError> {
        let mut request_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            let request_entry = DeleteMessageBatchRequestEntry::builder()
                .id(entry.id)
                .receipt_handle(entry.receipt_handle)
                .build()
                .map_err(|err| QueueClientError::Malformed(err.to_string()))?;
            request_entries.push(request_entry);
        }
        let output = self
            .client
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(request_entries))
            .send()
            .await
            .map_err(into_transport)?;

        Ok(DeleteBatchOutcome {
            succeeded: output
                .successful()
                .iter()
                .map(|entry| entry.id().to_owned())
                .collect(),
            failed: output
                .failed()
                .iter()
                .map(|entry| DeleteFailure {
                    id: entry.id().to_owned(),
                    code: entry.code().to_owned(),
                    message: entry.message().map(str::to_owned),
                    sender_fault: entry.sender_fault(),
                })
                .collect(),
        })
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueClientError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds(timeout))
            .send()
            .await
            .map_err(into_transport)?;
        Ok(())
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String, QueueClientError> {
        let result = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await;
        match result {
            Ok(output) => output
                .queue_url
                .ok_or_else(|| QueueClientError::Malformed("response without a queue URL".into())),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_queue_does_not_exist())
                {
                    return Err(QueueClientError::NotFound(queue_name.to_owned()));
                }
                Err(into_transport(err))
            }
        }
    }
}

/// The queue service counts whole seconds; sub-second settings round down.
fn seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn into_transport<E>(err: SdkError<E>) -> QueueClientError
where
    E: std::error::Error + Send + Sync + 'static,
{
    QueueClientError::transport(err)
}

fn raw_message_from(message: Message, queue_url: &str) -> RawMessage {
    let system_attributes: HashMap<String, String> = message
        .attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| (name.as_str().to_owned(), value))
        .collect();

    let mut attributes = HashMap::new();
    for (name, value) in message.message_attributes.unwrap_or_default() {
        match value.string_value {
            Some(text) => {
                attributes.insert(name, text);
            }
            None => {
                // Binary attributes have no place in the string attribute
                // map handed to resolvers.
                debug!(attribute = %name, "skipping non-string message attribute");
            }
        }
    }

    RawMessage {
        id: message.message_id.unwrap_or_default(),
        receipt_handle: message.receipt_handle.unwrap_or_default(),
        body: message.body.unwrap_or_default(),
        approx_receive_count: RawMessage::receive_count_from(&system_attributes),
        attributes,
        system_attributes,
        queue_url: queue_url.to_owned(),
    }
}
