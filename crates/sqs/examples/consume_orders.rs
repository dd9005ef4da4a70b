// SPDX-License-Identifier: Apache-2.0

//! Minimal consumer: drain the `orders` queue for a minute, logging every
//! payload.
//!
//! Credentials and region come from the ambient AWS environment, so this
//! runs as-is against a real queue or a local emulator:
//!
//! ```sh
//! AWS_ENDPOINT_URL=http://localhost:4566 cargo run --example consume_orders
//! ```

use siphon_config::ContainerConfig;
use siphon_engine::{BoxError, ListenerContainer, MessageContext, QueueListener};
use siphon_sqs::SqsQueueClient;
use std::time::Duration;

struct LogListener;

#[async_trait::async_trait]
impl QueueListener<serde_json::Value> for LogListener {
    async fn on_message(
        &self,
        payload: serde_json::Value,
        ctx: &MessageContext,
    ) -> Result<(), BoxError> {
        tracing::info!(
            message.id = %ctx.message_id(),
            receive.count = ctx.approx_receive_count(),
            %payload,
            "order received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ContainerConfig::for_queue("orders");
    config.max_concurrent_messages = 8;
    config.batch_ack.enabled = true;

    let container = ListenerContainer::builder(config)
        .client(SqsQueueClient::from_env().await)
        .listener(LogListener)
        .build()?;
    container.start().await?;

    tokio::time::sleep(Duration::from_secs(60)).await;
    container.stop().await;
    Ok(())
}
