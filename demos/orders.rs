// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publishes a few orders and consumes them until Ctrl-C.
//!
//! Reads the broker address from `RABBITMQ_*` variables (or a `.env` file):
//!
//! ```text
//! RABBITMQ_HOST=localhost RUST_LOG=info cargo run --example orders
//! ```

use rabbitmq_connector::{
    AmqpError, ConnectionParams, ConnectorConfig, HandlerError, MessageContext, QueueConfig,
    QueueConnector, RabbitMQConnector,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stop consuming above 512 MiB of resident memory.
const MAX_ALLOWED_MEMORY: u64 = 512 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u64,
    product: String,
    quantity: u32,
}

fn handle_order(order: Order, info: &MessageContext) -> Result<(), HandlerError> {
    if order.quantity == 0 {
        return Err(format!("order {} has no items", order.id).into());
    }

    info!(
        id = order.id,
        product = %order.product,
        retries = ?info.dlx_retry_count(),
        "order processed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lapin=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let params = ConnectionParams::from_env()?;
    let queue = QueueConfig::new("orders").dead_letter_exchange(true);
    let mut connector = RabbitMQConnector::with_params(params, ConnectorConfig::new(queue));

    connector.open().await?;
    info!(ready = connector.message_count()?, "queue opened");

    for (id, product, quantity) in [(1, "coffee", 2), (2, "bagel", 0), (3, "tea", 1)] {
        let order = Order {
            id,
            product: product.to_owned(),
            quantity,
        };
        connector.publish(&order).await?;
    }

    let result = connector
        .consume_forever(handle_order, Some(MAX_ALLOWED_MEMORY))
        .await;
    connector.close().await;
    result
}
