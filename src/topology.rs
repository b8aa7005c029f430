// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the connector's queue together with its optional dead
//! letter exchange and quorum arguments. Declaration is repeated on every
//! (re)connect: the broker treats an identical re-declaration as a no-op, while
//! a conflicting one closes the channel and surfaces as a channel-level error.

use crate::{
    channel::{BrokerChannel, QueueFlags, QueueState},
    errors::AmqpError,
    queue::QueueConfig,
};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the quorum queue delivery limit argument
pub const AMQP_HEADERS_DELIVERY_LIMIT: &str = "x-delivery-limit";
/// Constant for the quorum queue in-memory message count argument
pub const AMQP_HEADERS_MAX_IN_MEMORY_LENGTH: &str = "x-max-in-memory-length";
/// Constant for the quorum queue in-memory size argument
pub const AMQP_HEADERS_MAX_IN_MEMORY_BYTES: &str = "x-max-in-memory-bytes";
/// Queue type value for quorum queues
pub const QUORUM_QUEUE_TYPE: &str = "quorum";

/// Computes the `queue.declare` arguments for the given queue.
pub fn queue_arguments(def: &QueueConfig) -> FieldTable {
    let mut queue_args = BTreeMap::new();

    if let Some(dlx) = def.dead_letter_exchange_name() {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dlx)),
        );
    }

    if let Some(quorum) = def.quorum_args() {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from(QUORUM_QUEUE_TYPE)),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DELIVERY_LIMIT),
            AMQPValue::LongLongInt(LongLongInt::from(quorum.delivery_limit())),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_IN_MEMORY_LENGTH),
            AMQPValue::LongLongInt(LongLongInt::from(quorum.max_in_memory_length())),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_IN_MEMORY_BYTES),
            AMQPValue::LongLongInt(LongLongInt::from(quorum.max_in_memory_bytes())),
        );
    }

    FieldTable::from(queue_args)
}

/// Declares the queue, and when dead-lettering is enabled, the `dlx.<queue>`
/// exchange bound back to the queue with the queue name as routing key.
///
/// Returns the queue statistics reported by the broker.
pub async fn declare(
    channel: &dyn BrokerChannel,
    def: &QueueConfig,
) -> Result<QueueState, AmqpError> {
    debug!("creating queue: {}", def.name());

    let state = match channel
        .queue_declare(
            def.name(),
            QueueFlags {
                durable: def.is_durable(),
                exclusive: def.is_exclusive(),
                auto_delete: def.is_auto_delete(),
            },
            queue_arguments(def),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = def.name(),
                "error to declare the queue"
            );
            Err(err)
        }
        Ok(state) => {
            debug!("queue: {} was created", def.name());
            Ok(state)
        }
    }?;

    if let Some(dlx) = def.dead_letter_exchange_name() {
        declare_dead_letter_exchange(channel, def, &dlx).await?;
    }

    Ok(state)
}

async fn declare_dead_letter_exchange(
    channel: &dyn BrokerChannel,
    def: &QueueConfig,
    dlx: &str,
) -> Result<(), AmqpError> {
    if let Err(err) = channel.exchange_declare(dlx, def.is_durable()).await {
        error!(
            error = err.to_string(),
            exchange = dlx,
            "error to declare the dead letter exchange"
        );
        return Err(err);
    }

    if let Err(err) = channel.queue_bind(def.name(), dlx, def.name()).await {
        error!(
            error = err.to_string(),
            exchange = dlx,
            queue = def.name(),
            "error to bind queue to the dead letter exchange"
        );
        return Err(err);
    }

    info!(
        exchange = dlx,
        queue = def.name(),
        "dead letter exchange enabled"
    );

    Ok(())
}
