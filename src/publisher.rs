// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON messages to the connector's queue through the default
//! exchange, persistent and mandatory, on a channel in confirm mode. Messages
//! the broker cannot route are logged and dropped; the caller is not failed.

use crate::{
    channel::{BrokerChannel, PublishConfirm},
    codec::{self, JSON_CONTENT_TYPE},
    errors::AmqpError,
    otel,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info};
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct RabbitMQPublisher<'p> {
    channel: &'p dyn BrokerChannel,
    queue: &'p str,
}

impl<'p> RabbitMQPublisher<'p> {
    pub fn new(channel: &'p dyn BrokerChannel, queue: &'p str) -> RabbitMQPublisher<'p> {
        RabbitMQPublisher { channel, queue }
    }

    /// Serializes and publishes `message`.
    ///
    /// Fails on serialization and broker errors; an unroutable message is
    /// logged and reported as success.
    pub async fn publish<M: Serialize + ?Sized>(&self, message: &M) -> Result<(), AmqpError> {
        debug!(queue = self.queue, "serializing message");
        let body = codec::encode(message)?;

        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        debug!(queue = self.queue, "publishing message");
        match self
            .channel
            .basic_publish("", self.queue, &body, properties)
            .await
        {
            Ok(PublishConfirm::Ack) => {
                info!(queue = self.queue, "published message");
                Ok(())
            }
            Ok(PublishConfirm::Unroutable(reason)) => {
                error!(
                    queue = self.queue,
                    reason = %reason,
                    "publishing failed, message unroutable"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    queue = self.queue,
                    error = err.to_string(),
                    "error publishing message"
                );
                Err(err)
            }
        }
    }
}
