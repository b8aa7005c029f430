// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the broker surface the connector relies on and its
//! implementation on top of `lapin`.
//!
//! A [`Transport`] opens one physical connection together with its single
//! channel, handed out as a [`BrokerChannel`]. Closing the channel handle closes
//! the connection too: the pair is always created and discarded as a unit and is
//! never repaired in place.

use crate::{config::ConnectionParams, errors::AmqpError};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{future::Future, sync::Arc};
use tracing::{debug, error};

/// Stream of deliveries of one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// One message handed over by the broker.
///
/// The delivery tag is only meaningful on the channel that produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: FieldTable,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let properties = &delivery.properties;

        Delivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            headers: properties.headers().clone().unwrap_or_default(),
            reply_to: properties.reply_to().as_ref().map(|v| v.to_string()),
            correlation_id: properties.correlation_id().as_ref().map(|v| v.to_string()),
            body: delivery.data,
        }
    }
}

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishConfirm {
    /// Routed and accepted.
    Ack,
    /// Returned as unroutable or negatively confirmed.
    Unroutable(String),
}

/// Queue statistics from the declare-ok frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Declare flags sent with `queue.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// The AMQP 0-9-1 operations used by the connector.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Switches the channel to publisher confirms.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: FieldTable,
    ) -> Result<QueueState, AmqpError>;

    /// Declares a direct exchange.
    async fn exchange_declare(&self, name: &str, durable: bool) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Registers a consumer with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Publishes a mandatory message and waits for the broker confirmation.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Closes the channel, then the connection it lives on.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens connection/channel pairs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// [`Transport`] backed by a real RabbitMQ broker.
pub struct LapinTransport {
    params: ConnectionParams,
}

impl LapinTransport {
    pub fn new(params: ConnectionParams) -> LapinTransport {
        LapinTransport { params }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.params).await?;
        Ok(Arc::new(LapinChannel { conn, channel }))
    }
}

/// Creates a new AMQP connection and a channel on it.
pub async fn new_amqp_channel(
    params: &ConnectionParams,
) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(params.connection_name.clone()));

    let conn = match Connection::connect(&params.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), host = %params.host, "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::from(err))
        }
    }
}

/// A lapin connection and its only channel.
pub struct LapinChannel {
    conn: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?)
    }

    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: FieldTable,
    ) -> Result<QueueState, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: flags.durable,
                    exclusive: flags.exclusive,
                    auto_delete: flags.auto_delete,
                    nowait: false,
                },
                arguments,
            )
            .await?;

        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn exchange_declare(&self, name: &str, durable: bool) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|result| result.map(Delivery::from).map_err(AmqpError::from))
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body,
                properties,
            )
            .await?
            .await?;

        Ok(match confirm {
            Confirmation::Ack(None) | Confirmation::NotRequested => PublishConfirm::Ack,
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                PublishConfirm::Unroutable(format!(
                    "{} {}",
                    returned.reply_code, returned.reply_text
                ))
            }
            Confirmation::Nack(None) => PublishConfirm::Unroutable("nack".to_owned()),
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?)
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        Ok(self
            .channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        close_pair(self.channel.close(200, "OK"), self.conn.close(200, "OK")).await
    }
}

/// Closes the channel, then the connection, even when the channel close
/// failed. A channel already closed by the broker must not keep the
/// connection alive.
///
/// # Returns
/// The first error encountered, if any
async fn close_pair<C, K>(channel: C, connection: K) -> Result<(), AmqpError>
where
    C: Future<Output = Result<(), lapin::Error>>,
    K: Future<Output = Result<(), lapin::Error>>,
{
    let channel = channel.await.map_err(AmqpError::from);
    let connection = connection.await.map_err(AmqpError::from);
    channel.and(connection)
}
