// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Context
//!
//! Retry bookkeeping derived from broker headers and the info object handed to
//! message handlers. Headers are untyped: every read has an explicit default
//! and nothing assumes a header is present.

use crate::channel::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::Context;
use serde_json::{Map, Value};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the reason field in the x-death header
pub const AMQP_HEADERS_REASON: &str = "reason";
/// Constant for the redelivery counter set by quorum queues
pub const AMQP_HEADERS_X_DELIVERY_COUNT: &str = "x-delivery-count";

pub const INFO_REDELIVERED: &str = "redelivered";
pub const INFO_DLX_RETRY_COUNT: &str = "dlx_retry_count";
pub const INFO_DLX_LAST_FAIL_REASON: &str = "dlx_last_fail_reason";
pub const INFO_QUORUM_DELIVERY_COUNT: &str = "quorum-delivery-count";

/// Retry information of one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetadata {
    /// Whether the broker flagged the delivery as a redelivery.
    pub redelivered: bool,
    /// Times the message went through the dead letter exchange.
    pub dlx_retry_count: i64,
    /// Reason recorded by the broker on the last dead-lettering.
    pub dlx_last_fail_reason: Option<String>,
    /// Times a quorum queue redelivered the message.
    pub quorum_delivery_count: i64,
}

impl RetryMetadata {
    pub fn from_delivery(delivery: &Delivery) -> RetryMetadata {
        Self::from_headers(&delivery.headers, delivery.redelivered)
    }

    pub fn from_headers(headers: &FieldTable, redelivered: bool) -> RetryMetadata {
        let headers = headers.inner();

        // only the most recent death entry counts
        let last_death = headers
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(AMQPValue::as_array)
            .and_then(|deaths| deaths.as_slice().first())
            .and_then(AMQPValue::as_field_table);

        let dlx_retry_count = last_death
            .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
            .and_then(as_i64)
            .unwrap_or(0);

        let dlx_last_fail_reason = last_death
            .and_then(|death| death.inner().get(AMQP_HEADERS_REASON))
            .and_then(as_string);

        let quorum_delivery_count = headers
            .get(AMQP_HEADERS_X_DELIVERY_COUNT)
            .and_then(as_i64)
            .unwrap_or(0);

        RetryMetadata {
            redelivered,
            dlx_retry_count,
            dlx_last_fail_reason,
            quorum_delivery_count,
        }
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        _ => None,
    }
}

/// Which optional entries a [`MessageContext`] carries. Fixed per connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub requeue: bool,
    pub dead_letter: bool,
    pub quorum: bool,
}

/// Dead letter bookkeeping exposed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterInfo {
    pub retry_count: i64,
    pub last_fail_reason: Option<String>,
}

/// Info object passed to the message handler alongside the message.
///
/// Only the entries relevant to the connector configuration are present:
/// `redelivered` when failed messages are requeued, the dead letter entries
/// when the queue has a dead letter exchange, and the quorum delivery count for
/// quorum queues.
#[derive(Debug, Clone)]
pub struct MessageContext {
    queue: String,
    delivery_tag: u64,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    redelivered: Option<bool>,
    dead_letter: Option<DeadLetterInfo>,
    quorum_delivery_count: Option<i64>,
    trace_context: Context,
}

impl MessageContext {
    pub fn new(queue: &str, delivery: &Delivery, flags: ContextFlags) -> MessageContext {
        let metadata = RetryMetadata::from_delivery(delivery);

        MessageContext {
            queue: queue.to_owned(),
            delivery_tag: delivery.delivery_tag,
            reply_to: delivery.reply_to.clone(),
            correlation_id: delivery.correlation_id.clone(),
            redelivered: flags.requeue.then_some(metadata.redelivered),
            dead_letter: flags.dead_letter.then(|| DeadLetterInfo {
                retry_count: metadata.dlx_retry_count,
                last_fail_reason: metadata.dlx_last_fail_reason.clone(),
            }),
            quorum_delivery_count: flags.quorum.then_some(metadata.quorum_delivery_count),
            trace_context: Context::new(),
        }
    }

    pub(crate) fn with_trace_context(mut self, ctx: Context) -> Self {
        self.trace_context = ctx;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn redelivered(&self) -> Option<bool> {
        self.redelivered
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterInfo> {
        self.dead_letter.as_ref()
    }

    pub fn dlx_retry_count(&self) -> Option<i64> {
        self.dead_letter.as_ref().map(|info| info.retry_count)
    }

    pub fn quorum_delivery_count(&self) -> Option<i64> {
        self.quorum_delivery_count
    }

    /// Trace context extracted from the message headers.
    pub fn trace_context(&self) -> &Context {
        &self.trace_context
    }

    /// The info entries keyed by their wire names.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut info = Map::new();

        if let Some(redelivered) = self.redelivered {
            info.insert(INFO_REDELIVERED.to_owned(), Value::from(redelivered));
        }

        if let Some(dlx) = &self.dead_letter {
            info.insert(INFO_DLX_RETRY_COUNT.to_owned(), Value::from(dlx.retry_count));
            info.insert(
                INFO_DLX_LAST_FAIL_REASON.to_owned(),
                dlx.last_fail_reason.clone().map_or(Value::Null, Value::from),
            );
        }

        if let Some(count) = self.quorum_delivery_count {
            info.insert(INFO_QUORUM_DELIVERY_COUNT.to_owned(), Value::from(count));
        }

        info
    }
}
