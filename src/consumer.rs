// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the processing of a single delivery on a worker thread:
//! deserialization, retry metadata, the user handler, and the resulting
//! acknowledgement decision. Workers never touch the channel. Their decisions
//! are submitted to the consumer loop, which owns the channel and applies them.

use crate::{
    channel::Delivery,
    codec,
    context::{ContextFlags, MessageContext},
    errors::AmqpError,
    otel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{
    any::Any,
    borrow::Cow,
    error::Error,
    panic::{self, AssertUnwindSafe},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, info_span};

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Processes deserialized messages on a worker thread.
///
/// Any returned error, or a panic, rejects the message.
pub trait MessageHandler<M>: Send + Sync + 'static {
    fn handle(&self, message: M, context: &MessageContext) -> Result<(), HandlerError>;
}

impl<M, F> MessageHandler<M> for F
where
    F: Fn(M, &MessageContext) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: M, context: &MessageContext) -> Result<(), HandlerError> {
        self(message, context)
    }
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    DeserializeFailure(String),
    CallbackFailure(String),
}

impl ProcessingOutcome {
    /// The acknowledgement owed to the broker for this outcome.
    pub fn decision(&self, delivery_tag: u64, requeue: bool) -> Decision {
        match self {
            ProcessingOutcome::Success => Decision::Ack { delivery_tag },
            ProcessingOutcome::DeserializeFailure(_) | ProcessingOutcome::CallbackFailure(_) => {
                Decision::Reject {
                    delivery_tag,
                    requeue,
                }
            }
        }
    }

    /// Failures become the worker's error so they stay visible after the
    /// decision was submitted.
    pub fn into_result(self) -> Result<(), AmqpError> {
        match self {
            ProcessingOutcome::Success => Ok(()),
            ProcessingOutcome::DeserializeFailure(err) => Err(AmqpError::ParsePayloadError(err)),
            ProcessingOutcome::CallbackFailure(err) => Err(AmqpError::CallbackError(err)),
        }
    }
}

/// Acknowledgement to apply on the channel that received the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ack { delivery_tag: u64 },
    Reject { delivery_tag: u64, requeue: bool },
}

impl Decision {
    pub fn delivery_tag(&self) -> u64 {
        match self {
            Decision::Ack { delivery_tag } | Decision::Reject { delivery_tag, .. } => {
                *delivery_tag
            }
        }
    }
}

/// Worker side of the decision queue of one channel session.
#[derive(Debug, Clone)]
pub struct DecisionSender {
    queue: String,
    tx: UnboundedSender<Decision>,
}

impl DecisionSender {
    pub(crate) fn new(queue: &str, tx: UnboundedSender<Decision>) -> DecisionSender {
        DecisionSender {
            queue: queue.to_owned(),
            tx,
        }
    }

    /// Hands the decision to the consumer loop. When the session that owned
    /// the delivery is gone the decision is dropped; the broker redelivers the
    /// message after reconnect.
    pub fn submit(&self, decision: Decision) {
        debug!(
            queue = %self.queue,
            delivery_tag = decision.delivery_tag(),
            "submitting {:?}",
            decision
        );

        if let Err(err) = self.tx.send(decision) {
            error!(
                queue = %self.queue,
                delivery_tag = decision.delivery_tag(),
                error = err.to_string(),
                "sending decision failed, channel closed"
            );
        }
    }
}

/// Settings a worker needs, fixed per connector.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub(crate) queue: String,
    pub(crate) requeue: bool,
    pub(crate) flags: ContextFlags,
}

/// Processes one delivery and submits the resulting decision.
///
/// Runs on a worker thread. Returns an error for deserialization and handler
/// failures after their reject was submitted.
pub(crate) fn process_delivery<M, H>(
    delivery: Delivery,
    settings: &WorkerSettings,
    handler: &H,
    decisions: &DecisionSender,
) -> Result<(), AmqpError>
where
    M: DeserializeOwned,
    H: MessageHandler<M> + ?Sized,
{
    let tag = delivery.delivery_tag;
    let queue = settings.queue.as_str();

    let worker_span = info_span!("worker", name = %format!("message # {}, queue {}", tag, queue));
    let _entered = worker_span.enter();

    let tracer = global::tracer(otel::CONSUMER_TRACER);
    let (trace_ctx, mut span) = otel::new_span(&delivery.headers, &tracer, queue);

    debug!(queue, delivery_tag = tag, "deserializing body");
    let outcome = match codec::decode::<M>(&delivery.body) {
        Err(err) => {
            error!(
                queue,
                delivery_tag = tag,
                error = err.to_string(),
                "deserializing body failed"
            );
            ProcessingOutcome::DeserializeFailure(err.to_string())
        }
        Ok(message) => {
            let context =
                MessageContext::new(queue, &delivery, settings.flags).with_trace_context(trace_ctx);

            info!(queue, delivery_tag = tag, "processing message");
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message, &context))) {
                Ok(Ok(())) => ProcessingOutcome::Success,
                Ok(Err(err)) => {
                    error!(
                        queue,
                        delivery_tag = tag,
                        error = err.to_string(),
                        "processing message in callback failed"
                    );
                    ProcessingOutcome::CallbackFailure(err.to_string())
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(
                        queue,
                        delivery_tag = tag,
                        error = %msg,
                        "processing message in callback panicked"
                    );
                    ProcessingOutcome::CallbackFailure(msg)
                }
            }
        }
    };

    match &outcome {
        ProcessingOutcome::Success => span.set_status(Status::Ok),
        ProcessingOutcome::DeserializeFailure(msg) | ProcessingOutcome::CallbackFailure(msg) => {
            span.set_status(Status::Error {
                description: Cow::from(msg.clone()),
            })
        }
    }
    span.end();

    decisions.submit(outcome.decision(tag, settings.requeue));

    outcome.into_result()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_owned()
    }
}
