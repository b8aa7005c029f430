// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Loop
//!
//! The consumer loop owns the channel. It pulls one delivery at a time
//! (prefetch 1), hands each to a worker on the blocking pool and applies the
//! ack/reject decisions the workers send back through the session's decision
//! queue. Connection-level failures are retried forever with a fixed backoff;
//! channel-level failures, resource exhaustion and cancellation stop it.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Consuming -> Disconnected (connection error) -> Connecting ...
//!                                         \-> Stopped (channel error, memory, cancellation)
//! ```

use crate::{
    channel::{BrokerChannel, Transport},
    connection::ConnectionManager,
    consumer::{process_delivery, Decision, DecisionSender, MessageHandler, WorkerSettings},
    errors::{AmqpError, ErrorLevel},
    guard::ResourceGuard,
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Bounds the unacknowledged deliveries per channel, and with it the number of
/// busy workers.
pub const PREFETCH_COUNT: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Stopped,
}

/// How a channel session ended without an error.
enum SessionEnd {
    Cancelled,
}

pub(crate) struct ConsumerLoop<'a, T: Transport> {
    pub(crate) connection: &'a mut ConnectionManager<T>,
    pub(crate) guard: &'a ResourceGuard,
    pub(crate) state: &'a watch::Sender<ConsumerState>,
    pub(crate) settings: WorkerSettings,
    pub(crate) consumer_tag: String,
    pub(crate) backoff: Duration,
    pub(crate) max_allowed_memory: Option<u64>,
}

impl<T: Transport> ConsumerLoop<'_, T> {
    fn set_state(&self, state: ConsumerState) {
        debug!(queue = %self.settings.queue, "consumer state {:?}", state);
        self.state.send_replace(state);
    }

    /// Consumes until `shutdown` resolves or a non-recoverable error occurs.
    /// The consumer registration is cancelled on every exit path.
    pub(crate) async fn run<M, H, S>(mut self, handler: Arc<H>, shutdown: S) -> Result<(), AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let result = self.consume(handler, shutdown.as_mut()).await;

        self.stop_consuming().await;
        self.set_state(ConsumerState::Stopped);

        result
    }

    async fn consume<M, H, S>(
        &mut self,
        handler: Arc<H>,
        mut shutdown: Pin<&mut S>,
    ) -> Result<(), AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
        S: Future<Output = ()> + Send,
    {
        if !self.connection.is_open() {
            self.set_state(ConsumerState::Connecting);
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                opened = self.connection.open() => { opened?; }
            }
        }

        loop {
            let channel = self.connection.session()?.channel().clone();

            let err = match self
                .consume_session(channel, handler.clone(), shutdown.as_mut())
                .await
            {
                Ok(SessionEnd::Cancelled) => {
                    info!(queue = %self.settings.queue, "consumption cancelled");
                    return Ok(());
                }
                Err(err) => err,
            };

            match err.level() {
                ErrorLevel::Connection => {
                    warn!(
                        queue = %self.settings.queue,
                        error = err.to_string(),
                        "connection lost, retrying..."
                    );
                    self.set_state(ConsumerState::Disconnected);

                    tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }

                    self.set_state(ConsumerState::Connecting);
                    tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        reopened = self.connection.reconnect() => { reopened?; }
                    }
                }
                ErrorLevel::Channel => {
                    error!(
                        queue = %self.settings.queue,
                        error = err.to_string(),
                        "channel failure, stopping..."
                    );
                    return Err(err);
                }
                ErrorLevel::Local => {
                    error!(
                        queue = %self.settings.queue,
                        error = err.to_string(),
                        "consumer failure, stopping..."
                    );
                    return Err(err);
                }
                ErrorLevel::Fatal => return Err(err),
            }
        }
    }

    /// Consumes on one channel until it fails or `shutdown` resolves.
    async fn consume_session<M, H, S>(
        &mut self,
        channel: Arc<dyn BrokerChannel>,
        handler: Arc<H>,
        mut shutdown: Pin<&mut S>,
    ) -> Result<SessionEnd, AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
        S: Future<Output = ()> + Send,
    {
        debug!(queue = %self.settings.queue, "starting consumption");
        channel.basic_qos(PREFETCH_COUNT).await?;
        let mut deliveries = channel
            .basic_consume(&self.settings.queue, &self.consumer_tag)
            .await?;
        self.set_state(ConsumerState::Consuming);

        // decisions of workers from an earlier session cannot reach this one
        let (tx, mut decisions) = mpsc::unbounded_channel();
        let sender = DecisionSender::new(&self.settings.queue, tx);
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => return Ok(SessionEnd::Cancelled),

                Some(decision) = decisions.recv() => {
                    self.apply(channel.as_ref(), decision).await?;
                }

                Some(joined) = workers.join_next() => {
                    self.reap(joined);
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let tag = delivery.delivery_tag;
                        info!(queue = %self.settings.queue, delivery_tag = tag, "received message");

                        let settings = self.settings.clone();
                        let handler = handler.clone();
                        let sender = sender.clone();
                        workers.spawn_blocking(move || {
                            process_delivery::<M, H>(delivery, &settings, handler.as_ref(), &sender)
                                .map_err(|err| (tag, err))
                        });

                        self.guard.check(self.max_allowed_memory)?;
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(AmqpError::ConnectionError(
                            "delivery stream closed".to_owned(),
                        ))
                    }
                },
            }
        }
    }

    async fn apply(&self, channel: &dyn BrokerChannel, decision: Decision) -> Result<(), AmqpError> {
        match decision {
            Decision::Ack { delivery_tag } => {
                channel.basic_ack(delivery_tag).await?;
                info!(queue = %self.settings.queue, delivery_tag, "sent ack");
            }
            Decision::Reject {
                delivery_tag,
                requeue,
            } => {
                channel.basic_reject(delivery_tag, requeue).await?;
                info!(
                    queue = %self.settings.queue,
                    delivery_tag,
                    requeue,
                    "sent reject"
                );
            }
        }
        Ok(())
    }

    fn reap(&self, joined: Result<Result<(), (u64, AmqpError)>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err((delivery_tag, err))) => error!(
                queue = %self.settings.queue,
                delivery_tag,
                error = err.to_string(),
                "worker failed"
            ),
            Err(err) => error!(
                queue = %self.settings.queue,
                error = err.to_string(),
                "worker aborted"
            ),
        }
    }

    async fn stop_consuming(&self) {
        debug!(queue = %self.settings.queue, "stopping consumption");

        let Ok(session) = self.connection.session() else {
            return;
        };

        if let Err(err) = session.channel().basic_cancel(&self.consumer_tag).await {
            debug!(
                queue = %self.settings.queue,
                error = err.to_string(),
                "ignored error while cancelling consumer"
            );
        }
    }
}
