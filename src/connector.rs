// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connector
//!
//! The public entry point: one connector serves one queue over one managed
//! connection. It declares the queue on every (re)connect, publishes JSON
//! messages to it and consumes it with manual acknowledgement.
//!
//! ```ignore
//! let params = ConnectionParams::from_env()?;
//! let config = ConnectorConfig::new(QueueConfig::new("orders").dead_letter_exchange(true));
//! let mut connector = RabbitMQConnector::with_params(params, config);
//!
//! connector.open().await?;
//! connector.publish(&json!({"id": 1})).await?;
//! connector
//!     .consume_forever(|order: Value, info: &MessageContext| -> Result<(), HandlerError> {
//!         println!("{order} {:?}", info.dlx_retry_count());
//!         Ok(())
//!     }, None)
//!     .await?;
//! connector.close().await;
//! ```

use crate::{
    channel::{LapinTransport, Transport},
    config::{ConnectionParams, ConnectorConfig},
    connection::ConnectionManager,
    consumer::{MessageHandler, WorkerSettings},
    context::ContextFlags,
    dispatcher::{ConsumerLoop, ConsumerState},
    errors::AmqpError,
    guard::ResourceGuard,
    publisher::RabbitMQPublisher,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc};
use tokio::sync::watch;
use tracing::error;

/// Queue-level operations of a connector.
#[async_trait]
pub trait QueueConnector {
    /// Consumes the queue until interrupted (Ctrl-C), a channel-level failure
    /// or a memory ceiling breach. Opens the connection first when needed.
    async fn consume_forever<M, H>(
        &mut self,
        handler: H,
        max_allowed_memory: Option<u64>,
    ) -> Result<(), AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>;

    /// Publishes a JSON-serializable message to the queue.
    async fn publish<M>(&self, message: &M) -> Result<(), AmqpError>
    where
        M: Serialize + Sync + ?Sized;

    /// Ready messages reported by the broker at the last (re)connect.
    fn message_count(&self) -> Result<u32, AmqpError>;
}

pub struct RabbitMQConnector<T: Transport> {
    config: ConnectorConfig,
    connection: ConnectionManager<T>,
    guard: ResourceGuard,
    state: watch::Sender<ConsumerState>,
}

impl RabbitMQConnector<LapinTransport> {
    /// Connector talking to a real broker.
    pub fn with_params(
        params: ConnectionParams,
        config: ConnectorConfig,
    ) -> RabbitMQConnector<LapinTransport> {
        RabbitMQConnector::new(LapinTransport::new(params), config)
    }
}

impl<T: Transport> RabbitMQConnector<T> {
    pub fn new(transport: T, config: ConnectorConfig) -> RabbitMQConnector<T> {
        let connection =
            ConnectionManager::new(transport, config.queue.clone(), config.reconnect_backoff);

        RabbitMQConnector {
            config,
            connection,
            guard: ResourceGuard::default(),
            state: watch::Sender::new(ConsumerState::Disconnected),
        }
    }

    /// Replaces the memory probe used for `max_allowed_memory` checks.
    pub fn with_resource_guard(mut self, guard: ResourceGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Follows the consumer state machine.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Connects and declares the topology, retrying connection failures until
    /// the broker is reachable.
    pub async fn open(&mut self) -> Result<(), AmqpError> {
        self.connection.open().await.map(|_| ())
    }

    /// Best-effort disconnect.
    pub async fn close(&mut self) {
        self.connection.close().await;
        self.state.send_replace(ConsumerState::Disconnected);
    }

    /// Opens the connection, runs `f` and closes the connection again, whatever
    /// `f` returned.
    pub async fn with_connection<F, R>(&mut self, f: F) -> Result<R, AmqpError>
    where
        F: for<'c> FnOnce(&'c mut Self) -> BoxFuture<'c, Result<R, AmqpError>>,
    {
        self.open().await?;
        let result = f(self).await;
        self.close().await;
        result
    }

    /// Consumes until `shutdown` resolves, the channel fails or the memory
    /// ceiling is exceeded. Connection failures are retried transparently.
    ///
    /// Unlike `publish` and `message_count`, this does not require a prior
    /// [`Self::open`]: an unopened connector connects first, retrying until the
    /// broker is reachable or `shutdown` resolves.
    ///
    /// # Parameters
    /// * `handler` - Called on a worker thread for every decoded message
    /// * `max_allowed_memory` - Resident memory ceiling in bytes, checked after each delivery
    /// * `shutdown` - Resolves when consumption should stop
    pub async fn consume_until<M, H, S>(
        &mut self,
        handler: H,
        max_allowed_memory: Option<u64>,
        shutdown: S,
    ) -> Result<(), AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
        S: Future<Output = ()> + Send,
    {
        let queue = &self.config.queue;
        let settings = WorkerSettings {
            queue: queue.name().to_owned(),
            requeue: self.config.requeue(),
            flags: ContextFlags {
                requeue: self.config.requeue(),
                dead_letter: queue.dead_letter_enabled(),
                quorum: queue.quorum_enabled(),
            },
        };

        let consumer = ConsumerLoop {
            connection: &mut self.connection,
            guard: &self.guard,
            state: &self.state,
            settings,
            consumer_tag: self.config.resolve_consumer_tag(),
            backoff: self.config.reconnect_backoff,
            max_allowed_memory,
        };

        consumer.run(Arc::new(handler), shutdown).await
    }
}

#[async_trait]
impl<T: Transport> QueueConnector for RabbitMQConnector<T> {
    async fn consume_forever<M, H>(
        &mut self,
        handler: H,
        max_allowed_memory: Option<u64>,
    ) -> Result<(), AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        let interrupted = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = err.to_string(), "unable to listen for interrupts");
                std::future::pending::<()>().await;
            }
        };

        self.consume_until(handler, max_allowed_memory, interrupted)
            .await
    }

    async fn publish<M>(&self, message: &M) -> Result<(), AmqpError>
    where
        M: Serialize + Sync + ?Sized,
    {
        let session = self.connection.session()?;

        RabbitMQPublisher::new(session.channel().as_ref(), self.config.queue.name())
            .publish(message)
            .await
    }

    fn message_count(&self) -> Result<u32, AmqpError> {
        Ok(self.connection.session()?.queue_state().message_count)
    }
}
