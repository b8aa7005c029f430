// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! The connection manager owns the single connection/channel pair of a
//! connector. Opening retries connection-level failures forever with a fixed
//! backoff; anything else (a conflicting queue declaration, for instance) is a
//! configuration problem and is returned to the caller.

use crate::{
    channel::{BrokerChannel, QueueState, Transport},
    errors::AmqpError,
    queue::QueueConfig,
    topology,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// A live connection/channel pair with its declared topology.
#[derive(Clone)]
pub struct Session {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) queue_state: QueueState,
}

impl Session {
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Queue statistics reported when the queue was declared.
    pub fn queue_state(&self) -> QueueState {
        self.queue_state
    }
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    queue: QueueConfig,
    backoff: Duration,
    session: Option<Session>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a closed manager. Nothing is connected until [`Self::open`].
    ///
    /// # Parameters
    /// * `transport` - Opens connection/channel pairs
    /// * `queue` - Topology declared on every (re)connect
    /// * `backoff` - Delay between connection attempts
    pub fn new(transport: T, queue: QueueConfig, backoff: Duration) -> ConnectionManager<T> {
        ConnectionManager {
            transport,
            queue,
            backoff,
            session: None,
        }
    }

    /// The live channel and the queue state from its declare-ok.
    ///
    /// # Returns
    /// `AmqpError::NotConnected` before the first successful open
    pub fn session(&self) -> Result<&Session, AmqpError> {
        self.session.as_ref().ok_or(AmqpError::NotConnected)
    }

    /// Returns whether a session is held. A dropped link still counts as open
    /// until the next reconnect replaces it.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Establishes connection, channel and topology, retrying connection-level
    /// failures every `backoff` until it succeeds.
    pub async fn open(&mut self) -> Result<&Session, AmqpError> {
        loop {
            match self.connect().await {
                Ok(session) => {
                    info!(
                        queue = self.queue.name(),
                        "connection with broker established"
                    );
                    return Ok(self.session.insert(session));
                }
                Err(err) if err.is_connection_level() => {
                    warn!(
                        queue = self.queue.name(),
                        error = err.to_string(),
                        "connection failure, retrying..."
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn connect(&self) -> Result<Session, AmqpError> {
        debug!(queue = self.queue.name(), "connecting to broker");
        let channel = self.transport.connect().await?;

        let declared = async {
            channel.confirm_select().await?;
            topology::declare(channel.as_ref(), &self.queue).await
        }
        .await;

        match declared {
            Ok(queue_state) => Ok(Session {
                channel,
                queue_state,
            }),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(
                        queue = self.queue.name(),
                        error = close_err.to_string(),
                        "ignored close failure after setup error"
                    );
                }
                Err(err)
            }
        }
    }

    /// Closes channel and connection. Does nothing when already closed;
    /// close-time failures are returned for the caller to log.
    async fn disconnect(&mut self) -> Result<bool, AmqpError> {
        let Some(session) = self.session.take() else {
            return Ok(false);
        };

        debug!(queue = self.queue.name(), "disconnecting from broker");
        session.channel.close().await?;
        info!(queue = self.queue.name(), "disconnected from broker");
        Ok(true)
    }

    /// Best-effort close.
    pub async fn close(&mut self) {
        if let Err(err) = self.disconnect().await {
            debug!(
                queue = self.queue.name(),
                error = err.to_string(),
                "ignored disconnection error"
            );
        }
    }

    /// Drops the current pair, whatever its state, and opens a new one.
    pub async fn reconnect(&mut self) -> Result<&Session, AmqpError> {
        info!(queue = self.queue.name(), "reconnecting to queue");

        match self.disconnect().await {
            Ok(true) => warn!(
                queue = self.queue.name(),
                "connection was established, reconnecting anyway"
            ),
            Ok(false) => {}
            Err(err) => debug!(
                queue = self.queue.name(),
                error = err.to_string(),
                "ignored disconnection error"
            ),
        }

        self.open().await
    }
}
