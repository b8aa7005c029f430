// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connector Configuration
//!
//! Broker connection parameters and the consumer-side settings that are fixed
//! when a connector is built.

use crate::{errors::AmqpError, queue::QueueConfig};
use std::{env, time::Duration};
use uuid::Uuid;

pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";

/// Pause between two connection attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Parameters used to open the AMQP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-connector".to_owned(),
        }
    }
}

impl ConnectionParams {
    /// Reads the parameters from the environment, loading a `.env` file first
    /// when one exists. Unset variables keep their defaults.
    pub fn from_env() -> Result<ConnectionParams, AmqpError> {
        dotenvy::dotenv().ok();

        let mut params = ConnectionParams::default();

        if let Ok(host) = env::var(ENV_RABBITMQ_HOST) {
            params.host = host;
        }

        if let Ok(port) = env::var(ENV_RABBITMQ_PORT) {
            params.port = port
                .parse()
                .map_err(|_| AmqpError::ConfigError(ENV_RABBITMQ_PORT.to_owned(), port))?;
        }

        if let Ok(user) = env::var(ENV_RABBITMQ_USER) {
            params.user = user;
        }

        if let Ok(password) = env::var(ENV_RABBITMQ_PASSWORD) {
            params.password = password;
        }

        if let Ok(vhost) = env::var(ENV_RABBITMQ_VHOST) {
            params.vhost = vhost;
        }

        if let Ok(name) = env::var(ENV_APP_NAME) {
            params.connection_name = name;
        }

        Ok(params)
    }

    /// AMQP URI for these parameters. The vhost path segment is percent-encoded,
    /// so the default vhost `/` becomes `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }
}

/// Settings of one connector: the queue it serves and how consumption failures
/// are handled.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub(crate) queue: QueueConfig,
    pub(crate) requeue_on_consumption_error: Option<bool>,
    pub(crate) reconnect_backoff: Duration,
    pub(crate) consumer_tag: Option<String>,
}

impl ConnectorConfig {
    /// Creates the settings of a connector serving `queue`.
    ///
    /// Failed messages follow the queue's default requeue policy, the
    /// reconnect backoff is one second and the consumer tag is generated.
    ///
    /// # Parameters
    /// * `queue` - The queue the connector declares, publishes to and consumes
    ///
    /// ```
    /// use rabbitmq_connector::{ConnectorConfig, QueueConfig};
    ///
    /// let config = ConnectorConfig::new(QueueConfig::new("orders").dead_letter_exchange(true));
    ///
    /// assert_eq!(config.queue().name(), "orders");
    /// assert!(!config.requeue());
    /// assert!(config.requeue_on_consumption_error(true).requeue());
    /// ```
    pub fn new(queue: QueueConfig) -> ConnectorConfig {
        ConnectorConfig {
            queue,
            requeue_on_consumption_error: None,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            consumer_tag: None,
        }
    }

    /// Overrides whether messages whose deserialization or processing failed
    /// are put back on the queue.
    ///
    /// When left unset, failed messages are requeued unless the queue has a
    /// dead-letter exchange. Enabling both makes the redelivery bookkeeping
    /// inconsistent: requeued messages show `redelivered` without a bumped
    /// `dlx_retry_count`, dead-lettered ones the other way round.
    pub fn requeue_on_consumption_error(mut self, requeue: bool) -> Self {
        self.requeue_on_consumption_error = Some(requeue);
        self
    }

    /// Sets the fixed delay between reconnection attempts.
    ///
    /// # Parameters
    /// * `backoff` - Time to wait after a connection-level failure
    ///
    /// # Returns
    /// Self for method chaining
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Sets the consumer tag registered with the broker. Defaults to
    /// `<queue>-<uuid>`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// The queue this connector serves.
    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    /// The effective requeue flag.
    pub fn requeue(&self) -> bool {
        self.requeue_on_consumption_error
            .unwrap_or(!self.queue.dead_letter_enabled())
    }

    pub(crate) fn resolve_consumer_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.queue.name(), Uuid::new_v4()))
    }
}
