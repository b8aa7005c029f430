// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable RabbitMQ consumer/producer for a single queue: managed connection
//! with automatic reconnect, dead-letter and quorum queue declaration, JSON
//! publishing with confirms, and at-least-once consumption with manual
//! acknowledgement.

mod otel;

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod guard;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use config::{ConnectionParams, ConnectorConfig};
pub use connector::{QueueConnector, RabbitMQConnector};
pub use consumer::{HandlerError, MessageHandler};
pub use context::MessageContext;
pub use dispatcher::ConsumerState;
pub use errors::AmqpError;
pub use queue::{QueueConfig, QuorumArgs};
