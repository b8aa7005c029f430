// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Connector
//!
//! This module provides the error type shared by every connector operation.
//! Broker failures are classified on conversion from `lapin::Error` so that the
//! consumer loop can tell a transport blip (reconnect) from a protocol violation
//! (stop) without inspecting error messages.

use lapin::protocol::AMQPErrorKind;
use thiserror::Error;

/// How far the effect of an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// The link to the broker is gone; recreate connection and channel.
    Connection,
    /// The broker rejected an operation on the channel; retrying cannot help.
    Channel,
    /// Confined to a single message or call.
    Local,
    /// Must crash the process.
    Fatal,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Invalid configuration value
    #[error("invalid configuration `{0}`: {1}")]
    ConfigError(String, String),

    /// Connection-level failure: network blip, broker restart, missed heartbeat
    #[error("connection failure: {0}")]
    ConnectionError(String),

    /// Channel-level failure: protocol violation such as a double ack or a
    /// conflicting queue re-declaration
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// An operation needed a live connection but none was opened
    #[error("connection not opened")]
    NotConnected,

    /// Error serializing an outgoing message
    #[error("failure to serialize message: {0}")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// The user supplied handler returned an error or panicked
    #[error("failure to process message: {0}")]
    CallbackError(String),

    /// Resident memory went over the configured ceiling
    #[error("memory limit exceeded: {current} bytes used, {limit} bytes allowed")]
    MemoryExceeded { current: u64, limit: u64 },
}

impl AmqpError {
    /// Classifies the error for the consumer loop.
    pub fn level(&self) -> ErrorLevel {
        match self {
            AmqpError::ConnectionError(_) => ErrorLevel::Connection,
            AmqpError::ChannelError(_) | AmqpError::ConfigError(..) | AmqpError::NotConnected => {
                ErrorLevel::Channel
            }
            AmqpError::InternalError(_)
            | AmqpError::SerializationError(_)
            | AmqpError::ParsePayloadError(_)
            | AmqpError::CallbackError(_) => ErrorLevel::Local,
            AmqpError::MemoryExceeded { .. } => ErrorLevel::Fatal,
        }
    }

    pub fn is_connection_level(&self) -> bool {
        self.level() == ErrorLevel::Connection
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(_) => AmqpError::ChannelError(err.to_string()),
                AMQPErrorKind::Hard(_) => AmqpError::ConnectionError(err.to_string()),
            },
            lapin::Error::InvalidChannel(_) | lapin::Error::ChannelsLimitReached => {
                AmqpError::ChannelError(err.to_string())
            }
            _ => AmqpError::ConnectionError(err.to_string()),
        }
    }
}
