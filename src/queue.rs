// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! This module provides the immutable description of the queue a connector
//! serves. Besides the classic declare flags it covers the two retry-related
//! features the connector understands: a per-queue dead letter exchange and
//! quorum queues with their delivery limit.

/// Prefix of the dead letter exchange created for a queue.
pub const DEAD_LETTER_EXCHANGE_PREFIX: &str = "dlx.";

/// Default quorum `x-delivery-limit`.
pub const DEFAULT_QUORUM_DELIVERY_LIMIT: i64 = 3;
/// Default quorum `x-max-in-memory-length`.
pub const DEFAULT_QUORUM_MAX_IN_MEMORY_LENGTH: i64 = 100;
/// Default quorum `x-max-in-memory-bytes` (1 GiB).
pub const DEFAULT_QUORUM_MAX_IN_MEMORY_BYTES: i64 = 1_073_741_824;

/// Tunables of a quorum queue. Unset values fall back to the crate defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuorumArgs {
    pub delivery_limit: Option<i64>,
    pub max_in_memory_length: Option<i64>,
    pub max_in_memory_bytes: Option<i64>,
}

impl QuorumArgs {
    pub fn delivery_limit(&self) -> i64 {
        self.delivery_limit.unwrap_or(DEFAULT_QUORUM_DELIVERY_LIMIT)
    }

    pub fn max_in_memory_length(&self) -> i64 {
        self.max_in_memory_length
            .unwrap_or(DEFAULT_QUORUM_MAX_IN_MEMORY_LENGTH)
    }

    pub fn max_in_memory_bytes(&self) -> i64 {
        self.max_in_memory_bytes
            .unwrap_or(DEFAULT_QUORUM_MAX_IN_MEMORY_BYTES)
    }
}

/// Definition of the queue a connector declares and consumes from.
///
/// Built once with the builder methods below and read-only afterwards. A new
/// definition is durable, non-exclusive and never auto-deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) dead_letter: bool,
    pub(crate) quorum: Option<QuorumArgs>,
}

impl QueueConfig {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter: false,
            quorum: None,
        }
    }

    /// Whether the queue (and its dead letter exchange) survive a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the queue exclusive to the connection that declared it.
    ///
    /// Exclusive queues are deleted when that connection closes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Routes rejected messages through `dlx.<queue>` back into this queue.
    pub fn dead_letter_exchange(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    /// Declares the queue as a quorum queue with the given tunables.
    pub fn quorum(mut self, args: QuorumArgs) -> Self {
        self.quorum = Some(args);
        self
    }

    /// Name of the queue, also the routing key used for publishing and
    /// dead-letter bindings.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Returns whether the queue is exclusive to its connection.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Returns whether the queue is deleted with its last consumer.
    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Returns whether rejected messages go through a dead letter exchange.
    pub fn dead_letter_enabled(&self) -> bool {
        self.dead_letter
    }

    /// Returns whether the queue is declared as a quorum queue.
    pub fn quorum_enabled(&self) -> bool {
        self.quorum.is_some()
    }

    /// Quorum tunables, `None` for classic queues.
    pub fn quorum_args(&self) -> Option<&QuorumArgs> {
        self.quorum.as_ref()
    }

    /// Name of the dead letter exchange, when dead-lettering is enabled.
    pub fn dead_letter_exchange_name(&self) -> Option<String> {
        self.dead_letter
            .then(|| format!("{}{}", DEAD_LETTER_EXCHANGE_PREFIX, self.name))
    }
}
