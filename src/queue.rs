// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queues and queue-to-exchange bindings, plus the read-only
//! counters returned by a passive queue inspection.

use serde::Serialize;

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DLQ_SUFFIX: &str = "-dlq";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            passive: false,
            dlq_name: None,
        }
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Checks for existence without creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Routes rejected messages to `<name>-dlq` instead of dropping them.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}{}", self.name, DLQ_SUFFIX));
        self
    }
}

/// Binds a queue to an exchange under a routing key pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a binding for `queue`; exchange and routing key start empty.
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }
}

/// Counters read from a passive queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}
