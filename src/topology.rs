// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares exchanges, queues and the bindings between them. Declarations are
//! idempotent on the broker: re-declaring with identical parameters is a no-op,
//! while conflicting parameters fail with [`AmqpError::TopologyConflict`].
//! Nothing here retries; that is the connection supervisor's job.
//!
//! The main components are:
//! - `Topology` trait: interface for topology management
//! - `AmqpTopology`: implementation of the trait over one channel
//! - `TopologyDescriptor`: the fixed exchange/queue/binding set of the pipeline
//! - `inspect_queue`: a non-mutating passive read of queue counters

use crate::{
    channel::{close_connection, new_amqp_channel},
    config::BrokerConfig,
    errors::{declare_error, AmqpError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueStats},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: &'tp Channel,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    /// Starts an empty topology to be declared on `channel`.
    pub fn new(channel: &'tp Channel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl<'tp> AmqpTopology<'tp> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self
                .channel
                .exchange_declare(
                    exch.name,
                    exch.kind.into(),
                    ExchangeDeclareOptions {
                        passive: exch.passive,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    Err(declare_error(&err, exch.name, || {
                        AmqpError::DeclareExchangeError(exch.name.to_owned())
                    }))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Creates all queues, declaring each dead-letter queue before its parent.
    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            let mut queue_args = BTreeMap::new();

            if def.dlq_name.is_some() {
                self.declare_dlq(def, &mut queue_args).await?;
            }

            self.declare_queue(&def.name, def, FieldTable::from(queue_args))
                .await?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        def: &QueueDefinition,
        args: FieldTable,
    ) -> Result<QueueStats, AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(declare_error(&err, name, || {
                    AmqpError::DeclareQueueError(name.to_owned())
                }))
            }
            Ok(queue) => Ok(QueueStats {
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    /// Declares the dead-letter queue of `def` and points the parent queue's
    /// dead-letter arguments at it through the default exchange.
    async fn declare_dlq(
        &self,
        def: &QueueDefinition,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        let Some(dlq_name) = def.dlq_name.as_deref() else {
            return Ok(());
        };

        self.declare_queue(dlq_name, def, FieldTable::default())
            .await?;

        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dlq_name)),
        );

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    binding.queue_name,
                    binding.exchange_name,
                    binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(declare_error(&err, binding.queue_name, || {
                        AmqpError::BindingExchangeToQueueError(
                            binding.exchange_name.to_owned(),
                            binding.queue_name.to_owned(),
                        )
                    }))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}

/// The pipeline's fixed topology: one durable topic exchange, one durable
/// queue and the binding between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub exchange_name: String,
    pub queue_name: String,
    pub routing_key: String,
    pub dead_letter_queue: bool,
}

impl From<&BrokerConfig> for TopologyDescriptor {
    fn from(cfg: &BrokerConfig) -> Self {
        TopologyDescriptor {
            exchange_name: cfg.exchange_name.clone(),
            queue_name: cfg.queue_name.clone(),
            routing_key: cfg.routing_key.clone(),
            dead_letter_queue: cfg.dead_letter_queue,
        }
    }
}

impl TopologyDescriptor {
    pub(crate) fn exchange_definition(&self) -> ExchangeDefinition<'_> {
        ExchangeDefinition::new(&self.exchange_name).topic().durable()
    }

    pub(crate) fn queue_definition(&self) -> QueueDefinition {
        let def = QueueDefinition::new(&self.queue_name).durable();
        if self.dead_letter_queue {
            def.with_dlq()
        } else {
            def
        }
    }

    /// Ensures the exchange, the queue and the binding exist on `channel`.
    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        let exchange = self.exchange_definition();
        let queue = self.queue_definition();
        let binding = QueueBinding::new(&self.queue_name)
            .exchange(&self.exchange_name)
            .routing_key(&self.routing_key);

        AmqpTopology::new(channel)
            .exchange(&exchange)
            .queue(&queue)
            .queue_binding(&binding)
            .install()
            .await
    }
}

/// Reads the message and consumer counts of `name` through a passive declare
/// on an already open channel. Never creates or alters the queue.
pub async fn inspect_queue_on(channel: &Channel, name: &str) -> Result<QueueStats, AmqpError> {
    let def = QueueDefinition::new(name).passive();
    AmqpTopology::new(channel)
        .declare_queue(name, &def, FieldTable::default())
        .await
}

/// Opens a short-lived connection, reads the counters of `name` and closes it.
///
/// Fails fast: any connection or lookup failure is returned as is.
pub async fn inspect_queue(cfg: &BrokerConfig, name: &str) -> Result<QueueStats, AmqpError> {
    let (conn, channel) = new_amqp_channel(cfg).await?;
    let result = inspect_queue_on(&channel, name).await;
    close_connection(&conn, "queue inspection finished").await;
    result
}
