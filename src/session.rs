// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Sessions
//!
//! A session is everything the consumer runtime needs from one broker
//! connection: a stream of deliveries and a [`SessionLink`] to settle them,
//! cancel the subscription and close the connection. [`AmqpSessionOpener`]
//! builds sessions over lapin; the runtime only sees the traits.

use crate::{
    channel::{close_connection, new_amqp_channel},
    config::BrokerConfig,
    consumer::{DeliveryAcker, InboundDelivery},
    errors::{setup_error, AmqpError},
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, Consumer,
};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Deliveries of one session. An `Err` item or the end of the stream means the
/// connection is gone.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Control side of an open session.
#[async_trait]
pub trait SessionLink: DeliveryAcker {
    /// Asks the broker to stop sending new deliveries. Unsettled deliveries
    /// stay with this session until it is closed.
    async fn cancel(&self);

    /// Closes the underlying connection, logging `reason`.
    async fn close(&self, reason: &str);
}

/// One open broker session ready to consume.
pub struct Session {
    pub deliveries: DeliveryStream,
    pub link: Box<dyn SessionLink>,
}

/// Opens consume sessions for the runtime, one per connection attempt.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    /// Connects, installs the topology and subscribes.
    ///
    /// # Returns
    /// A ready [`Session`], or the classified error of the step that failed.
    /// Transient errors are retried by the caller.
    async fn open(&self) -> Result<Session, AmqpError>;
}

/// [`SessionOpener`] over a lapin connection.
pub struct AmqpSessionOpener {
    cfg: Arc<BrokerConfig>,
    topology: TopologyDescriptor,
}

impl AmqpSessionOpener {
    /// Creates an opener for the queue and topology described by `cfg`.
    pub fn new(cfg: Arc<BrokerConfig>) -> Self {
        AmqpSessionOpener {
            topology: TopologyDescriptor::from(cfg.as_ref()),
            cfg,
        }
    }

    /// Installs the topology, sets the prefetch window and registers the consumer.
    async fn prepare(&self, channel: &Channel) -> Result<(Consumer, String), AmqpError> {
        self.topology.install(channel).await?;

        channel
            .basic_qos(self.cfg.prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                setup_error(&err, || AmqpError::QoSDeclarationError(err.to_string()))
            })?;

        let consumer_tag = format!("{}-{}", self.cfg.app_name, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.topology.queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                setup_error(&err, || AmqpError::ConsumerDeclarationError(err.to_string()))
            })?;

        Ok((consumer, consumer_tag))
    }
}

#[async_trait]
impl SessionOpener for AmqpSessionOpener {
    async fn open(&self) -> Result<Session, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.cfg).await?;

        let (consumer, consumer_tag) = match self.prepare(&channel).await {
            Ok(prepared) => prepared,
            Err(err) => {
                close_connection(&conn, "consumer setup failed").await;
                return Err(err);
            }
        };

        let deliveries = consumer
            .map(|delivery| match delivery {
                Ok(delivery) => Ok(InboundDelivery::from(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed();

        Ok(Session {
            deliveries,
            link: Box::new(AmqpSession {
                conn,
                channel,
                consumer_tag,
            }),
        })
    }
}

/// Connection, channel and consumer tag of a lapin-backed session.
struct AmqpSession {
    conn: Connection,
    channel: Channel,
    consumer_tag: String,
}

#[async_trait]
impl DeliveryAcker for AmqpSession {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel.ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel.nack(delivery_tag, requeue).await
    }
}

#[async_trait]
impl SessionLink for AmqpSession {
    async fn cancel(&self) {
        if !self.channel.status().connected() {
            return;
        }

        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            warn!(error = err.to_string(), "failure to cancel consumer");
        }
    }

    async fn close(&self, reason: &str) {
        close_connection(&self.conn, reason).await;
    }
}
