// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shipment Update Publisher
//!
//! Publishes one update per call over its own short-lived connection: connect,
//! ensure the topology, publish a persistent message and wait for the broker's
//! confirmation, then close. A failure at any step is returned to the caller as
//! a [`PublishError`]; nothing is retried here.

use crate::{
    channel::{close_connection, new_amqp_channel},
    config::BrokerConfig,
    errors::{AmqpError, PublishError},
    message::{self, ShipmentUpdate, JSON_CONTENT_TYPE},
    otel,
    supervisor::ConnectionSupervisor,
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// AMQP delivery mode asking the broker to store the message on disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// The single call the request-handling layer makes into the pipeline.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, update: &ShipmentUpdate) -> Result<(), PublishError>;
}

/// RabbitMQ publisher for shipment updates.
pub struct ShipmentPublisher {
    cfg: Arc<BrokerConfig>,
    topology: TopologyDescriptor,
    supervisor: ConnectionSupervisor,
}

impl ShipmentPublisher {
    /// Creates a publisher that connects once per publish and never retries.
    pub fn new(cfg: Arc<BrokerConfig>) -> Arc<ShipmentPublisher> {
        let topology = TopologyDescriptor::from(cfg.as_ref());
        Arc::new(ShipmentPublisher {
            cfg,
            topology,
            supervisor: ConnectionSupervisor::single_shot(),
        })
    }
}

#[async_trait]
impl Publisher for ShipmentPublisher {
    async fn publish(&self, update: &ShipmentUpdate) -> Result<(), PublishError> {
        let payload = message::encode(update)?;

        let (conn, channel) = self
            .supervisor
            .establish(|_| new_amqp_channel(&self.cfg))
            .await?;

        let result = self.publish_on(&channel, &payload).await;
        close_connection(&conn, "publish finished").await;

        match &result {
            Ok(()) => info!(
                shipment_id = %update.shipment_id,
                exchange = %self.topology.exchange_name,
                routing_key = %self.topology.routing_key,
                "message published successfully"
            ),
            Err(err) => error!(
                error = %err,
                shipment_id = %update.shipment_id,
                "error publishing message"
            ),
        }

        result.map_err(PublishError::from)
    }
}

impl ShipmentPublisher {
    async fn publish_on(&self, channel: &Channel, payload: &[u8]) -> Result<(), AmqpError> {
        self.topology.install(channel).await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        let headers = otel::inject_headers(&Context::current());

        let confirm = channel
            .basic_publish(
                &self.topology.exchange_name,
                &self.topology.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                payload,
                message_properties(FieldTable::from(headers)),
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        match confirmation {
            Confirmation::Nack(_) => Err(AmqpError::PublishRejected(
                "broker negatively confirmed the message".to_owned(),
            )),
            Confirmation::Ack(Some(returned)) => Err(AmqpError::PublishRejected(format!(
                "unroutable: {}",
                returned.reply_text.as_str()
            ))),
            _ => {
                debug!("publish confirmed by the broker");
                Ok(())
            }
        }
    }
}

fn message_properties(headers: FieldTable) -> BasicProperties {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_timestamp(timestamp)
        .with_headers(headers)
}
