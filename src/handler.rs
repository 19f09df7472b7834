// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shipment Message Handlers
//!
//! The consumer runtime hands every decoded update to a [`ShipmentHandler`].
//! Returning `Ok` acknowledges the delivery; returning an error rejects it.

use crate::{errors::HandlerError, message::ShipmentUpdate};
use async_trait::async_trait;
use opentelemetry::Context;
use tracing::info;

/// Broker-side facts about the delivery being handled.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Trace context propagated from the publisher, if any.
    pub trace: Context,
}

/// Processes one decoded shipment update.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShipmentHandler: Send + Sync {
    async fn handle(&self, ctx: &DeliveryContext, update: &ShipmentUpdate)
        -> Result<(), HandlerError>;
}

/// Default handler: records the delivery and its content as a structured event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl ShipmentHandler for LoggingHandler {
    async fn handle(
        &self,
        ctx: &DeliveryContext,
        update: &ShipmentUpdate,
    ) -> Result<(), HandlerError> {
        info!(
            exchange = %ctx.exchange,
            routing_key = %ctx.routing_key,
            delivery_tag = ctx.delivery_tag,
            redelivered = ctx.redelivered,
            shipment_id = %update.shipment_id,
            status = %update.status,
            timestamp = %update.timestamp,
            lat = update.location.map(|l| l.lat),
            lng = update.location.map(|l| l.lng),
            "shipment update received"
        );

        Ok(())
    }
}
