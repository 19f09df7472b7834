// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Resolution
//!
//! Every delivery handed to this module is resolved exactly once: it is decoded,
//! passed to the handler and acknowledged, or it is negatively acknowledged
//! without requeue when decoding or handling fails. Malformed messages are
//! therefore never redelivered to this consumer.

use crate::{
    errors::{AmqpError, HandlerError},
    handler::{DeliveryContext, ShipmentHandler},
    message, otel,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, ShortString},
    Channel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, error};

/// An inbound message, detached from the lapin delivery it came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundDelivery {
    /// Channel-scoped tag used to settle the delivery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// Message headers; carries the publisher's trace context.
    pub headers: BTreeMap<ShortString, AMQPValue>,
    /// Raw body.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for InboundDelivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();

        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            headers,
            data: delivery.data,
        }
    }
}

/// Settles deliveries by exact tag on the channel they arrived on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Acknowledges exactly `delivery_tag`.
    ///
    /// # Errors
    /// [`AmqpError::AckMessageError`] when the ack could not be sent.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negatively acknowledges exactly `delivery_tag`.
    ///
    /// # Parameters
    /// - `delivery_tag`: tag of the delivery on this channel
    /// - `requeue`: whether the broker should queue it again
    ///
    /// # Errors
    /// [`AmqpError::NackMessageError`] when the nack could not be sent.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl DeliveryAcker for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
            AmqpError::NackMessageError(delivery_tag)
        })
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handled successfully and acked.
    Acked,
    /// Undecodable or failed in the handler; nacked without requeue.
    Rejected,
}

/// Running totals of settled deliveries.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    acked: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`DeliveryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub acked: u64,
    pub rejected: u64,
}

impl DeliveryCounters {
    /// Counts one settled delivery.
    pub fn record(&self, resolution: Resolution) {
        match resolution {
            Resolution::Acked => self.acked.fetch_add(1, Ordering::Relaxed),
            Resolution::Rejected => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Reads both counters. The pair is not read atomically.
    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Decodes, handles and settles one delivery.
///
/// Returns the resolution on success. An error means the ack or nack itself
/// could not be sent, which only happens when the channel is gone; the broker
/// then requeues the delivery on its own.
pub(crate) async fn resolve<H, A>(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    handler: &H,
    acker: &A,
) -> Result<Resolution, AmqpError>
where
    H: ShipmentHandler + ?Sized,
    A: DeliveryAcker + ?Sized,
{
    let (trace, mut span) = otel::new_span(&delivery.headers, tracer, &delivery.routing_key);
    let tag = delivery.delivery_tag;

    debug!(
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        delivery_tag = tag,
        "received delivery"
    );

    let update = match message::decode(&delivery.data) {
        Ok(update) => update,
        Err(err) => {
            error!(
                error = %err,
                delivery_tag = tag,
                "removing message from queue - reason: undecodable payload"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("undecodable payload"),
            });
            return reject(acker, tag).await;
        }
    };

    let ctx = DeliveryContext {
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        delivery_tag: tag,
        redelivered: delivery.redelivered,
        trace,
    };

    let outcome = match AssertUnwindSafe(async { handler.handle(&ctx, &update).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    };

    match outcome {
        Ok(()) => {
            acker.ack(tag).await.inspect_err(|err| {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
            })?;
            debug!(delivery_tag = tag, "message acknowledged");
            span.set_status(Status::Ok);
            Ok(Resolution::Acked)
        }
        Err(err) => {
            error!(
                error = %err,
                delivery_tag = tag,
                shipment_id = %update.shipment_id,
                "removing message from queue - reason: handler failure"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            reject(acker, tag).await
        }
    }
}

async fn reject<A>(acker: &A, tag: u64) -> Result<Resolution, AmqpError>
where
    A: DeliveryAcker + ?Sized,
{
    acker.nack(tag, false).await?;
    Ok(Resolution::Rejected)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{LoggingHandler, MockShipmentHandler};
    use mockall::predicate::eq;
    use opentelemetry::global;

    const VALID: &[u8] = br#"{"shipmentId":"S1","status":"IN_TRANSIT","timestamp":"2024-01-01T00:00:00Z","location":{"lat":10.0,"lng":20.0}}"#;

    fn delivery(tag: u64, data: &[u8]) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            exchange: "logistics_exchange".to_owned(),
            routing_key: "shipment.update".to_owned(),
            data: data.to_vec(),
            ..InboundDelivery::default()
        }
    }

    fn tracer() -> BoxedTracer {
        global::tracer("consumer-tests")
    }

    #[tokio::test]
    async fn valid_message_is_handled_then_acked() {
        let mut handler = MockShipmentHandler::new();
        handler
            .expect_handle()
            .withf(|ctx, update| {
                ctx.delivery_tag == 7
                    && ctx.exchange == "logistics_exchange"
                    && update.shipment_id == "S1"
                    && update.location.map(|l| (l.lat, l.lng)) == Some((10.0, 20.0))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));
        acker.expect_nack().never();

        let resolution = resolve(&tracer(), &delivery(7, VALID), &handler, &acker).await;
        assert_eq!(resolution, Ok(Resolution::Acked));
    }

    #[tokio::test]
    async fn non_json_body_is_nacked_without_requeue() {
        let mut handler = MockShipmentHandler::new();
        handler.expect_handle().never();

        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(3), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let resolution = resolve(&tracer(), &delivery(3, b"\x00\xffgarbage"), &handler, &acker).await;
        assert_eq!(resolution, Ok(Resolution::Rejected));
    }

    #[tokio::test]
    async fn handler_failure_is_nacked_without_requeue() {
        let mut handler = MockShipmentHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_, _| Err(HandlerError::Failed("storage offline".to_owned())));

        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(9), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let resolution = resolve(&tracer(), &delivery(9, VALID), &handler, &acker).await;
        assert_eq!(resolution, Ok(Resolution::Rejected));
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_nacked() {
        let mut handler = MockShipmentHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_, _| panic!("boom"));

        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(4), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let resolution = resolve(&tracer(), &delivery(4, VALID), &handler, &acker).await;
        assert_eq!(resolution, Ok(Resolution::Rejected));
    }

    #[tokio::test]
    async fn failed_ack_is_reported_to_the_caller() {
        let mut acker = MockDeliveryAcker::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|tag| Err(AmqpError::AckMessageError(tag)));
        acker.expect_nack().never();

        let resolution = resolve(&tracer(), &delivery(5, VALID), &LoggingHandler, &acker).await;
        assert_eq!(resolution, Err(AmqpError::AckMessageError(5)));
    }

    #[tokio::test]
    async fn every_delivery_is_settled_exactly_once() {
        let bodies: Vec<&[u8]> = vec![VALID, b"nope", VALID, b"{}", VALID, b""];
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().times(3).returning(|_| Ok(()));
        acker.expect_nack().times(3).returning(|_, _| Ok(()));

        let counters = DeliveryCounters::default();
        for (tag, body) in bodies.iter().enumerate() {
            let resolution = resolve(&tracer(), &delivery(tag as u64 + 1, body), &LoggingHandler, &acker)
                .await
                .unwrap();
            counters.record(resolution);
        }

        let stats = counters.snapshot();
        assert_eq!(stats, DeliveryStats { acked: 3, rejected: 3 });
        assert_eq!(stats.acked + stats.rejected, bodies.len() as u64);
    }
}
