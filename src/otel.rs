// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers: the publisher injects
//! the current context, the consumer extracts it and opens one span per delivery.

use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter that reads and writes trace context in AMQP header tables.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Installs the W3C trace-context propagator as the process-wide propagator.
/// Until this runs, header injection and extraction are no-ops.
pub(crate) fn install_propagator() {
    global::set_text_map_propagator(TraceContextPropagator::new());
}

/// Writes `ctx` into a fresh header table for an outgoing message.
pub(crate) fn inject_headers(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::default();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
    });
    headers
}

/// Extracts the producer's context from `headers` and starts a consumer span
/// named `name` as its child.
pub(crate) fn new_span(
    headers: &BTreeMap<ShortString, AMQPValue>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;
    use opentelemetry::trace::{
        Span, SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    fn remote_parent() -> SpanContext {
        SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        )
    }

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::default();
        RabbitMQTracePropagator::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc")))
        );
    }

    #[test]
    fn extractor_ignores_non_string_values() {
        let mut headers = BTreeMap::default();
        headers.insert(ShortString::from("retries"), AMQPValue::LongInt(3));
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc")),
        );

        let propagator = RabbitMQTracePropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.get("retries"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn published_context_is_the_consumer_span_parent() {
        install_propagator();
        let parent = remote_parent();
        let published = Context::new().with_remote_span_context(parent.clone());

        let headers = inject_headers(&published);
        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from(
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            )))
        );

        let (ctx, span) = new_span(&headers, &global::tracer("otel-tests"), "shipment.update");
        let extracted = ctx.span().span_context().clone();
        assert!(extracted.is_remote());
        assert_eq!(extracted.trace_id(), parent.trace_id());
        assert_eq!(extracted.span_id(), parent.span_id());
        assert_eq!(span.span_context().trace_id(), parent.trace_id());
    }

    #[test]
    fn missing_headers_give_an_empty_parent() {
        install_propagator();
        let (ctx, _) = new_span(&BTreeMap::default(), &global::tracer("otel-tests"), "shipment.update");
        assert!(!ctx.span().span_context().is_valid());
    }
}
