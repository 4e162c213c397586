// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside the message attributes, which become AMQP
//! headers on the wire. The publisher injects the current context; the
//! consumer extracts it and opens a consumer span for the handler.

use crate::message::Message;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Injects trace context entries into message attributes.
pub(crate) struct AttributesInjector<'a> {
    attributes: &'a mut BTreeMap<String, String>,
}

impl<'a> AttributesInjector<'a> {
    pub(crate) fn new(attributes: &'a mut BTreeMap<String, String>) -> Self {
        Self { attributes }
    }
}

impl Injector for AttributesInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.attributes.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from the attributes of a received message.
pub(crate) struct AttributesExtractor<'a> {
    attributes: &'a BTreeMap<String, String>,
}

impl<'a> AttributesExtractor<'a> {
    pub(crate) fn new(attributes: &'a BTreeMap<String, String>) -> Self {
        Self { attributes }
    }
}

impl Extractor for AttributesExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.attributes.keys().map(String::as_str).collect()
    }
}

/// Trace headers for `ctx`, to be merged into an outgoing message.
pub(crate) fn trace_attributes(ctx: &Context) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AttributesInjector::new(&mut attributes))
    });

    attributes
}

/// Creates a consumer span for `msg`, parented on the context found in its headers.
pub(crate) fn new_span(msg: &Message, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&AttributesExtractor::new(msg.attributes()))
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

    #[test]
    fn test_injector_lowercases_keys() {
        let mut attributes = BTreeMap::new();
        AttributesInjector::new(&mut attributes).set("TraceParent", "00-abc".to_owned());
        assert_eq!(attributes.get("traceparent").map(String::as_str), Some("00-abc"));
    }

    #[test]
    fn test_extractor_reads_attributes() {
        let msg = Message::new("tutorial", "x").with_attribute("traceparent", "00-abc");
        let extractor = AttributesExtractor::new(msg.attributes());
        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
        assert_eq!(extractor.get("tracestate"), None);
    }
}
