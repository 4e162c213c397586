// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! `Message` is the unit that travels through the broker: an identifier, an
//! opaque payload, the routing key it is published with and a set of string
//! attributes carried as AMQP headers. Messages are immutable once built; the
//! builder methods consume `self` and are meant for construction only.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header set by quorum queues with the number of previous delivery attempts
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Reason recorded the first time a message is dead-lettered
pub const AMQP_HEADERS_FIRST_DEATH_REASON: &str = "x-first-death-reason";
/// Queue a message was first dead-lettered from
pub const AMQP_HEADERS_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Exchange a message was originally published to before being dead-lettered
pub const AMQP_HEADERS_FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    payload: Vec<u8>,
    routing_key: String,
    attributes: BTreeMap<String, String>,
    content_type: Option<String>,
}

impl Message {
    /// Creates a message with a fresh UUID v4 identifier.
    pub fn new(routing_key: &str, payload: impl Into<Vec<u8>>) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            routing_key: routing_key.to_owned(),
            attributes: BTreeMap::default(),
            content_type: None,
        }
    }

    /// Creates a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(routing_key: &str, value: &T) -> Result<Message, AmqpError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        Ok(Message::new(routing_key, payload).with_content_type(JSON_CONTENT_TYPE))
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Decodes the JSON payload into `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Copy of this message routed with another key, as the broker does when
    /// it dead-letters a message. The first death is recorded once.
    pub(crate) fn dead_lettered(
        &self,
        routing_key: &str,
        reason: &str,
        queue: &str,
        exchange: &str,
    ) -> Message {
        let mut msg = self.clone();
        msg.routing_key = routing_key.to_owned();

        if !msg.attributes.contains_key(AMQP_HEADERS_FIRST_DEATH_REASON) {
            msg.attributes
                .insert(AMQP_HEADERS_FIRST_DEATH_REASON.to_owned(), reason.to_owned());
            msg.attributes
                .insert(AMQP_HEADERS_FIRST_DEATH_QUEUE.to_owned(), queue.to_owned());
            msg.attributes
                .insert(AMQP_HEADERS_FIRST_DEATH_EXCHANGE.to_owned(), exchange.to_owned());
        }

        msg
    }
}

/// The record exchanged by the tutorial: an identifier and a free-form text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorialRecord {
    pub id: Uuid,
    pub data: String,
}

impl TutorialRecord {
    pub fn new(data: &str) -> TutorialRecord {
        TutorialRecord {
            id: Uuid::new_v4(),
            data: data.to_owned(),
        }
    }

    /// Wraps the record in a JSON message that reuses the record id as message id,
    /// so a consumer can deduplicate redeliveries.
    pub fn into_message(&self, routing_key: &str) -> Result<Message, AmqpError> {
        Ok(Message::json(routing_key, self)?.with_id(&self.id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_gets_unique_id() {
        let a = Message::new("tutorial", "hello");
        let b = Message::new("tutorial", "hello");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.payload(), b"hello");
        assert_eq!(a.routing_key(), "tutorial");
        assert!(a.content_type().is_none());
    }

    #[test]
    fn test_record_message_reuses_record_id() {
        let record = TutorialRecord::new("some input");
        let msg = record.into_message("tutorial").unwrap();

        assert_eq!(msg.id(), record.id.to_string());
        assert_eq!(msg.content_type(), Some(JSON_CONTENT_TYPE));
        assert_eq!(msg.decode_json::<TutorialRecord>().unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let msg = Message::new("tutorial", "not json");
        assert!(matches!(
            msg.decode_json::<TutorialRecord>(),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }

    #[test]
    fn test_dead_lettered_keeps_first_death() {
        let msg = Message::new("tutorial", "x").with_id("abc-2");
        let first = msg.dead_lettered("deadLetter", "rejected", "tq", "t");
        let second = first.dead_lettered("other", "expired", "tq.dlq", "t.dlx");

        assert_eq!(first.id(), "abc-2");
        assert_eq!(first.routing_key(), "deadLetter");
        assert_eq!(first.attribute(AMQP_HEADERS_FIRST_DEATH_REASON), Some("rejected"));
        assert_eq!(second.attribute(AMQP_HEADERS_FIRST_DEATH_QUEUE), Some("tq"));
        assert_eq!(second.attribute(AMQP_HEADERS_FIRST_DEATH_EXCHANGE), Some("t"));
        assert_eq!(msg.attribute(AMQP_HEADERS_FIRST_DEATH_REASON), None);
    }
}
