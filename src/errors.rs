// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! This module provides the error taxonomy for broker operations. The `AmqpError`
//! enum covers connection, channel, topology, publishing and consuming failures.
//! Connection-level failures are recovered by the connection manager and only
//! surface as state events; the others are returned to the caller.

use crate::consumer::DeliveryState;
use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("connection lost, gave up after {0} reconnect attempts")]
    FatalConnectionError(u32),

    /// Error creating or using a channel
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// An entity already exists with different parameters
    #[error("entity `{0}` already declared with different parameters")]
    TopologyConflictError(String),

    /// The topology fails validation and was not sent to the broker
    #[error("invalid topology: {0}")]
    InvalidTopologyError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker did not confirm the publish in time; the outcome is unknown
    #[error("publish confirmation timed out after {0:?}")]
    PublishTimeoutError(Duration),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// A delivery handle was settled twice
    #[error("delivery already settled as {0:?}")]
    DeliveryAlreadySettled(DeliveryState),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error loading the configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl AmqpError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::PublishingError(_)
        )
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
