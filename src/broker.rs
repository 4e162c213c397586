// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The traits in this module are the seam between the messaging core and a
//! concrete broker. `channel` implements them on top of lapin, `memory`
//! implements them in-process. Connection manager, topology declarer,
//! publisher and dispatcher only ever talk to these traits.

use crate::{
    errors::AmqpError, exchange::ExchangeDefinition, message::Message, queue::QueueBinding,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use std::sync::Arc;

/// Outcome of a publisher confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    NotRequested,
}

/// Resolves once the broker confirms (or rejects) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Stream of deliveries for one consumer. It ends when the consumer is
/// cancelled or the underlying channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Incoming, AmqpError>>;

/// Settles a single delivery on the channel it was received on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue together with its settlement handle.
pub struct Incoming {
    pub message: Message,
    pub redelivered: bool,
    /// Number of earlier delivery attempts of this message.
    pub delivery_count: u32,
    pub acker: Arc<dyn Acknowledger>,
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn enable_confirms(&self) -> Result<(), AmqpError>;

    /// Publishes `message` to `exchange` using the message routing key.
    ///
    /// Returns once the message is handed to the broker; the returned future
    /// resolves with the broker confirmation.
    async fn publish(&self, exchange: &str, message: &Message)
        -> Result<PendingConfirm, AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is closed, for whatever reason.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens connections to a broker; holds the address and credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}
