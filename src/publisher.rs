// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages on the main exchange of a `Topology`. The
//! publisher keeps one dedicated channel per connection generation, in confirm
//! mode when publisher confirms are enabled, and injects the OpenTelemetry
//! context of the caller into the message headers.
//!
//! There is no internal retry: the caller decides what to do with a failed or
//! timed out publish, reconciling by message id when the outcome is unknown.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Confirmation},
    configs::{OutagePolicy, PublisherConfigs},
    connection::ConnectionManager,
    errors::AmqpError,
    message::Message,
    otel,
    topology::Topology,
};
use opentelemetry::Context;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Outcome of a publish the broker accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    /// The broker took responsibility for the message.
    Confirmed,
    /// The broker refused the message, it was not enqueued.
    Rejected,
    /// Confirms are disabled, nothing is known beyond the socket write.
    Unconfirmed,
}

struct PublishChannel {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

/// Publishes messages over the connection owned by a `ConnectionManager`.
pub struct RabbitMQPublisher {
    manager: Arc<ConnectionManager>,
    cfg: PublisherConfigs,
    channel: Mutex<Option<PublishChannel>>,
}

impl RabbitMQPublisher {
    /// Creates a publisher over the connection of `manager`.
    ///
    /// # Parameters
    ///
    /// * `manager` - Connection the publisher opens its channel on.
    /// * `cfg` - Confirm mode, confirm timeout and behaviour during an outage.
    ///
    /// # Returns
    ///
    /// A shared publisher; its channel is opened on the first publish.
    pub fn new(manager: Arc<ConnectionManager>, cfg: PublisherConfigs) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            manager,
            cfg,
            channel: Mutex::new(None),
        })
    }

    /// Publishes `msg` to the main exchange of `topology` under the current trace context.
    pub async fn publish(
        &self,
        msg: &Message,
        topology: &Topology,
    ) -> Result<PublishResult, AmqpError> {
        self.publish_with_context(&Context::current(), msg, topology)
            .await
    }

    /// Publishes `msg` to the main exchange of `topology`.
    ///
    /// With confirms enabled the call waits for the broker answer at most
    /// `confirm_timeout`, then fails with `PublishTimeoutError`: the message
    /// may or may not have been enqueued.
    pub async fn publish_with_context(
        &self,
        ctx: &Context,
        msg: &Message,
        topology: &Topology,
    ) -> Result<PublishResult, AmqpError> {
        let (connection, generation) = self.connection().await?;
        let channel = self.channel(connection, generation).await?;

        let msg = msg.clone().with_attributes(otel::trace_attributes(ctx));

        let pending = match channel.publish(topology.exchange_name(), &msg).await {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                self.discard(generation).await;
                return Err(publishing_error(err));
            }
        };

        let timeout = self.cfg.confirm_timeout();
        match tokio::time::timeout(timeout, pending).await {
            Err(_) => {
                warn!(message_id = msg.id(), "publish confirm timed out");
                Err(AmqpError::PublishTimeoutError(timeout))
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "error waiting publish confirm");
                self.discard(generation).await;
                Err(publishing_error(err))
            }
            Ok(Ok(Confirmation::Ack)) => {
                debug!(message_id = msg.id(), "message confirmed");
                Ok(PublishResult::Confirmed)
            }
            Ok(Ok(Confirmation::Nack)) => {
                warn!(message_id = msg.id(), "message rejected by the broker");
                Ok(PublishResult::Rejected)
            }
            Ok(Ok(Confirmation::NotRequested)) => Ok(PublishResult::Unconfirmed),
        }
    }

    async fn connection(&self) -> Result<(Arc<dyn BrokerConnection>, u64), AmqpError> {
        match self.cfg.outage {
            OutagePolicy::FailFast => {
                let (connection, generation) = self.manager.current()?;
                if !connection.is_open() {
                    return Err(AmqpError::ConnectionError("connection lost".to_owned()));
                }
                Ok((connection, generation))
            }
            OutagePolicy::Wait => self.manager.wait_connected(self.cfg.outage_wait()).await,
        }
    }

    /// Channel of generation `generation`, opened on first use.
    async fn channel(
        &self,
        connection: Arc<dyn BrokerConnection>,
        generation: u64,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut cached = self.channel.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.generation == generation {
                return Ok(current.channel.clone());
            }
        }

        let channel = connection.create_channel().await?;
        if self.cfg.confirms {
            channel.enable_confirms().await?;
        }
        debug!(generation, "publisher channel opened");

        *cached = Some(PublishChannel {
            channel: channel.clone(),
            generation,
        });

        Ok(channel)
    }

    async fn discard(&self, generation: u64) {
        let mut cached = self.channel.lock().await;
        if cached.as_ref().is_some_and(|c| c.generation == generation) {
            *cached = None;
        }
    }
}

fn publishing_error(err: AmqpError) -> AmqpError {
    match err {
        AmqpError::PublishingError(_) => err,
        other => AmqpError::PublishingError(other.to_string()),
    }
}
