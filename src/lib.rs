// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Durable Point-to-Point Messaging over AMQP
//!
//! Publish records to a RabbitMQ exchange and consume them with at-least-once
//! semantics. Every queue is wired to a dead-letter exchange so that a message
//! a handler gives up on ends in a dead-letter queue instead of being dropped.
//!
//! A typical setup:
//!
//! ```no_run
//! use rabbitmq_tutorial::{
//!     channel::AmqpConnector, configs::Configs, connection::{BackoffPolicy, ConnectionManager},
//!     publisher::RabbitMQPublisher, topology::{AmqpTopologyDeclarer, Topology, TopologyDeclarer},
//!     message::TutorialRecord,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), rabbitmq_tutorial::errors::AmqpError> {
//! let cfg = Configs::load()?;
//! let connector = AmqpConnector::new(&cfg.rabbitmq, &cfg.app);
//! let manager = ConnectionManager::new(Arc::new(connector), BackoffPolicy::from(&cfg.backoff));
//! manager.connect().await?;
//!
//! let topology = Topology::from(&cfg.topology);
//! AmqpTopologyDeclarer::new(manager.clone()).declare(&topology).await?;
//!
//! let publisher = RabbitMQPublisher::new(manager.clone(), cfg.publisher.clone());
//! let msg = TutorialRecord::new("hello").into_message(topology.routing_key())?;
//! publisher.publish(&msg, &topology).await?;
//! # Ok(())
//! # }
//! ```

mod otel;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use consumer::{DeliveryHandle, DeliveryState};
pub use dispatcher::{RabbitMQDispatcher, SubscriptionHandle};
pub use errors::AmqpError;
pub use handler::{ConsumerHandler, HandlerError};
pub use message::{Message, TutorialRecord};
pub use publisher::{PublishResult, RabbitMQPublisher};
pub use topology::{AmqpTopologyDeclarer, Topology, TopologyDeclarer};
