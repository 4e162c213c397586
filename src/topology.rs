// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes the broker topology of the messaging core and installs it.
//! A `Topology` names a main exchange and queue plus their dead-letter
//! counterparts; it expands into exchange, queue and binding definitions that
//! the declarer sends to the broker.
//!
//! The main components are:
//! - `Topology`: value object with the names and options of the wiring
//! - `TopologyDeclarer` trait: interface for installing a topology
//! - `AmqpTopologyDeclarer`: declares through a dedicated broker channel

use crate::{
    configs::TopologyConfigs,
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Routing key of dead-lettered messages when none is configured
pub const DEFAULT_DEAD_LETTER_ROUTING_KEY: &str = "deadLetter";

/// Main exchange and queue wired to a dead-letter exchange and queue.
///
/// Every message rejected from the main queue, or expiring or overflowing in
/// it, is republished by the broker on the dead-letter exchange with a single
/// dead-letter routing key. That key must differ from the main routing key so
/// dead-lettered messages can never be routed back to the main queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchange_name: String,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) queue_name: String,
    pub(crate) routing_key: String,
    pub(crate) dead_letter_exchange_name: String,
    pub(crate) dead_letter_queue_name: String,
    pub(crate) dead_letter_routing_key: String,
    pub(crate) durable: bool,
    pub(crate) quorum: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) internal_dead_letter_exchange: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl Topology {
    /// Topic exchange `exchange` routing `routing_key` to durable quorum queue
    /// `queue`, dead-lettering through `<exchange>.dlx` into `<queue>.dlq`.
    ///
    /// # Parameters
    ///
    /// * `exchange` - Name of the main exchange messages are published on.
    /// * `queue` - Name of the main queue consumers subscribe to.
    /// * `routing_key` - Binding key of the main queue, a topic pattern by default.
    ///
    /// # Returns
    ///
    /// A topology with the dead-letter routing key `deadLetter`, to be
    /// checked with [`Topology::validate`] once all options are set.
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Topology {
        Topology {
            exchange_name: exchange.to_owned(),
            exchange_kind: ExchangeKind::Topic,
            queue_name: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            dead_letter_exchange_name: format!("{}.dlx", exchange),
            dead_letter_queue_name: format!("{}.dlq", queue),
            dead_letter_routing_key: DEFAULT_DEAD_LETTER_ROUTING_KEY.to_owned(),
            durable: true,
            quorum: true,
            auto_delete: false,
            exclusive: false,
            internal_dead_letter_exchange: false,
            ttl: None,
            max_length: None,
        }
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn dead_letter_exchange(mut self, name: &str) -> Self {
        self.dead_letter_exchange_name = name.to_owned();
        self
    }

    pub fn dead_letter_queue(mut self, name: &str) -> Self {
        self.dead_letter_queue_name = name.to_owned();
        self
    }

    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = key.to_owned();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn quorum(mut self, quorum: bool) -> Self {
        self.quorum = quorum;
        self
    }

    /// The main exchange and queue are deleted by the broker once unused.
    ///
    /// Only valid on classic queues: `quorum(false)`.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// The main queue belongs to the declaring connection and goes away with it.
    ///
    /// Only valid on classic queues: `quorum(false)`.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Clients can no longer publish on the dead-letter exchange, only the
    /// broker dead-letters through it.
    pub fn internal_dead_letter_exchange(mut self, internal: bool) -> Self {
        self.internal_dead_letter_exchange = internal;
        self
    }

    /// Messages older than `ttl` milliseconds in the main queue are dead-lettered.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Messages beyond `max` in the main queue are dead-lettered, oldest first.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Exchange the publisher sends to.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Binding key of the main queue.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn dead_letter_exchange_name(&self) -> &str {
        &self.dead_letter_exchange_name
    }

    pub fn dead_letter_queue_name(&self) -> &str {
        &self.dead_letter_queue_name
    }

    /// Key the broker sets on every message it dead-letters from the main queue.
    pub fn dead_letter_routing_key_name(&self) -> &str {
        &self.dead_letter_routing_key
    }

    /// Checks the wiring cannot loop dead-lettered messages back into the main queue.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let names = [
            ("exchange", &self.exchange_name),
            ("queue", &self.queue_name),
            ("dead letter exchange", &self.dead_letter_exchange_name),
            ("dead letter queue", &self.dead_letter_queue_name),
            ("dead letter routing key", &self.dead_letter_routing_key),
        ];
        for (what, name) in names {
            if name.is_empty() {
                return Err(AmqpError::InvalidTopologyError(format!("empty {}", what)));
            }
        }

        if self.dead_letter_routing_key == self.routing_key {
            return Err(AmqpError::InvalidTopologyError(format!(
                "dead letter routing key `{}` equals the main routing key",
                self.routing_key
            )));
        }

        if self.dead_letter_queue_name == self.queue_name {
            return Err(AmqpError::InvalidTopologyError(format!(
                "dead letter queue `{}` is the main queue",
                self.queue_name
            )));
        }

        if self.dead_letter_exchange_name == self.exchange_name {
            return Err(AmqpError::InvalidTopologyError(format!(
                "dead letter exchange `{}` is the main exchange",
                self.exchange_name
            )));
        }

        if self.quorum && !self.durable {
            return Err(AmqpError::InvalidTopologyError(
                "quorum queues must be durable".to_owned(),
            ));
        }

        if self.quorum && (self.exclusive || self.auto_delete) {
            return Err(AmqpError::InvalidTopologyError(
                "quorum queues cannot be exclusive or auto-delete".to_owned(),
            ));
        }

        Ok(())
    }

    /// Main exchange then dead-letter exchange.
    pub fn exchanges(&self) -> Vec<ExchangeDefinition> {
        let mut main = ExchangeDefinition::new(&self.exchange_name).kind(self.exchange_kind);
        let mut dlx = ExchangeDefinition::new(&self.dead_letter_exchange_name).direct();
        if self.durable {
            main = main.durable();
            dlx = dlx.durable();
        }
        if self.auto_delete {
            main = main.delete();
        }
        if self.internal_dead_letter_exchange {
            dlx = dlx.internal();
        }

        vec![main, dlx]
    }

    /// Dead-letter queue then main queue.
    ///
    /// Auto-delete and exclusivity apply to the main queue only, the
    /// dead-letter queue outlives its consumers.
    pub fn queues(&self) -> Vec<QueueDefinition> {
        let mut dlq = QueueDefinition::new(&self.dead_letter_queue_name);
        let mut main = QueueDefinition::new(&self.queue_name)
            .dead_letter_exchange(&self.dead_letter_exchange_name)
            .dead_letter_routing_key(&self.dead_letter_routing_key);

        if self.durable {
            dlq = dlq.durable();
            main = main.durable();
        }
        if self.quorum {
            dlq = dlq.quorum();
            main = main.quorum();
        }
        if self.auto_delete {
            main = main.delete();
        }
        if self.exclusive {
            main = main.exclusive();
        }
        if let Some(ttl) = self.ttl {
            main = main.ttl(ttl);
        }
        if let Some(max) = self.max_length {
            main = main.max_length(max);
        }

        vec![dlq, main]
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        vec![
            QueueBinding::new(&self.queue_name)
                .exchange(&self.exchange_name)
                .routing_key(&self.routing_key),
            QueueBinding::new(&self.dead_letter_queue_name)
                .exchange(&self.dead_letter_exchange_name)
                .routing_key(&self.dead_letter_routing_key),
        ]
    }
}

impl From<&TopologyConfigs> for Topology {
    fn from(cfg: &TopologyConfigs) -> Self {
        let mut topology = Topology::new(&cfg.exchange, &cfg.queue, &cfg.routing_key)
            .dead_letter_routing_key(&cfg.dead_letter_routing_key)
            .durable(cfg.durable)
            .quorum(cfg.quorum);

        if let Some(dlx) = &cfg.dead_letter_exchange {
            topology = topology.dead_letter_exchange(dlx);
        }
        if let Some(dlq) = &cfg.dead_letter_queue {
            topology = topology.dead_letter_queue(dlq);
        }

        topology
    }
}

/// Installs a topology on the broker.
///
/// Declaring the same topology again is a no-op; declaring a topology that
/// conflicts with what the broker already has fails with
/// `TopologyConflictError` and leaves the existing entities untouched.
#[async_trait]
pub trait TopologyDeclarer {
    async fn declare(&self, topology: &Topology) -> Result<(), AmqpError>;
}

pub struct AmqpTopologyDeclarer {
    manager: Arc<ConnectionManager>,
}

impl AmqpTopologyDeclarer {
    /// Declares through channels opened on `manager`, one per call to `declare`.
    pub fn new(manager: Arc<ConnectionManager>) -> AmqpTopologyDeclarer {
        AmqpTopologyDeclarer { manager }
    }
}

#[async_trait]
impl TopologyDeclarer for AmqpTopologyDeclarer {
    /// Declares exchanges, then queues, then bindings, on a channel of its own
    /// since a refused declaration closes the channel it was sent on.
    async fn declare(&self, topology: &Topology) -> Result<(), AmqpError> {
        topology.validate()?;

        let channel = self.manager.channel().await?;

        let result = async {
            for exchange in topology.exchanges() {
                channel.declare_exchange(&exchange).await?;
            }

            for queue in topology.queues() {
                channel.declare_queue(&queue).await?;
            }

            for binding in topology.bindings() {
                channel.bind_queue(&binding).await?;
            }

            Ok::<(), AmqpError>(())
        }
        .await;

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "declaration channel already closed");
        }

        match result {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare topology");
                Err(err)
            }
            Ok(()) => {
                debug!(
                    exchange = topology.exchange_name,
                    queue = topology.queue_name,
                    "topology declared"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::BackoffPolicy, memory::InMemoryBroker};

    #[test]
    fn test_default_names_follow_main_names() {
        let topology = Topology::new("t", "tq", "tutorial");

        assert_eq!(topology.dead_letter_exchange_name(), "t.dlx");
        assert_eq!(topology.dead_letter_queue_name(), "tq.dlq");
        assert_eq!(topology.dead_letter_routing_key_name(), "deadLetter");
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_queues_point_to_dead_letter_exchange() {
        let topology = Topology::new("t", "tq", "tutorial").ttl(10_000);
        let queues = topology.queues();

        let main = &queues[1];
        assert_eq!(main.name(), "tq");
        assert_eq!(main.dead_letter_exchange.as_deref(), Some("t.dlx"));
        assert_eq!(main.dead_letter_routing_key.as_deref(), Some("deadLetter"));
        assert_eq!(main.ttl, Some(10_000));
        assert!(main.durable && main.quorum);

        let dlq = &queues[0];
        assert_eq!(dlq.name(), "tq.dlq");
        assert!(dlq.dead_letter_exchange.is_none());
    }

    #[test]
    fn test_bindings_use_distinct_keys() {
        let bindings = Topology::new("t", "tq", "tutorial").bindings();

        assert_eq!(
            bindings[0],
            QueueBinding::new("tq").exchange("t").routing_key("tutorial")
        );
        assert_eq!(
            bindings[1],
            QueueBinding::new("tq.dlq")
                .exchange("t.dlx")
                .routing_key("deadLetter")
        );
    }

    #[test]
    fn test_exchanges() {
        let exchanges = Topology::new("t", "tq", "tutorial").exchanges();
        assert_eq!(exchanges[0], ExchangeDefinition::new("t").topic().durable());
        assert_eq!(exchanges[1], ExchangeDefinition::new("t.dlx").direct().durable());
    }

    #[test]
    fn test_validation_rejects_loops() {
        let same_key = Topology::new("t", "tq", "deadLetter");
        assert!(matches!(
            same_key.validate(),
            Err(AmqpError::InvalidTopologyError(_))
        ));

        let same_queue = Topology::new("t", "tq", "tutorial").dead_letter_queue("tq");
        assert!(matches!(
            same_queue.validate(),
            Err(AmqpError::InvalidTopologyError(_))
        ));

        let same_exchange = Topology::new("t", "tq", "tutorial").dead_letter_exchange("t");
        assert!(matches!(
            same_exchange.validate(),
            Err(AmqpError::InvalidTopologyError(_))
        ));

        let transient_quorum = Topology::new("t", "tq", "tutorial").durable(false);
        assert!(matches!(
            transient_quorum.validate(),
            Err(AmqpError::InvalidTopologyError(_))
        ));

        assert!(Topology::new("", "tq", "tutorial").validate().is_err());
    }

    #[test]
    fn test_transient_classic_options() {
        let topology = Topology::new("t", "tq", "tutorial")
            .durable(false)
            .quorum(false)
            .auto_delete(true)
            .exclusive(true)
            .internal_dead_letter_exchange(true);
        assert!(topology.validate().is_ok());

        let exchanges = topology.exchanges();
        assert_eq!(exchanges[0], ExchangeDefinition::new("t").topic().delete());
        assert_eq!(exchanges[1], ExchangeDefinition::new("t.dlx").direct().internal());

        let queues = topology.queues();
        assert!(queues[1].delete && queues[1].exclusive && !queues[1].quorum);
        assert!(!queues[0].delete && !queues[0].exclusive);

        let exclusive_quorum = Topology::new("t", "tq", "tutorial").exclusive(true);
        assert!(matches!(
            exclusive_quorum.validate(),
            Err(AmqpError::InvalidTopologyError(_))
        ));

        let auto_delete_quorum = Topology::new("t", "tq", "tutorial").auto_delete(true);
        assert!(matches!(
            auto_delete_quorum.validate(),
            Err(AmqpError::InvalidTopologyError(_))
        ));
    }

    #[test]
    fn test_from_configs() {
        let cfg = TopologyConfigs {
            exchange: "t".to_owned(),
            queue: "tq".to_owned(),
            dead_letter_queue: Some("parking".to_owned()),
            ..TopologyConfigs::default()
        };

        let topology = Topology::from(&cfg);
        assert_eq!(topology.routing_key(), "tutorial");
        assert_eq!(topology.dead_letter_exchange_name(), "t.dlx");
        assert_eq!(topology.dead_letter_queue_name(), "parking");
    }

    async fn declarer(broker: &InMemoryBroker) -> AmqpTopologyDeclarer {
        let manager = ConnectionManager::new(Arc::new(broker.connector()), BackoffPolicy::default());
        manager.connect().await.unwrap();
        AmqpTopologyDeclarer::new(manager)
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        let declarer = declarer(&broker).await;
        let topology = Topology::new("t", "tq", "tutorial");

        declarer.declare(&topology).await.unwrap();
        declarer.declare(&topology).await.unwrap();

        assert_eq!(broker.exchange_count(), 2);
        assert_eq!(broker.queue_count(), 2);
        assert_eq!(broker.binding_count(), 2);
        assert!(broker.has_binding(
            &QueueBinding::new("tq.dlq")
                .exchange("t.dlx")
                .routing_key("deadLetter")
        ));
    }

    #[tokio::test]
    async fn test_conflicting_declare_keeps_existing() {
        let broker = InMemoryBroker::new();
        let declarer = declarer(&broker).await;

        declarer
            .declare(&Topology::new("t", "tq", "tutorial"))
            .await
            .unwrap();

        let res = declarer
            .declare(&Topology::new("t", "tq", "tutorial").ttl(5_000))
            .await;

        assert_eq!(res, Err(AmqpError::TopologyConflictError("tq".to_owned())));
        assert_eq!(broker.queue_count(), 2);

        // the manager keeps working after a refused declaration
        declarer
            .declare(&Topology::new("t", "tq", "tutorial"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_topology_is_not_declared() {
        let broker = InMemoryBroker::new();
        let declarer = declarer(&broker).await;

        let res = declarer
            .declare(&Topology::new("t", "tq", "deadLetter"))
            .await;

        assert!(matches!(res, Err(AmqpError::InvalidTopologyError(_))));
        assert_eq!(broker.exchange_count(), 0);
    }
}
