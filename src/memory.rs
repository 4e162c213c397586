// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing the same traits as the lapin transport.
//! It follows the AMQP 0-9-1 model closely enough to exercise the messaging
//! core without a RabbitMQ server:
//!
//! - default, direct, fanout and topic exchanges (`*` and `#` wildcards);
//! - idempotent declarations, conflicting re-declarations are refused;
//! - unacknowledged deliveries are tracked per channel and go back to their
//!   queue when the channel or its connection closes;
//! - quorum queues count delivery attempts on every return to the queue,
//!   classic queues only flag the message as redelivered;
//! - rejected, expired and overflowing messages follow the queue dead-letter
//!   arguments;
//! - publisher confirms, with switches to nack or withhold them;
//! - internal exchanges refuse client publishes but take dead letters.
//!
//! Headers exchanges route to every bound queue, binding arguments are not
//! modelled.

use crate::{
    broker::{
        Acknowledger, BrokerChannel, BrokerConnection, Confirmation, Connector, DeliveryStream,
        Incoming, PendingConfirm,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future, stream, FutureExt, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};
use tracing::{debug, warn};

const DEAD_LETTER_REJECTED: &str = "rejected";
const DEAD_LETTER_EXPIRED: &str = "expired";
const DEAD_LETTER_MAX_LENGTH: &str = "maxlen";

/// How publisher confirms are answered on channels in confirm mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    #[default]
    Ack,
    Nack,
    /// Never answer, the confirm future stays pending.
    Withhold,
}

#[derive(Clone)]
struct Stored {
    message: Message,
    exchange: String,
    delivery_count: u32,
    redelivered: bool,
    enqueued_at: Instant,
}

struct Unacked {
    channel_id: u64,
    stored: Stored,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

struct ConsumerEntry {
    channel_id: u64,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, watch::Sender<bool>>,
    channels: HashMap<u64, u64>,
    consumers: HashMap<String, ConsumerEntry>,
    next_id: u64,
    refused_connections: u32,
    confirm_mode: ConfirmMode,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Routes a message published by a client, which internal exchanges refuse.
    fn publish(&mut self, exchange: &str, message: Message) -> Result<usize, AmqpError> {
        if self.exchanges.get(exchange).is_some_and(|def| def.internal) {
            return Err(AmqpError::PublishingError(format!(
                "access refused, exchange `{}` is internal",
                exchange
            )));
        }

        self.route(exchange, message)
    }

    /// Routes `message` published to `exchange`, returns how many queues got it.
    fn route(&mut self, exchange: &str, message: Message) -> Result<usize, AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(message.routing_key()) {
                vec![message.routing_key().to_owned()]
            } else {
                vec![]
            }
        } else {
            let Some(def) = self.exchanges.get(exchange) else {
                return Err(AmqpError::PublishingError(format!(
                    "no exchange `{}`",
                    exchange
                )));
            };

            let kind = def.kind;
            let mut targets = vec![];
            for binding in &self.bindings {
                if binding.exchange_name == exchange
                    && routes(kind, &binding.routing_key, message.routing_key())
                    && !targets.contains(&binding.queue_name)
                {
                    targets.push(binding.queue_name.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(
                exchange,
                routing_key = message.routing_key(),
                "message unroutable, dropped"
            );
        }

        for queue in &targets {
            self.enqueue(
                queue,
                Stored {
                    message: message.clone(),
                    exchange: exchange.to_owned(),
                    delivery_count: 0,
                    redelivered: false,
                    enqueued_at: Instant::now(),
                },
            );
        }

        Ok(targets.len())
    }

    fn enqueue(&mut self, queue: &str, stored: Stored) {
        let overflow = {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };

            state.ready.push_back(stored);
            state.notify.notify_one();

            let mut overflow = vec![];
            if let Some(max) = state.def.max_length {
                let max = usize::try_from(max.max(0)).unwrap_or_default();
                while state.ready.len() > max {
                    if let Some(head) = state.ready.pop_front() {
                        overflow.push(head);
                    }
                }
            }
            overflow
        };

        for head in overflow {
            self.dead_letter(queue, head, DEAD_LETTER_MAX_LENGTH);
        }
    }

    /// Reroutes a message through the queue dead letter exchange, or drops it
    /// when the queue has none.
    fn dead_letter(&mut self, queue: &str, stored: Stored, reason: &str) {
        let Some(def) = self.queues.get(queue).map(|q| q.def.clone()) else {
            return;
        };

        let Some(exchange) = def.dead_letter_exchange else {
            debug!(queue, reason, "no dead letter exchange, message dropped");
            return;
        };

        let routing_key = def
            .dead_letter_routing_key
            .unwrap_or_else(|| stored.message.routing_key().to_owned());
        let message = stored
            .message
            .dead_lettered(&routing_key, reason, queue, &stored.exchange);

        debug!(queue, reason, exchange, "dead lettering message");
        if let Err(err) = self.route(&exchange, message) {
            warn!(error = err.to_string(), queue, "failure to dead letter message");
        }
    }

    /// Moves expired messages at the head of `queue` to its dead letter exchange.
    fn expire(&mut self, queue: &str) {
        let expired = {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            let Some(ttl) = state.def.ttl else {
                return;
            };

            let ttl = Duration::from_millis(u64::try_from(ttl.max(0)).unwrap_or_default());
            let now = Instant::now();
            let mut expired = vec![];
            while state
                .ready
                .front()
                .is_some_and(|head| now.duration_since(head.enqueued_at) >= ttl)
            {
                if let Some(head) = state.ready.pop_front() {
                    expired.push(head);
                }
            }
            expired
        };

        for stored in expired {
            self.dead_letter(queue, stored, DEAD_LETTER_EXPIRED);
        }
    }

    /// Returns every delivery still unacknowledged on `channel_id` to its queue.
    fn release_channel(&mut self, channel_id: u64) {
        self.channels.remove(&channel_id);

        self.consumers.retain(|_, consumer| {
            if consumer.channel_id == channel_id {
                consumer.cancel.send_replace(true);
                false
            } else {
                true
            }
        });

        for state in self.queues.values_mut() {
            let mut tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();

            // push_front in reverse keeps the original delivery order
            let mut returned = false;
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = state.unacked.remove(&tag) {
                    let mut stored = unacked.stored;
                    if state.def.quorum {
                        stored.delivery_count += 1;
                    }
                    stored.redelivered = true;
                    state.ready.push_front(stored);
                    returned = true;
                }
            }

            if returned {
                state.notify.notify_one();
            }
        }
    }

    fn drop_connection(&mut self, connection_id: u64) {
        if let Some(open) = self.connections.remove(&connection_id) {
            open.send_replace(false);
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, conn)| **conn == connection_id)
            .map(|(channel, _)| *channel)
            .collect();

        for channel in channels {
            self.release_channel(channel);
        }
    }
}

/// Topic patterns: words separated by dots, `*` matches one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(word), Some(other)) if word == other => match_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
    }
}

struct Shared {
    state: Mutex<BrokerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle on an in-process broker; clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Opens a connection directly, ignoring `refuse_connections`.
    pub fn open_connection(&self) -> Arc<MemoryConnection> {
        let mut state = self.shared.lock();
        let id = state.next_id();
        let (open_tx, open) = watch::channel(true);
        state.connections.insert(id, open_tx);

        Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
            open,
        })
    }

    /// The next `count` connection attempts through the connector fail.
    pub fn refuse_connections(&self, count: u32) {
        self.shared.lock().refused_connections = count;
    }

    /// Closes every open connection as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(id);
        }
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.shared.lock().confirm_mode = mode;
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn exchange_count(&self) -> usize {
        self.shared.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.shared.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.shared.lock().bindings.len()
    }

    pub fn has_binding(&self, binding: &QueueBinding) -> bool {
        self.shared.lock().bindings.contains(binding)
    }

    /// Messages ready for delivery in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        let mut state = self.shared.lock();
        state.expire(queue);
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of the messages ready for delivery in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        let mut state = self.shared.lock();
        state.expire(queue);
        state.queues.get(queue).map_or(vec![], |q| {
            q.ready.iter().map(|stored| stored.message.clone()).collect()
        })
    }

    /// Publishes through the broker without a channel, as another client would.
    pub fn inject(&self, exchange: &str, message: Message) -> Result<usize, AmqpError> {
        self.shared.lock().publish(exchange, message)
    }
}

pub struct MemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        {
            let mut state = self.broker.shared.lock();
            if state.refused_connections > 0 {
                state.refused_connections -= 1;
                return Err(AmqpError::ConnectionError("connection refused".to_owned()));
            }
        }

        Ok(self.broker.open_connection())
    }
}

pub struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    open: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.shared.lock();
        if !*self.open.borrow() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(id, self.id);

        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
            open: self.open.clone(),
            confirms: AtomicBool::new(false),
        }))
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    async fn closed(&self) {
        let mut open = self.open.clone();
        let _ = open.wait_for(|open| !*open).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shared.lock().drop_connection(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    open: watch::Receiver<bool>,
    confirms: AtomicBool,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.shared.lock();
        if !*self.open.borrow() || !state.channels.contains_key(&self.id) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name.is_empty() {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        let mut state = self.state()?;
        match state.exchanges.get(&def.name) {
            Some(existing) if existing == def => Ok(()),
            Some(_) => Err(AmqpError::TopologyConflictError(def.name.clone())),
            None => {
                debug!("exchange: {} was created", def.name);
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if def.name.is_empty() {
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        let mut state = self.state()?;
        match state.queues.get(&def.name) {
            Some(existing) if existing.def == *def => Ok(()),
            Some(_) => Err(AmqpError::TopologyConflictError(def.name.clone())),
            None => {
                debug!("queue: {} was created", def.name);
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.state()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &Message,
    ) -> Result<PendingConfirm, AmqpError> {
        let mut state = self.state()?;
        state.publish(exchange, message.clone())?;

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(future::ready(Ok::<_, AmqpError>(Confirmation::NotRequested)).boxed());
        }

        Ok(match state.confirm_mode {
            ConfirmMode::Ack => future::ready(Ok::<_, AmqpError>(Confirmation::Ack)).boxed(),
            ConfirmMode::Nack => future::ready(Ok::<_, AmqpError>(Confirmation::Nack)).boxed(),
            ConfirmMode::Withhold => future::pending::<Result<Confirmation, AmqpError>>().boxed(),
        })
    }

    async fn qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        self.state()?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state()?;
        let Some(notify) = state.queues.get(queue).map(|q| q.notify.clone()) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        if state.consumers.contains_key(consumer_tag) {
            return Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()));
        }

        let (cancel_tx, cancelled) = watch::channel(false);
        state.consumers.insert(
            consumer_tag.to_owned(),
            ConsumerEntry {
                channel_id: self.id,
                cancel: cancel_tx,
            },
        );

        let cursor = Cursor {
            shared: self.shared.clone(),
            queue: queue.to_owned(),
            channel_id: self.id,
            notify,
            cancelled,
            open: self.open.clone(),
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            loop {
                if *cursor.cancelled.borrow() || !*cursor.open.borrow() {
                    return None;
                }

                if let Some(incoming) = cursor.take_next() {
                    return Some((Ok::<Incoming, AmqpError>(incoming), cursor));
                }

                tokio::select! {
                    _ = cursor.notify.notified() => {}
                    res = cursor.cancelled.changed() => if res.is_err() { return None; },
                    res = cursor.open.changed() => if res.is_err() { return None; },
                }
            }
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        match state.consumers.remove(consumer_tag) {
            Some(consumer) => {
                consumer.cancel.send_replace(true);
                Ok(())
            }
            None => Err(AmqpError::ConsumerError(format!(
                "unknown consumer `{}`",
                consumer_tag
            ))),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shared.lock().release_channel(self.id);
        Ok(())
    }
}

struct Cursor {
    shared: Arc<Shared>,
    queue: String,
    channel_id: u64,
    notify: Arc<Notify>,
    cancelled: watch::Receiver<bool>,
    open: watch::Receiver<bool>,
}

impl Cursor {
    fn take_next(&self) -> Option<Incoming> {
        let mut state = self.shared.lock();
        if !state.channels.contains_key(&self.channel_id) {
            return None;
        }

        state.expire(&self.queue);
        let tag = state.next_id();
        let queue = state.queues.get_mut(&self.queue)?;
        let stored = queue.ready.pop_front()?;

        let incoming = Incoming {
            message: stored.message.clone(),
            redelivered: stored.redelivered,
            delivery_count: stored.delivery_count,
            acker: Arc::new(MemoryAcker {
                shared: self.shared.clone(),
                queue: self.queue.clone(),
                tag,
            }),
        };

        queue.unacked.insert(
            tag,
            Unacked {
                channel_id: self.channel_id,
                stored,
            },
        );

        Some(incoming)
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState) -> Option<Stored> {
        state
            .queues
            .get_mut(&self.queue)?
            .unacked
            .remove(&self.tag)
            .map(|unacked| unacked.stored)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let mut state = self.shared.lock();
        self.take(&mut state).map(|_| ()).ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.shared.lock();
        let Some(mut stored) = self.take(&mut state) else {
            return Err(if requeue {
                AmqpError::RequeuingMessageError
            } else {
                AmqpError::NackMessageError
            });
        };

        if requeue {
            stored.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                // only quorum queues track x-delivery-count
                if queue.def.quorum {
                    stored.delivery_count += 1;
                }
                queue.ready.push_back(stored);
                queue.notify.notify_one();
            }
        } else {
            state.dead_letter(&self.queue, stored, DEAD_LETTER_REJECTED);
        }

        Ok(())
    }
}
