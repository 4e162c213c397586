// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements what happens to a single delivery: a `DeliveryHandle`
//! is built around the broker acknowledger, the handler runs, and its outcome
//! decides between ack, requeue and dead-letter. Every delivery is processed
//! inside an OpenTelemetry consumer span.

use crate::{
    broker::{Acknowledger, Incoming},
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerError},
    otel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tracing::{debug, error, warn};

/// Lifecycle of a delivery: `Received` until exactly one settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Acknowledged,
    Requeued,
    DeadLettered,
}

impl DeliveryState {
    fn as_u8(self) -> u8 {
        match self {
            DeliveryState::Received => 0,
            DeliveryState::Acknowledged => 1,
            DeliveryState::Requeued => 2,
            DeliveryState::DeadLettered => 3,
        }
    }

    fn from_u8(value: u8) -> DeliveryState {
        match value {
            1 => DeliveryState::Acknowledged,
            2 => DeliveryState::Requeued,
            3 => DeliveryState::DeadLettered,
            _ => DeliveryState::Received,
        }
    }
}

/// Ownership token for an unacknowledged delivery.
///
/// Exactly one of [`ack`](Self::ack), [`nack_requeue`](Self::nack_requeue) or
/// [`nack_no_requeue`](Self::nack_no_requeue) succeeds. Any further attempt
/// fails with [`AmqpError::DeliveryAlreadySettled`] and never reaches the broker.
/// The settlement is claimed before the broker call, so a failed broker call
/// still consumes the handle; the broker redelivers the message once the
/// channel closes.
pub struct DeliveryHandle {
    acker: Arc<dyn Acknowledger>,
    state: AtomicU8,
    delivery_count: u32,
    redelivered: bool,
}

impl DeliveryHandle {
    pub(crate) fn new(
        acker: Arc<dyn Acknowledger>,
        delivery_count: u32,
        redelivered: bool,
    ) -> DeliveryHandle {
        DeliveryHandle {
            acker,
            state: AtomicU8::new(DeliveryState::Received.as_u8()),
            delivery_count,
            redelivered,
        }
    }

    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_settled(&self) -> bool {
        self.state() != DeliveryState::Received
    }

    /// Earlier delivery attempts of this message.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Removes the message from the queue for good.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.claim(DeliveryState::Acknowledged)?;
        self.acker.ack().await
    }

    /// Returns the message to the queue for another delivery.
    pub async fn nack_requeue(&self) -> Result<(), AmqpError> {
        self.claim(DeliveryState::Requeued)?;
        self.acker.nack(true).await
    }

    /// Rejects the message; the broker moves it to the dead-letter queue.
    pub async fn nack_no_requeue(&self) -> Result<(), AmqpError> {
        self.claim(DeliveryState::DeadLettered)?;
        self.acker.nack(false).await
    }

    fn claim(&self, target: DeliveryState) -> Result<(), AmqpError> {
        self.state
            .compare_exchange(
                DeliveryState::Received.as_u8(),
                target.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|current| AmqpError::DeliveryAlreadySettled(DeliveryState::from_u8(current)))
    }
}

/// Requeues tracked at most, the map is reset beyond this.
const TRACKED_REQUEUES_LIMIT: usize = 65_536;

/// Requeues made by this consumer, per message id.
///
/// Only quorum queues count delivery attempts. On classic queues the broker
/// count stays at zero, so the count used for the requeue budget is the larger
/// of the broker count and the requeues recorded here.
#[derive(Default)]
pub(crate) struct RequeueTracker {
    requeues: Mutex<HashMap<String, u32>>,
}

impl RequeueTracker {
    pub(crate) fn delivery_count(&self, message_id: &str, broker_count: u32) -> u32 {
        let local = self.lock().get(message_id).copied().unwrap_or_default();
        broker_count.max(local)
    }

    /// Remembers a requeue, forgets the message once it left the queue.
    pub(crate) fn record(&self, message_id: &str, delivery_count: u32, state: DeliveryState) {
        let mut requeues = self.lock();
        match state {
            DeliveryState::Requeued => {
                if requeues.len() >= TRACKED_REQUEUES_LIMIT {
                    warn!("too many requeued messages tracked, resetting counts");
                    requeues.clear();
                }
                requeues.insert(message_id.to_owned(), delivery_count.saturating_add(1));
            }
            DeliveryState::Acknowledged | DeliveryState::DeadLettered => {
                requeues.remove(message_id);
            }
            DeliveryState::Received => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        match self.requeues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// What to do with a delivery the handler did not settle itself.
pub(crate) fn settlement(
    result: &Result<(), HandlerError>,
    delivery_count: u32,
    max_requeue: u32,
) -> DeliveryState {
    match result {
        Ok(()) => DeliveryState::Acknowledged,
        Err(err) if !err.is_fatal() && delivery_count < max_requeue => DeliveryState::Requeued,
        Err(_) => DeliveryState::DeadLettered,
    }
}

/// Runs `handler` on one delivery and settles it.
///
/// A requeue is recorded in `requeues` before the message goes back to the
/// queue, so the redelivery already sees it whichever worker takes it.
/// Returns the final state of the delivery.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    incoming: Incoming,
    queue: &str,
    handler: &dyn ConsumerHandler,
    max_requeue: u32,
    requeues: &RequeueTracker,
) -> Result<DeliveryState, AmqpError> {
    let Incoming {
        message,
        redelivered,
        delivery_count,
        acker,
    } = incoming;
    let delivery_count = requeues.delivery_count(message.id(), delivery_count);

    let (ctx, mut span) = otel::new_span(&message, tracer, queue);

    debug!(
        message_id = message.id(),
        routing_key = message.routing_key(),
        delivery_count,
        "received message via the queue {}",
        queue
    );

    let handle = DeliveryHandle::new(acker, delivery_count, redelivered);
    let result = handler.exec(&ctx, &message, &handle).await;

    if handle.is_settled() {
        debug!(state = ?handle.state(), "message settled by the handler");
        requeues.record(message.id(), delivery_count, handle.state());
        span.set_status(Status::Ok);
        return Ok(handle.state());
    }

    let target = settlement(&result, delivery_count, max_requeue);
    let settled = match target {
        DeliveryState::Acknowledged => {
            debug!("message successfully processed");
            handle.ack().await
        }
        DeliveryState::Requeued => {
            warn!(
                message_id = message.id(),
                delivery_count, "error whiling handling msg, requeuing for latter"
            );
            requeues.record(message.id(), delivery_count, target);
            handle.nack_requeue().await
        }
        _ => {
            match &result {
                Err(err) if !err.is_fatal() => {
                    error!(message_id = message.id(), "too many attempts, sending to dlq")
                }
                Err(err) => error!(
                    message_id = message.id(),
                    error = err.to_string(),
                    "fatal failure, sending to dlq"
                ),
                Ok(()) => {}
            }
            handle.nack_no_requeue().await
        }
    };

    if let Err(err) = &result {
        span.record_error(err);
    }

    match settled {
        Err(err) => {
            error!(error = err.to_string(), "error whiling settling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            Err(err)
        }
        Ok(()) => {
            requeues.record(message.id(), delivery_count, target);
            if result.is_ok() {
                span.set_status(Status::Ok);
            } else {
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });
            }
            Ok(target)
        }
    }
}
