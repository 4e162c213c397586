// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module consumes a queue and dispatches every delivery to a
//! `ConsumerHandler`. Each subscription owns a dedicated channel whose prefetch
//! equals the number of workers, a pump task moving deliveries from the broker
//! into a bounded buffer, and a fixed pool of workers draining that buffer.
//!
//! When the connection is lost the pump waits for the connection manager to
//! come back with a new generation and consumes again on a fresh channel; the
//! workers are not restarted.

use crate::{
    broker::{BrokerChannel, BrokerConnection, DeliveryStream, Incoming},
    configs::ConsumerConfigs,
    connection::{ConnectionManager, Link},
    consumer::{consume, RequeueTracker},
    errors::AmqpError,
    handler::ConsumerHandler,
};
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Starts subscriptions on the connection owned by a `ConnectionManager`.
pub struct RabbitMQDispatcher {
    manager: Arc<ConnectionManager>,
    cfg: ConsumerConfigs,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher consuming over the connection of `manager`.
    ///
    /// # Parameters
    ///
    /// * `manager` - Connection shared with the publisher, subscriptions follow its reconnects.
    /// * `cfg` - Worker count per subscription and requeue budget of retryable failures.
    ///
    /// # Returns
    ///
    /// A dispatcher that can subscribe any number of queues.
    pub fn new(manager: Arc<ConnectionManager>, cfg: ConsumerConfigs) -> Self {
        RabbitMQDispatcher { manager, cfg }
    }

    /// Consumes `queue` with `handler` until the returned handle is cancelled.
    ///
    /// # Parameters
    ///
    /// * `queue` - Queue to consume, it must already be declared.
    /// * `handler` - Runs once per delivery, on at most `concurrency` deliveries at a time.
    ///
    /// # Returns
    ///
    /// The handle of the running subscription. Fails with `ConnectionError`
    /// when the connection is down, or `ConsumerDeclarationError` when the
    /// queue cannot be consumed.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<SubscriptionHandle, AmqpError> {
        let (connection, generation) = self.manager.current()?;
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let prefetch = self.cfg.prefetch();

        let (channel, stream) = open(connection, queue, &consumer_tag, prefetch).await?;
        let slot = Arc::new(StdMutex::new(channel));

        let concurrency = self.cfg.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<Incoming>(concurrency);
        let rx = Arc::new(Mutex::new(rx));
        let (cancel, cancelled) = watch::channel(false);
        let requeues = Arc::new(RequeueTracker::default());

        let workers = (0..concurrency)
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    rx.clone(),
                    cancelled.clone(),
                    requeues.clone(),
                    handler.clone(),
                    queue.to_owned(),
                    self.cfg.max_requeue,
                ))
            })
            .collect();

        let pump = Pump {
            manager: self.manager.clone(),
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.clone(),
            prefetch,
            slot: slot.clone(),
            cancelled,
            tx,
        };
        let pump = tokio::spawn(pump.run(stream, generation));

        debug!(queue, consumer_tag, concurrency, "subscription started");

        Ok(SubscriptionHandle {
            queue: queue.to_owned(),
            consumer_tag,
            cancel,
            pump,
            workers,
            channel: slot,
        })
    }
}

/// Running subscription.
///
/// Dropping the handle leaves the subscription running until its connection
/// fails for good; use [`cancel`](Self::cancel) to stop it.
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: String,
    cancel: watch::Sender<bool>,
    pump: JoinHandle<Result<(), AmqpError>>,
    workers: Vec<JoinHandle<()>>,
    channel: Arc<StdMutex<Arc<dyn BrokerChannel>>>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops the subscription.
    ///
    /// No new delivery is taken once the broker consumer is cancelled. Handlers
    /// already running are awaited, deliveries buffered but not started are
    /// requeued, then the subscription channel is closed.
    pub async fn cancel(self) -> Result<(), AmqpError> {
        debug!(queue = self.queue, "cancelling subscription");
        self.cancel.send_replace(true);
        self.join().await
    }

    /// Waits for the subscription to end.
    ///
    /// Without a [`cancel`](Self::cancel) this only returns once the connection
    /// manager gave up reconnecting, with the error that ended it.
    pub async fn join(self) -> Result<(), AmqpError> {
        let res = match self.pump.await {
            Ok(res) => res,
            Err(err) => {
                error!(error = err.to_string(), "subscription pump failure");
                Err(AmqpError::InternalError)
            }
        };

        for joined in join_all(self.workers).await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "subscription worker failure");
            }
        }

        let channel = current_channel(&self.channel);
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "subscription channel already closed");
        }

        debug!(queue = self.queue, "subscription ended");
        res
    }
}

/// Opens a channel and starts consuming `queue` on it.
async fn open(
    connection: Arc<dyn BrokerConnection>,
    queue: &str,
    consumer_tag: &str,
    prefetch: u16,
) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
    let channel = connection.create_channel().await?;
    channel.qos(prefetch).await?;

    match channel.consume(queue, consumer_tag).await {
        Ok(stream) => Ok((channel, stream)),
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            let _ = channel.close().await;
            Err(err)
        }
    }
}

fn current_channel(slot: &StdMutex<Arc<dyn BrokerChannel>>) -> Arc<dyn BrokerChannel> {
    match slot.lock() {
        Ok(channel) => channel.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    let _ = cancelled.wait_for(|cancelled| *cancelled).await;
}

async fn requeue(incoming: Incoming) {
    if let Err(err) = incoming.acker.nack(true).await {
        warn!(error = err.to_string(), "failure to requeue buffered message");
    }
}

/// Moves deliveries from the broker into the worker buffer.
struct Pump {
    manager: Arc<ConnectionManager>,
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    slot: Arc<StdMutex<Arc<dyn BrokerChannel>>>,
    cancelled: watch::Receiver<bool>,
    tx: mpsc::Sender<Incoming>,
}

impl Pump {
    async fn run(mut self, mut stream: DeliveryStream, mut generation: u64) -> Result<(), AmqpError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancelled) => {
                    self.cancel_consumer().await;
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(incoming)) => {
                    let permit = tokio::select! {
                        biased;
                        _ = wait_cancelled(&mut self.cancelled) => None,
                        permit = self.tx.reserve() => permit.ok(),
                    };

                    match permit {
                        Some(permit) => permit.send(incoming),
                        None => {
                            requeue(incoming).await;
                            self.cancel_consumer().await;
                            return Ok(());
                        }
                    }
                }
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    if *self.cancelled.borrow() {
                        return Ok(());
                    }

                    warn!(queue = self.queue, generation, "consumer stream ended, resubscribing");
                    let mut cancelled = self.cancelled.clone();
                    let resubscribed = tokio::select! {
                        biased;
                        _ = wait_cancelled(&mut cancelled) => return Ok(()),
                        resubscribed = self.resubscribe() => resubscribed,
                    };

                    match resubscribed {
                        Ok((next_stream, next_generation)) => {
                            stream = next_stream;
                            generation = next_generation;
                        }
                        Err(err) => {
                            error!(error = err.to_string(), "subscription lost");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Consumes again once an open connection is available.
    ///
    /// The connection is either a newer generation or, when only the channel
    /// was lost, the same one.
    async fn resubscribe(&self) -> Result<(DeliveryStream, u64), AmqpError> {
        let (connection, generation) = next_link(self.manager.link()).await?;
        let (channel, stream) =
            open(connection, &self.queue, &self.consumer_tag, self.prefetch).await?;

        let previous = {
            let mut slot = match self.slot.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *slot, channel)
        };
        let _ = previous.close().await;

        debug!(queue = self.queue, generation, "subscription resumed");
        Ok((stream, generation))
    }

    async fn cancel_consumer(&self) {
        let channel = current_channel(&self.slot);
        if let Err(err) = channel.cancel(&self.consumer_tag).await {
            debug!(error = err.to_string(), "consumer already cancelled");
        }
    }
}

async fn next_link(
    mut link: watch::Receiver<Link>,
) -> Result<(Arc<dyn BrokerConnection>, u64), AmqpError> {
    let state = link
        .wait_for(|link| link.is_open() || link.is_final())
        .await
        .map_err(|_| AmqpError::InternalError)?;

    match &*state {
        Link::Up {
            connection,
            generation,
        } => Ok((connection.clone(), *generation)),
        Link::Failed(attempts) => Err(AmqpError::FatalConnectionError(*attempts)),
        _ => Err(AmqpError::InternalError),
    }
}

/// Runs handlers one delivery at a time until the buffer is closed.
async fn work(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Incoming>>>,
    cancelled: watch::Receiver<bool>,
    requeues: Arc<RequeueTracker>,
    handler: Arc<dyn ConsumerHandler>,
    queue: String,
    max_requeue: u32,
) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let incoming = rx.lock().await.recv().await;
        let Some(incoming) = incoming else {
            break;
        };

        if *cancelled.borrow() {
            requeue(incoming).await;
            continue;
        }

        let consumed = consume(
            &tracer,
            incoming,
            &queue,
            handler.as_ref(),
            max_requeue,
            &requeues,
        )
        .await;
        if let Err(err) = consumed {
            error!(error = err.to_string(), worker, "error consume msg");
        }
    }

    debug!(worker, queue, "worker stopped");
}
