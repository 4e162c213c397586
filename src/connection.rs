// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! `ConnectionManager` owns the single long-lived broker connection. Once
//! connected, a supervisor task waits for the connection to close and
//! reconnects with exponential backoff. Every successful connection gets a new
//! generation number; producers and consumers use it to know when their
//! channels belong to a dead connection and must be reopened.
//!
//! State transitions are broadcast as [`ConnectionEvent`]s.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    configs::BackoffConfigs,
    errors::AmqpError,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

const EVENTS_CAPACITY: usize = 64;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&BackoffConfigs::default())
    }
}

impl From<&BackoffConfigs> for BackoffPolicy {
    fn from(cfg: &BackoffConfigs) -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(cfg.initial_ms),
            max: Duration::from_millis(cfg.max_ms),
            multiplier: cfg.multiplier,
            max_attempts: cfg.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.multiplier);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { generation: u64 },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

/// What producers and consumers see of the connection.
#[derive(Clone)]
pub(crate) enum Link {
    Down,
    Reconnecting,
    Up {
        connection: Arc<dyn BrokerConnection>,
        generation: u64,
    },
    Failed(u32),
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Down => ConnectionState::Disconnected,
            Link::Reconnecting => ConnectionState::Reconnecting,
            Link::Up { .. } => ConnectionState::Connected,
            Link::Failed(_) => ConnectionState::Failed,
        }
    }

    /// Up on a connection that is still open. The supervisor replaces a
    /// closed connection asynchronously, so `Up` alone can be stale.
    pub(crate) fn is_open(&self) -> bool {
        matches!(self, Link::Up { connection, .. } if connection.is_open())
    }

    pub(crate) fn is_final(&self) -> bool {
        matches!(self, Link::Failed(_))
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    link: watch::Sender<Link>,
    events: broadcast::Sender<ConnectionEvent>,
    generation: AtomicU64,
    shutdown: AtomicBool,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        debug!(event = ?event, "connection state changed");
        let _ = self.events.send(event);
    }

    fn up(&self, connection: Arc<dyn BrokerConnection>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.send_replace(Link::Up {
            connection,
            generation,
        });
        self.emit(ConnectionEvent::Connected { generation });
        generation
    }

    async fn supervise(self: Arc<Self>, mut connection: Arc<dyn BrokerConnection>) {
        loop {
            connection.closed().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            warn!("broker connection lost");
            self.link.send_replace(Link::Down);
            self.emit(ConnectionEvent::Disconnected);

            match self.reconnect().await {
                Ok(conn) => connection = conn,
                Err(err) => {
                    error!(error = err.to_string(), "giving up on the broker connection");
                    self.link.send_replace(Link::Failed(self.backoff.max_attempts));
                    self.emit(ConnectionEvent::Failed {
                        attempts: self.backoff.max_attempts,
                    });
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.link.send_replace(Link::Reconnecting);

        for attempt in 1..=self.backoff.max_attempts {
            let delay = self.backoff.delay(attempt);
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            if self.shutdown.load(Ordering::SeqCst) {
                return Err(AmqpError::ConnectionError("shutting down".to_owned()));
            }

            match self.connector.connect().await {
                Ok(conn) => {
                    let generation = self.up(conn.clone());
                    debug!(attempt, generation, "broker connection restored");
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "reconnect attempt failed")
                }
            }
        }

        Err(AmqpError::FatalConnectionError(self.backoff.max_attempts))
    }
}

/// Owns the broker connection and keeps it alive.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a manager that is not connected yet.
    ///
    /// # Parameters
    ///
    /// * `connector` - Opens broker connections, for the first connection and every reconnect.
    /// * `backoff` - Delays and attempt limit used once an established connection is lost.
    ///
    /// # Returns
    ///
    /// The manager, shared by the publisher, the dispatcher and the topology declarer.
    pub fn new(connector: Arc<dyn Connector>, backoff: BackoffPolicy) -> Arc<ConnectionManager> {
        let (link, _) = watch::channel(Link::Down);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        Arc::new(ConnectionManager {
            inner: Arc::new(Inner {
                connector,
                backoff,
                link,
                events,
                generation: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        })
    }

    /// Connects to the broker and starts supervising the connection.
    ///
    /// Makes a single attempt; a failure is returned as `ConnectionError` and
    /// the caller decides whether to try again.
    ///
    /// # Returns
    ///
    /// The live connection when already connected, or
    /// `ConnectionError("reconnecting")` while the supervisor is still
    /// restoring a lost connection. Use [`ConnectionManager::wait_connected`]
    /// to wait for it instead.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if let Ok((connection, _)) = self.current() {
            return Ok(connection);
        }
        if self.supervising() {
            return Err(AmqpError::ConnectionError("reconnecting".to_owned()));
        }

        let connection = self.inner.connector.connect().await?;
        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.inner.up(connection.clone());

        let supervisor = tokio::spawn(self.inner.clone().supervise(connection.clone()));
        if let Some(previous) = self.lock_supervisor().replace(supervisor) {
            previous.abort();
        }

        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.borrow().state()
    }

    /// Generation of the live connection, 0 before the first connection.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Subscribes to connection state transitions.
    ///
    /// Only events emitted after the call are received. A receiver that falls
    /// more than 64 events behind gets `RecvError::Lagged` and skips ahead.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Opens a new channel on the live connection.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (connection, _) = self.current()?;
        connection.create_channel().await
    }

    /// Waits until an open connection is available, at most `timeout`.
    ///
    /// # Parameters
    ///
    /// * `timeout` - Upper bound on the wait.
    ///
    /// # Returns
    ///
    /// The connection with its generation, `FatalConnectionError` once the
    /// supervisor gave up, or `ConnectionError` when `timeout` elapses first.
    pub async fn wait_connected(
        &self,
        timeout: Duration,
    ) -> Result<(Arc<dyn BrokerConnection>, u64), AmqpError> {
        let mut link = self.link();
        let waited = tokio::time::timeout(
            timeout,
            link.wait_for(|link| link.is_open() || link.is_final()),
        )
        .await;

        match waited {
            Ok(Ok(link)) => match &*link {
                Link::Up {
                    connection,
                    generation,
                } => Ok((connection.clone(), *generation)),
                Link::Failed(attempts) => Err(AmqpError::FatalConnectionError(*attempts)),
                _ => Err(AmqpError::InternalError),
            },
            Ok(Err(_)) => Err(AmqpError::InternalError),
            Err(_) => Err(AmqpError::ConnectionError(format!(
                "not connected after {:?}",
                timeout
            ))),
        }
    }

    /// Stops supervising and closes the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.lock_supervisor().take() {
            supervisor.abort();
        }

        let previous = self.inner.link.send_replace(Link::Down);
        self.inner.emit(ConnectionEvent::Disconnected);

        match previous {
            Link::Up { connection, .. } => connection.close().await,
            _ => Ok(()),
        }
    }

    pub(crate) fn current(&self) -> Result<(Arc<dyn BrokerConnection>, u64), AmqpError> {
        match &*self.inner.link.borrow() {
            Link::Up {
                connection,
                generation,
            } => Ok((connection.clone(), *generation)),
            Link::Failed(attempts) => Err(AmqpError::FatalConnectionError(*attempts)),
            _ => Err(AmqpError::ConnectionError("not connected".to_owned())),
        }
    }

    /// A supervisor still running owns the connection, even between a loss
    /// and the next reconnect attempt.
    fn supervising(&self) -> bool {
        self.lock_supervisor()
            .as_ref()
            .is_some_and(|supervisor| !supervisor.is_finished())
    }

    pub(crate) fn link(&self) -> watch::Receiver<Link> {
        self.inner.link.subscribe()
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.supervisor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.lock_supervisor().take() {
            supervisor.abort();
        }
    }
}
