// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_tutorial::{
    configs::{ConsumerConfigs, OutagePolicy, PublisherConfigs},
    connection::{BackoffPolicy, ConnectionEvent, ConnectionManager},
    memory::InMemoryBroker,
    message::AMQP_HEADERS_FIRST_DEATH_REASON,
    AmqpError, AmqpTopologyDeclarer, ConsumerHandler, DeliveryHandle, DeliveryState,
    HandlerError, Message, PublishResult, RabbitMQDispatcher, RabbitMQPublisher, Topology,
    TopologyDeclarer, TutorialRecord,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Records the id of every message it sees and answers with a fixed outcome.
struct Recorder {
    ids: Mutex<Vec<String>>,
    outcome: Result<(), HandlerError>,
}

impl Recorder {
    fn new(outcome: Result<(), HandlerError>) -> Arc<Recorder> {
        Arc::new(Recorder {
            ids: Mutex::new(vec![]),
            outcome,
        })
    }

    fn ids(&self) -> Vec<String> {
        self.ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsumerHandler for Recorder {
    async fn exec(
        &self,
        _ctx: &Context,
        msg: &Message,
        _handle: &DeliveryHandle,
    ) -> Result<(), HandlerError> {
        self.ids.lock().unwrap().push(msg.id().to_owned());
        self.outcome.clone()
    }
}

struct Harness {
    broker: InMemoryBroker,
    manager: Arc<ConnectionManager>,
    topology: Topology,
}

impl Harness {
    async fn start() -> Harness {
        Harness::with_topology(Topology::new("t", "tq", "tutorial")).await
    }

    async fn with_topology(topology: Topology) -> Harness {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.connector()),
            BackoffPolicy {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
                multiplier: 2,
                max_attempts: 5,
            },
        );
        manager.connect().await.unwrap();

        AmqpTopologyDeclarer::new(manager.clone())
            .declare(&topology)
            .await
            .unwrap();

        Harness {
            broker,
            manager,
            topology,
        }
    }

    fn publisher(&self, outage: OutagePolicy) -> Arc<RabbitMQPublisher> {
        RabbitMQPublisher::new(
            self.manager.clone(),
            PublisherConfigs {
                outage,
                ..PublisherConfigs::default()
            },
        )
    }

    fn dispatcher(&self, concurrency: usize) -> RabbitMQDispatcher {
        RabbitMQDispatcher::new(
            self.manager.clone(),
            ConsumerConfigs {
                concurrency,
                max_requeue: 3,
            },
        )
    }

    async fn reconnected(&self, generation: u64) {
        let mut events = self.manager.events();
        if self.manager.generation() >= generation {
            return;
        }
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Connected { generation: g } if g >= generation => return,
                ConnectionEvent::Failed { attempts } => panic!("gave up after {}", attempts),
                _ => {}
            }
        }
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn published_message_is_received_exactly_once() {
    let h = Harness::start().await;
    let recorder = Recorder::new(Ok(()));
    let subscription = h.dispatcher(4).subscribe("tq", recorder.clone()).await.unwrap();

    let msg = Message::new("tutorial", "hello").with_id("abc-1");
    let res = h.publisher(OutagePolicy::FailFast).publish(&msg, &h.topology).await;
    assert_eq!(res, Ok(PublishResult::Confirmed));

    eventually("the delivery", || recorder.ids().len() == 1).await;
    eventually("the ack", || h.broker.unacked_count("tq") == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.ids(), vec!["abc-1".to_owned()]);
    assert_eq!(h.broker.queue_depth("tq"), 0);
    assert_eq!(h.broker.queue_depth("tq.dlq"), 0);

    subscription.cancel().await.unwrap();
}

#[tokio::test]
async fn fatal_failure_ends_in_dead_letter_queue() {
    let h = Harness::start().await;
    let recorder = Recorder::new(Err(HandlerError::Fatal("cannot process".to_owned())));
    let subscription = h.dispatcher(2).subscribe("tq", recorder.clone()).await.unwrap();

    let msg = Message::new("tutorial", "poison").with_id("abc-2");
    h.publisher(OutagePolicy::FailFast)
        .publish(&msg, &h.topology)
        .await
        .unwrap();

    eventually("the dead letter", || h.broker.queue_depth("tq.dlq") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.ids(), vec!["abc-2".to_owned()]);
    assert_eq!(h.broker.queue_depth("tq"), 0);
    assert_eq!(h.broker.unacked_count("tq"), 0);

    let dead = h.broker.messages("tq.dlq");
    assert_eq!(dead[0].id(), "abc-2");
    assert_eq!(dead[0].routing_key(), "deadLetter");
    assert_eq!(dead[0].attribute(AMQP_HEADERS_FIRST_DEATH_REASON), Some("rejected"));

    subscription.cancel().await.unwrap();
}

#[tokio::test]
async fn retryable_failure_is_dead_lettered_after_max_requeue() {
    let h = Harness::start().await;
    let recorder = Recorder::new(Err(HandlerError::Retryable("try later".to_owned())));
    let subscription = h.dispatcher(1).subscribe("tq", recorder.clone()).await.unwrap();

    h.publisher(OutagePolicy::FailFast)
        .publish(&Message::new("tutorial", "flaky").with_id("abc-3"), &h.topology)
        .await
        .unwrap();

    eventually("the dead letter", || h.broker.queue_depth("tq.dlq") == 1).await;
    subscription.cancel().await.unwrap();

    assert_eq!(recorder.ids().len(), 4);
    assert_eq!(h.broker.queue_depth("tq"), 0);
}

#[tokio::test]
async fn retryable_failure_on_a_classic_queue_is_dead_lettered_after_max_requeue() {
    let h = Harness::with_topology(Topology::new("t", "tq", "tutorial").quorum(false)).await;
    let recorder = Recorder::new(Err(HandlerError::Retryable("try later".to_owned())));
    let subscription = h.dispatcher(1).subscribe("tq", recorder.clone()).await.unwrap();

    h.publisher(OutagePolicy::FailFast)
        .publish(&Message::new("tutorial", "flaky").with_id("abc-4"), &h.topology)
        .await
        .unwrap();

    eventually("the dead letter", || h.broker.queue_depth("tq.dlq") == 1).await;
    subscription.cancel().await.unwrap();

    assert_eq!(recorder.ids(), vec!["abc-4".to_owned(); 4]);
    assert_eq!(h.broker.queue_depth("tq"), 0);
    assert_eq!(h.broker.messages("tq.dlq")[0].id(), "abc-4");
}

#[tokio::test]
async fn internal_dead_letter_exchange_still_takes_rejected_messages() {
    let topology = Topology::new("t", "tq", "tutorial").internal_dead_letter_exchange(true);
    let h = Harness::with_topology(topology).await;
    let publisher = h.publisher(OutagePolicy::FailFast);

    let direct = Topology::new("t.dlx", "tq.dlq", "deadLetter");
    let res = publisher
        .publish(&Message::new("deadLetter", "forged"), &direct)
        .await;
    assert!(matches!(res, Err(AmqpError::PublishingError(_))));

    let recorder = Recorder::new(Err(HandlerError::Fatal("cannot process".to_owned())));
    let subscription = h.dispatcher(1).subscribe("tq", recorder.clone()).await.unwrap();
    publisher
        .publish(&Message::new("tutorial", "poison"), &h.topology)
        .await
        .unwrap();

    eventually("the dead letter", || h.broker.queue_depth("tq.dlq") == 1).await;
    subscription.cancel().await.unwrap();
}

#[tokio::test]
async fn declaring_twice_is_a_no_op_and_conflicts_are_refused() {
    let h = Harness::start().await;
    let declarer = AmqpTopologyDeclarer::new(h.manager.clone());

    declarer.declare(&h.topology).await.unwrap();
    assert_eq!(h.broker.exchange_count(), 2);
    assert_eq!(h.broker.queue_count(), 2);
    assert_eq!(h.broker.binding_count(), 2);

    let conflicting = Topology::new("t", "tq", "tutorial").max_length(10);
    assert_eq!(
        declarer.declare(&conflicting).await,
        Err(AmqpError::TopologyConflictError("tq".to_owned()))
    );
    assert_eq!(h.broker.queue_count(), 2);
}

struct DoubleAck {
    second: Mutex<Option<Result<(), AmqpError>>>,
}

#[async_trait]
impl ConsumerHandler for DoubleAck {
    async fn exec(
        &self,
        _ctx: &Context,
        _msg: &Message,
        handle: &DeliveryHandle,
    ) -> Result<(), HandlerError> {
        handle
            .ack()
            .await
            .map_err(|err| HandlerError::Fatal(err.to_string()))?;
        *self.second.lock().unwrap() = Some(handle.ack().await);
        Ok(())
    }
}

#[tokio::test]
async fn second_acknowledgment_fails() {
    let h = Harness::start().await;
    let handler = Arc::new(DoubleAck {
        second: Mutex::new(None),
    });
    let subscription = h.dispatcher(1).subscribe("tq", handler.clone()).await.unwrap();

    h.publisher(OutagePolicy::FailFast)
        .publish(&Message::new("tutorial", "once"), &h.topology)
        .await
        .unwrap();

    eventually("the handler", || handler.second.lock().unwrap().is_some()).await;
    subscription.cancel().await.unwrap();

    assert_eq!(
        handler.second.lock().unwrap().clone(),
        Some(Err(AmqpError::DeliveryAlreadySettled(
            DeliveryState::Acknowledged
        )))
    );
    assert_eq!(h.broker.queue_depth("tq"), 0);
    assert_eq!(h.broker.queue_depth("tq.dlq"), 0);
}

#[tokio::test]
async fn reconnects_and_keeps_confirmed_messages() {
    let h = Harness::start().await;
    let recorder = Recorder::new(Ok(()));
    let publisher = h.publisher(OutagePolicy::Wait);

    let before = TutorialRecord::new("before the outage");
    publisher
        .publish(&before.into_message("tutorial").unwrap(), &h.topology)
        .await
        .unwrap();

    let subscription = h.dispatcher(2).subscribe("tq", recorder.clone()).await.unwrap();
    eventually("the first delivery", || recorder.ids().len() == 1).await;

    h.broker.refuse_connections(2);
    h.broker.drop_connections();
    h.reconnected(2).await;

    let after = TutorialRecord::new("after the outage");
    let res = publisher
        .publish(&after.into_message("tutorial").unwrap(), &h.topology)
        .await;
    assert_eq!(res, Ok(PublishResult::Confirmed));

    eventually("the second delivery", || {
        recorder.ids().contains(&after.id.to_string())
    })
    .await;
    assert!(recorder.ids().contains(&before.id.to_string()));

    subscription.cancel().await.unwrap();
    assert_eq!(h.broker.queue_depth("tq"), 0);
}

#[tokio::test]
async fn outage_policy_fail_fast_and_wait() {
    let h = Harness::start().await;
    let mut events = h.manager.events();

    h.broker.refuse_connections(1);
    h.broker.drop_connections();
    loop {
        if events.recv().await.unwrap() == ConnectionEvent::Disconnected {
            break;
        }
    }

    let msg = Message::new("tutorial", "during the outage");
    let fail_fast = h
        .publisher(OutagePolicy::FailFast)
        .publish(&msg, &h.topology)
        .await;
    assert!(matches!(fail_fast, Err(AmqpError::ConnectionError(_))));

    let waited = h
        .publisher(OutagePolicy::Wait)
        .publish(&msg, &h.topology)
        .await;
    assert_eq!(waited, Ok(PublishResult::Confirmed));
    assert_eq!(h.broker.queue_depth("tq"), 1);
}

#[tokio::test]
async fn wait_policy_publishes_right_after_a_connection_drop() {
    let h = Harness::start().await;
    let publisher = h.publisher(OutagePolicy::Wait);
    publisher
        .publish(&Message::new("tutorial", "before"), &h.topology)
        .await
        .unwrap();

    // the supervisor has not noticed yet, the manager still reports the old connection
    h.broker.drop_connections();

    let res = publisher
        .publish(&Message::new("tutorial", "after"), &h.topology)
        .await;
    assert_eq!(res, Ok(PublishResult::Confirmed));
    assert_eq!(h.manager.generation(), 2);
    assert_eq!(h.broker.queue_depth("tq"), 2);
}

#[tokio::test(start_paused = true)]
async fn join_reports_the_fatal_connection_error() {
    let h = Harness::start().await;
    let subscription = h
        .dispatcher(2)
        .subscribe("tq", Recorder::new(Ok(())))
        .await
        .unwrap();

    h.broker.refuse_connections(u32::MAX);
    h.broker.drop_connections();

    assert_eq!(
        subscription.join().await,
        Err(AmqpError::FatalConnectionError(5))
    );
}

/// Tracks how many handler calls overlap.
#[derive(Default)]
struct Parallel {
    running: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl ConsumerHandler for Parallel {
    async fn exec(
        &self,
        _ctx: &Context,
        _msg: &Message,
        _handle: &DeliveryHandle,
    ) -> Result<(), HandlerError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn handlers_never_exceed_the_concurrency() {
    let h = Harness::start().await;
    for i in 0..20 {
        h.broker
            .inject("t", Message::new("tutorial", format!("job {}", i)))
            .unwrap();
    }

    let handler = Arc::new(Parallel::default());
    let subscription = h.dispatcher(3).subscribe("tq", handler.clone()).await.unwrap();

    eventually("every handler", || handler.done.load(Ordering::SeqCst) == 20).await;
    subscription.cancel().await.unwrap();

    assert_eq!(handler.peak.load(Ordering::SeqCst), 3);
    assert_eq!(h.broker.queue_depth("tq"), 0);
    assert_eq!(h.broker.unacked_count("tq"), 0);
}

/// Blocks until released, so tests can cancel while it runs.
struct Slow {
    started: AtomicBool,
    finished: AtomicBool,
}

#[async_trait]
impl ConsumerHandler for Slow {
    async fn exec(
        &self,
        _ctx: &Context,
        _msg: &Message,
        _handle: &DeliveryHandle,
    ) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn cancel_waits_for_in_flight_handlers() {
    let h = Harness::start().await;
    let handler = Arc::new(Slow {
        started: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });
    let subscription = h.dispatcher(1).subscribe("tq", handler.clone()).await.unwrap();

    for i in 0..3 {
        h.broker
            .inject("t", Message::new("tutorial", format!("slow {}", i)))
            .unwrap();
    }

    eventually("the handler to start", || handler.started.load(Ordering::SeqCst)).await;
    subscription.cancel().await.unwrap();

    assert!(handler.finished.load(Ordering::SeqCst));
    // the in-flight message was acked, the buffered ones went back to the queue
    assert_eq!(h.broker.unacked_count("tq"), 0);
    assert_eq!(h.broker.queue_depth("tq"), 2);
    assert_eq!(h.broker.queue_depth("tq.dlq"), 0);
}
