// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the integration tests.
//!
//! Models the parts of RabbitMQ the connector depends on: queue and exchange
//! declaration with argument equivalence checks, direct bindings, prefetch,
//! manual ack/reject, requeue with the redelivered flag, dead-lettering with
//! `x-death` bookkeeping, quorum `x-delivery-count`/`x-delivery-limit`, mandatory
//! publishing, plus scripted connection drops and refused connects.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use rabbitmq_connector::{
    channel::{BrokerChannel, Delivery, DeliveryStream, PublishConfirm, QueueFlags, QueueState, Transport},
    errors::AmqpError,
    guard::MemoryProbe,
    ConnectorConfig, MessageHandler, RabbitMQConnector,
};
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub redelivered: bool,
}

#[derive(Debug)]
struct FakeQueue {
    flags: QueueFlags,
    arguments: FieldTable,
    ready: VecDeque<StoredMessage>,
}

struct FakeConsumer {
    generation: u64,
    queue: String,
    tag: String,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
pub struct BrokerState {
    queues: HashMap<String, FakeQueue>,
    exchanges: HashMap<String, bool>,
    pub bindings: Vec<(String, String, String)>,
    generation: u64,
    alive: bool,
    refuse_connects: usize,
    consumer: Option<FakeConsumer>,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
    pub connects: usize,
    pub confirm_selects: usize,
    pub acks: Vec<u64>,
    pub rejects: Vec<(u64, bool)>,
    pub cancels: Vec<String>,
    pub dropped: Vec<StoredMessage>,
    pub max_unacked: usize,
}

impl BrokerState {
    fn check_live(&self, generation: u64) -> Result<(), AmqpError> {
        if self.alive && self.generation == generation {
            Ok(())
        } else {
            Err(AmqpError::ConnectionError("connection closed".to_owned()))
        }
    }

    /// Hands the next ready message to the consumer while prefetch allows.
    fn pump(&mut self) {
        let Some(consumer) = &self.consumer else {
            return;
        };

        if !self.alive || consumer.generation != self.generation {
            return;
        }

        while self.unacked.len() < usize::from(self.prefetch.max(1)) {
            let Some(message) = self
                .queues
                .get_mut(&consumer.queue)
                .and_then(|queue| queue.ready.pop_front())
            else {
                return;
            };

            let tag = self.next_tag;
            self.next_tag += 1;

            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
                headers: FieldTable::from(message.headers.clone()),
                reply_to: None,
                correlation_id: None,
            };

            self.unacked.insert(tag, (consumer.queue.clone(), message));
            self.max_unacked = self.max_unacked.max(self.unacked.len());
            let _ = consumer.tx.send(Ok(delivery));
        }
    }

    /// Puts every unacknowledged message back at the head of its queue.
    fn requeue_unacked(&mut self) {
        let mut pending: Vec<_> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        for (_, (queue, mut message)) in pending {
            message.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.ready.push_front(message);
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.arguments.inner().get("x-dead-letter-exchange").cloned());

        let Some(AMQPValue::LongString(dlx)) = dlx else {
            self.dropped.push(message);
            return;
        };
        let dlx = String::from_utf8_lossy(dlx.as_bytes()).into_owned();

        let previous = message
            .headers
            .get("x-death")
            .and_then(AMQPValue::as_array)
            .and_then(|deaths| deaths.as_slice().first())
            .and_then(AMQPValue::as_field_table)
            .and_then(|death| death.inner().get("count"))
            .and_then(long_long)
            .unwrap_or(0);

        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from("count"),
            AMQPValue::LongLongInt(LongLongInt::from(previous + 1)),
        );
        death.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("rejected")),
        );
        death.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(queue)),
        );
        message.headers.insert(
            ShortString::from("x-death"),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );
        message.headers.remove("x-delivery-count");
        message.redelivered = false;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(exchange, _, key)| *exchange == dlx && key == queue)
            .map(|(_, target, _)| target.clone())
            .collect();

        if targets.is_empty() {
            self.dropped.push(message);
            return;
        }

        for target in targets {
            if let Some(target) = self.queues.get_mut(&target) {
                target.ready.push_back(message.clone());
            }
        }
    }

    fn delivery_limit(&self, queue: &str) -> Option<i64> {
        let queue = self.queues.get(queue)?;
        match queue.arguments.inner().get("x-delivery-limit")? {
            AMQPValue::LongLongInt(limit) => Some(*limit),
            _ => None,
        }
    }
}

fn long_long(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Shared handle on the fake broker. Cloning shares the state.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// The next `n` connection attempts are refused.
    pub fn refuse_connects(&self, n: usize) {
        self.state().refuse_connects = n;
    }

    /// Simulates a dropped TCP connection.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.alive = false;
        if let Some(consumer) = state.consumer.take() {
            let _ = consumer
                .tx
                .send(Err(AmqpError::ConnectionError("connection reset by peer".to_owned())));
        }
        state.requeue_unacked();
    }

    /// Simulates the broker closing the channel after a protocol violation.
    pub fn fail_channel(&self, reason: &str) {
        self.fail_consumer(AmqpError::ChannelError(reason.to_owned()));
    }

    /// Ends the delivery stream of the current consumer with `err`.
    pub fn fail_consumer(&self, err: AmqpError) {
        let mut state = self.state();
        if let Some(consumer) = &state.consumer {
            let _ = consumer.tx.send(Err(err));
        }
        state.requeue_unacked();
    }

    /// Declares a queue as another client would.
    pub fn declare_queue(&self, name: &str, arguments: FieldTable) {
        self.state().queues.insert(
            name.to_owned(),
            FakeQueue {
                flags: QueueFlags {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                },
                arguments,
                ready: VecDeque::new(),
            },
        );
    }

    pub fn delete_queue(&self, name: &str) {
        self.state().queues.remove(name);
    }

    /// Enqueues a raw body as another producer would.
    pub fn enqueue(&self, queue: &str, body: &[u8]) {
        let mut state = self.state();
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(StoredMessage {
                body: body.to_vec(),
                headers: BTreeMap::new(),
                redelivered: false,
            });
        }
        state.pump();
    }

    pub fn ready(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state().exchanges.contains_key(exchange)
    }

    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state().alive
    }

    pub fn has_consumer(&self) -> bool {
        let state = self.state();
        state
            .consumer
            .as_ref()
            .is_some_and(|consumer| consumer.generation == state.generation && state.alive)
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.state();

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.generation += 1;
        state.alive = true;
        state.next_tag = 1;
        state.prefetch = 0;
        state.consumer = None;
        state.connects += 1;

        Ok(Arc::new(FakeChannel {
            broker: self.clone(),
            generation: state.generation,
        }))
    }
}

pub struct FakeChannel {
    broker: FakeBroker,
    generation: u64,
}

impl FakeChannel {
    fn live(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.state();
        state.check_live(self.generation)?;
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.live()?.confirm_selects += 1;
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: FieldTable,
    ) -> Result<QueueState, AmqpError> {
        let mut state = self.live()?;

        if let Some(existing) = state.queues.get(name) {
            if existing.flags != flags || existing.arguments != arguments {
                return Err(AmqpError::ChannelError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{name}'"
                )));
            }
        } else {
            state.queues.insert(
                name.to_owned(),
                FakeQueue {
                    flags,
                    arguments,
                    ready: VecDeque::new(),
                },
            );
        }

        let consumer_count = u32::from(
            state
                .consumer
                .as_ref()
                .is_some_and(|consumer| consumer.queue == name),
        );
        let message_count = state.queues.get(name).map_or(0, |q| q.ready.len()) as u32;

        Ok(QueueState {
            message_count,
            consumer_count,
        })
    }

    async fn exchange_declare(&self, name: &str, durable: bool) -> Result<(), AmqpError> {
        let mut state = self.live()?;

        match state.exchanges.get(name) {
            Some(existing) if *existing != durable => Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), durable);
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        let binding = (exchange.to_owned(), queue.to_owned(), routing_key.to_owned());

        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.live()?.prefetch = prefetch_count;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.live()?;

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ChannelError(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumer = Some(FakeConsumer {
            generation: self.generation,
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
            tx,
        });
        state.pump();

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        state.cancels.push(consumer_tag.to_owned());
        if state
            .consumer
            .as_ref()
            .is_some_and(|consumer| consumer.tag == consumer_tag)
        {
            state.consumer = None;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm, AmqpError> {
        let mut state = self.live()?;
        assert_eq!(exchange, "", "the connector publishes through the default exchange");
        assert_eq!(properties.delivery_mode(), &Some(2));

        let headers = properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();

        let Some(queue) = state.queues.get_mut(routing_key) else {
            return Ok(PublishConfirm::Unroutable("312 NO_ROUTE".to_owned()));
        };

        queue.ready.push_back(StoredMessage {
            body: body.to_vec(),
            headers,
            redelivered: false,
        });
        state.pump();

        Ok(PublishConfirm::Ack)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.live()?;

        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }

        state.acks.push(delivery_tag);
        state.pump();
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.live()?;

        let Some((queue, mut message)) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        state.rejects.push((delivery_tag, requeue));

        if requeue {
            match state.delivery_limit(&queue) {
                Some(limit) => {
                    let count = message
                        .headers
                        .get("x-delivery-count")
                        .and_then(long_long)
                        .unwrap_or(0)
                        + 1;

                    if count > limit {
                        state.dead_letter(&queue, message);
                    } else {
                        message.headers.insert(
                            ShortString::from("x-delivery-count"),
                            AMQPValue::LongLongInt(count),
                        );
                        message.redelivered = true;
                        if let Some(q) = state.queues.get_mut(&queue) {
                            q.ready.push_front(message);
                        }
                    }
                }
                None => {
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_front(message);
                    }
                }
            }
        } else {
            state.dead_letter(&queue, message);
        }

        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        state.alive = false;
        state.consumer = None;
        state.requeue_unacked();
        Ok(())
    }
}

/// Memory probe reporting a fixed footprint.
pub struct FixedProbe(pub u64);

impl MemoryProbe for FixedProbe {
    fn resident_memory(&self) -> Result<u64, AmqpError> {
        Ok(self.0)
    }
}

/// Polls `condition` until it holds or five seconds elapsed.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub type Connector = RabbitMQConnector<FakeBroker>;

pub struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<(Connector, Result<(), AmqpError>)>,
}

impl Running {
    pub async fn stop(self) -> (Connector, Result<(), AmqpError>) {
        let Running { stop, task } = self;
        let _ = stop.send(());
        join(task).await
    }

    /// Waits for the consumer to stop on its own.
    pub async fn finish(self) -> (Connector, Result<(), AmqpError>) {
        let Running { stop, task } = self;
        let stopped = join(task).await;
        drop(stop);
        stopped
    }
}

async fn join(
    task: JoinHandle<(Connector, Result<(), AmqpError>)>,
) -> (Connector, Result<(), AmqpError>) {
    timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer did not stop")
        .expect("consumer task panicked")
}

pub fn connector(broker: &FakeBroker, config: ConnectorConfig) -> Connector {
    RabbitMQConnector::new(
        broker.clone(),
        config.reconnect_backoff(Duration::from_millis(20)),
    )
}

pub fn consume<M, H>(mut connector: Connector, handler: H, max_allowed_memory: Option<u64>) -> Running
where
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M>,
{
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stopped.await;
        };
        let result = connector
            .consume_until(handler, max_allowed_memory, shutdown)
            .await;
        (connector, result)
    });

    Running { stop, task }
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message handled in time")
        .expect("handler channel closed")
}
