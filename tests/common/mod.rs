// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker for the integration tests.
//!
//! Models the parts of RabbitMQ the consumer relies on: per-consumer
//! prefetch withholding, ack and reject with or without requeue,
//! dead-lettering through the default exchange, per-queue message TTL and
//! the loss of a session, which requeues its unacknowledged deliveries.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::{AMQPValue, ShortString};
use rmq_consumer::{
    broker::{Acker, BrokerConnector, BrokerSession, Delivery, DeliveryStream},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::{handler_fn, ConsumerHandler, ConsumerMessage},
    queue::{
        QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MESSAGE_TTL,
    },
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A broker call as seen by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    DeclareQueue(String),
    DeclareExchange(String),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Qos(u16),
    Consume(String),
}

/// A message entering a queue, by publish or by dead-lettering.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub queue: String,
    pub body: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    ttl: Option<Duration>,
    messages: VecDeque<Message>,
    max_outstanding: usize,
}

struct ConsumerSlot {
    tag: String,
    session: u64,
    queue: String,
    prefetch: usize,
    outstanding: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct Unacked {
    session: u64,
    consumer: String,
    queue: String,
    message: Message,
}

struct SessionState {
    alive: bool,
    closed: CancellationToken,
    ops: Vec<Op>,
    prefetch: u16,
}

#[derive(Default)]
struct State {
    dial_failures: usize,
    dials: usize,
    failing_queue: Option<String>,
    sessions: Vec<SessionState>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, QueueState>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_message: u64,
    arrivals: Vec<Arrival>,
    acked: Vec<Vec<u8>>,
}

impl State {
    fn session(&mut self, id: u64) -> &mut SessionState {
        &mut self.sessions[(id - 1) as usize]
    }

    fn is_alive(&self, id: u64) -> bool {
        self.sessions[(id - 1) as usize].alive
    }

    fn outstanding(&self, queue: &str) -> usize {
        self.consumers
            .iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.outstanding)
            .sum()
    }

    fn release(&mut self, consumer: &str) {
        if let Some(slot) = self.consumers.iter_mut().find(|c| c.tag == consumer) {
            slot.outstanding -= 1;
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The next `count` dials are refused.
    pub fn fail_dials(&self, count: usize) {
        self.lock().dial_failures = count;
    }

    /// Declaring this queue is refused as a precondition failure.
    pub fn fail_declare(&self, queue: &str) {
        self.lock().failing_queue = Some(queue.to_owned());
    }

    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    pub fn sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Calls made on the `n`th session, starting at 1.
    pub fn ops(&self, session: usize) -> Vec<Op> {
        self.lock().sessions[session - 1].ops.clone()
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Highest number of unacknowledged deliveries seen at once.
    pub fn max_outstanding(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.max_outstanding)
            .unwrap_or_default()
    }

    pub fn arrivals(&self, queue: &str) -> Vec<Arrival> {
        self.lock()
            .arrivals
            .iter()
            .filter(|a| a.queue == queue)
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    pub fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) {
        let mut st = self.lock();
        for queue in route(&st, exchange, routing_key) {
            let message = new_message(&mut st, exchange, routing_key, body.to_vec());
            self.enqueue(&mut st, &queue, message);
        }
    }

    /// Drops every open session as if the broker connection was lost.
    pub fn kill_sessions(&self) {
        let mut st = self.lock();
        let alive: Vec<u64> = (1..=st.sessions.len() as u64)
            .filter(|id| st.is_alive(*id))
            .collect();

        for id in alive {
            self.drop_session(&mut st, id);
        }
    }

    fn enqueue(&self, st: &mut State, queue: &str, message: Message) {
        let at = Instant::now();
        let Some(state) = st.queues.get_mut(queue) else {
            return;
        };

        if let Some(ttl) = state.ttl {
            let broker = self.clone();
            let (queue, id) = (queue.to_owned(), message.id);
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue, id);
            });
        }

        state.messages.push_back(message.clone());
        st.arrivals.push(Arrival {
            queue: queue.to_owned(),
            body: message.body,
            at,
        });
        self.pump(st, queue);
    }

    fn requeue(&self, st: &mut State, queue: &str, mut message: Message) {
        message.redelivered = true;
        if let Some(state) = st.queues.get_mut(queue) {
            state.messages.push_front(message);
        }
        self.pump(st, queue);
    }

    fn dead_letter(&self, st: &mut State, queue: &str, message: Message) {
        let Some(state) = st.queues.get(queue) else {
            return;
        };
        let Some(exchange) = state.dead_letter_exchange.clone() else {
            return;
        };
        let routing_key = state
            .dead_letter_routing_key
            .clone()
            .unwrap_or(message.routing_key);

        for target in route(st, &exchange, &routing_key) {
            let message = new_message(st, &exchange, &routing_key, message.body.clone());
            self.enqueue(st, &target, message);
        }
    }

    fn expire(&self, queue: &str, id: u64) {
        let mut st = self.lock();
        let Some(state) = st.queues.get_mut(queue) else {
            return;
        };

        if let Some(pos) = state.messages.iter().position(|m| m.id == id) {
            if let Some(message) = state.messages.remove(pos) {
                self.dead_letter(&mut st, queue, message);
            }
        }
    }

    /// Hands ready messages to consumers with free prefetch capacity.
    fn pump(&self, st: &mut State, queue: &str) {
        loop {
            let ready = st
                .queues
                .get(queue)
                .map(|q| !q.messages.is_empty())
                .unwrap_or_default();
            if !ready {
                return;
            }

            let Some(slot) = st
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, c)| c.queue == queue && c.outstanding < c.prefetch)
                .min_by_key(|(_, c)| c.outstanding)
                .map(|(i, _)| i)
            else {
                return;
            };

            let Some(message) = st.queues.get_mut(queue).and_then(|q| q.messages.pop_front())
            else {
                return;
            };

            st.next_tag += 1;
            let tag = st.next_tag;
            let consumer = &mut st.consumers[slot];
            let delivery = Delivery::new(
                ConsumerMessage {
                    queue: queue.to_owned(),
                    delivery_tag: tag,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    msg_type: None,
                    data: message.body.clone(),
                },
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    session: consumer.session,
                    tag,
                }),
            );

            if consumer.sender.send(Ok(delivery)).is_err() {
                st.consumers.remove(slot);
                if let Some(state) = st.queues.get_mut(queue) {
                    state.messages.push_front(message);
                }
                continue;
            }

            consumer.outstanding += 1;
            let unacked = Unacked {
                session: consumer.session,
                consumer: consumer.tag.clone(),
                queue: queue.to_owned(),
                message,
            };
            st.unacked.insert(tag, unacked);

            let outstanding = st.outstanding(queue);
            if let Some(state) = st.queues.get_mut(queue) {
                state.max_outstanding = state.max_outstanding.max(outstanding);
            }
        }
    }

    /// Channel close semantics: consumers are cancelled and whatever they
    /// still hold goes back to its queue.
    fn drop_session(&self, st: &mut State, id: u64) {
        let session = st.session(id);
        if !session.alive {
            return;
        }
        session.alive = false;
        session.closed.cancel();

        st.consumers.retain(|c| c.session != id);

        let tags: Vec<u64> = st
            .unacked
            .iter()
            .filter(|(_, u)| u.session == id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = st.unacked.remove(&tag) {
                self.requeue(st, &unacked.queue, unacked.message);
            }
        }
    }

    fn settle(&self, session: u64, tag: u64) -> Result<(MutexGuard<'_, State>, Unacked), ()> {
        let mut st = self.lock();
        if !st.is_alive(session) {
            return Err(());
        }
        let unacked = st.unacked.remove(&tag).ok_or(())?;
        st.release(&unacked.consumer);
        Ok((st, unacked))
    }
}

fn new_message(st: &mut State, exchange: &str, routing_key: &str, body: Vec<u8>) -> Message {
    st.next_message += 1;
    Message {
        id: st.next_message,
        body,
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
        redelivered: false,
    }
}

fn route(st: &State, exchange: &str, routing_key: &str) -> Vec<String> {
    if exchange.is_empty() {
        return st
            .queues
            .contains_key(routing_key)
            .then(|| vec![routing_key.to_owned()])
            .unwrap_or_default();
    }

    let fanout = matches!(st.exchanges.get(exchange), Some(ExchangeKind::Fanout));
    st.bindings
        .iter()
        .filter(|(e, _, key)| e == exchange && (fanout || key == routing_key))
        .map(|(_, queue, _)| queue.clone())
        .collect()
}

fn long_string(def: &QueueDefinition, key: &str) -> Option<String> {
    match def.arguments().get(&ShortString::from(key)) {
        Some(AMQPValue::LongString(v)) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        _ => None,
    }
}

fn ttl(def: &QueueDefinition) -> Option<Duration> {
    match def.arguments().get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)) {
        Some(AMQPValue::LongInt(v)) => u64::try_from(*v).ok().map(Duration::from_millis),
        _ => None,
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, AmqpError> {
        let mut st = self.lock();
        st.dials += 1;

        if st.dial_failures > 0 {
            st.dial_failures -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let closed = CancellationToken::new();
        st.sessions.push(SessionState {
            alive: true,
            closed: closed.clone(),
            ops: vec![],
            prefetch: 0,
        });

        Ok(Box::new(MemorySession {
            broker: self.clone(),
            id: st.sessions.len() as u64,
            closed,
        }))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    closed: CancellationToken,
}

impl MemorySession {
    fn record(&self, op: Op) -> Result<MutexGuard<'_, State>, AmqpError> {
        let mut st = self.broker.lock();
        if !st.is_alive(self.id) {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }
        st.session(self.id).ops.push(op);
        Ok(st)
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut st = self.record(Op::DeclareExchange(def.name().to_owned()))?;
        st.exchanges
            .insert(def.name().to_owned(), def.exchange_type().clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut st = self.record(Op::DeclareQueue(def.name().to_owned()))?;
        if st.failing_queue.as_deref() == Some(def.name()) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        let queue = st.queues.entry(def.name().to_owned()).or_default();
        queue.dead_letter_exchange = long_string(def, AMQP_HEADERS_DEAD_LETTER_EXCHANGE);
        queue.dead_letter_routing_key = long_string(def, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY);
        queue.ttl = ttl(def);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut st = self.record(Op::Bind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        })?;

        let binding = (exchange.to_owned(), queue.to_owned(), routing_key.to_owned());
        if !st.bindings.contains(&binding) {
            st.bindings.push(binding);
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut st = self.record(Op::Qos(prefetch_count))?;
        st.session(self.id).prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut st = self.record(Op::Consume(queue.to_owned()))?;
        if !st.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let prefetch = match st.session(self.id).prefetch {
            0 => usize::MAX,
            n => n as usize,
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        st.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            session: self.id,
            queue: queue.to_owned(),
            prefetch,
            outstanding: 0,
            sender,
        });
        self.broker.pump(&mut st, queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        self.broker.drop_session(&mut st, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    session: u64,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let (mut st, unacked) = self
            .broker
            .settle(self.session, self.tag)
            .map_err(|_| AmqpError::AckMessageError)?;

        st.acked.push(unacked.message.body);
        self.broker.pump(&mut st, &unacked.queue);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let (mut st, unacked) = self
            .broker
            .settle(self.session, self.tag)
            .map_err(|_| AmqpError::RejectMessageError)?;

        if requeue {
            self.broker.requeue(&mut st, &unacked.queue, unacked.message);
        } else {
            self.broker.dead_letter(&mut st, &unacked.queue, unacked.message);
            self.broker.pump(&mut st, &unacked.queue);
        }
        Ok(())
    }
}

/// Reconnects quickly so the tests do not wait on the production backoff.
pub fn configs() -> RabbitMQConfigs {
    RabbitMQConfigs {
        reconnect_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Handler returning `result` and keeping every message it saw.
pub fn recording_handler(result: bool) -> (Arc<dyn ConsumerHandler>, Arc<Mutex<Vec<ConsumerMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    let handler = handler_fn(move |msg| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(msg);
            result
        }
    });

    (handler, seen)
}

/// Polls `cond` until it holds, failing the test after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
