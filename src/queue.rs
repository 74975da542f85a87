// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the queue definition registered in the topology.
//! A definition carries the broker side declaration (flags and `x-*`
//! arguments) together with the consumer side settings: prefetch count,
//! requeue-on-failure policy and the optional bound handler.
//!
//! Dead-lettering is expressed with plain broker arguments, see
//! [`delayed_retry`] for the delayed retry pair built on top of them.

use crate::handler::ConsumerHandler;
use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Default number of unacknowledged deliveries per consumer.
pub const DEFAULT_PREFETCH_COUNT: u16 = 2;

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern. Defaults: durable, not
/// auto-deleted, not exclusive, prefetch of [`DEFAULT_PREFETCH_COUNT`],
/// failed messages requeued, no handler.
#[derive(Clone)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) routing_key: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_wait: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
    pub(crate) prefetch_count: u16,
    pub(crate) requeue: bool,
    pub(crate) handler: Option<Arc<dyn ConsumerHandler>>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            routing_key: String::new(),
            durable: true,
            delete: false,
            exclusive: false,
            no_wait: false,
            args: BTreeMap::default(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            requeue: true,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn requeue_on_failure(&self) -> bool {
        self.requeue
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Broker arguments sent with the queue declaration.
    pub fn arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.args
    }

    /// Sets the key used when binding the queue to its exchange.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Declares the queue as transient, it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are deleted when the connection closes, so they are
    /// re-created from scratch on every reconnect.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets no_wait flag on the declaration.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    ///
    /// Expired messages are dead-lettered when a dead letter target is set,
    /// dropped otherwise.
    pub fn ttl(self, ttl: i32) -> Self {
        self.argument(
            AMQP_HEADERS_MESSAGE_TTL,
            AMQPValue::LongInt(LongInt::from(ttl)),
        )
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.argument(
            AMQP_HEADERS_MAX_LENGTH,
            AMQPValue::LongInt(LongInt::from(max)),
        )
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.argument(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Exchange receiving rejected or expired messages. The empty string is
    /// the default exchange, which routes by queue name.
    pub fn dead_letter_exchange(self, exchange: &str) -> Self {
        self.argument(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
    }

    /// Routing key used when a message is dead-lettered.
    pub fn dead_letter_routing_key(self, key: &str) -> Self {
        self.argument(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQPValue::LongString(LongString::from(key)),
        )
    }

    /// Adds a single broker argument to the declaration.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    /// Maximum number of unacknowledged deliveries, also the number of
    /// workers draining the queue. Zero would disable the broker side limit,
    /// so it is raised to one.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count.max(1);
        self
    }

    /// Whether a failed message goes straight back to the queue (`true`) or
    /// is dead-lettered / dropped by the broker (`false`).
    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }

    /// Binds a handler; only queues with a handler are consumed.
    pub fn handler(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("routing_key", &self.routing_key)
            .field("durable", &self.durable)
            .field("delete", &self.delete)
            .field("exclusive", &self.exclusive)
            .field("args", &self.args)
            .field("prefetch_count", &self.prefetch_count)
            .field("requeue", &self.requeue)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Builds a primary queue and its "failed" companion implementing delayed
/// retry through the broker only.
///
/// The primary rejects failures without requeue, so the broker dead-letters
/// them into `failed`. `failed` holds each message for `ttl` milliseconds
/// and then dead-letters it back to the primary queue. Both hops use the
/// default exchange. The returned `failed` queue has no handler.
pub fn delayed_retry(
    primary: QueueDefinition,
    failed: &str,
    ttl: i32,
) -> (QueueDefinition, QueueDefinition) {
    let failed_queue = QueueDefinition::new(failed)
        .dead_letter_exchange("")
        .dead_letter_routing_key(&primary.name)
        .ttl(ttl);

    let primary = primary
        .dead_letter_exchange("")
        .dead_letter_routing_key(failed)
        .requeue(false);

    (primary, failed_queue)
}
