// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The supervisor and the dispatcher talk to the broker only through the
//! traits in this module. [`crate::channel`] implements them on top of lapin.
//!
//! A [`BrokerSession`] is one connection plus one channel. It is owned by a
//! single task: declarations run sequentially on it before any worker
//! starts, workers only ever see the [`DeliveryStream`]s it handed out.

use crate::{
    errors::AmqpError, exchange::ExchangeDefinition, handler::ConsumerMessage,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;

/// Stream of deliveries for one consumer. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Capability to settle one delivery on the channel it arrived on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    /// Removes the message from the queue for good.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the message; with `requeue` the broker redelivers it,
    /// otherwise it is dead-lettered or dropped per queue arguments.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// An inbound message together with the capability to settle it.
pub struct Delivery {
    pub message: ConsumerMessage,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: ConsumerMessage, acker: Box<dyn Acker>) -> Delivery {
        Delivery { message, acker }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Dials the broker. Every call yields a brand new session.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, AmqpError>;
}

/// One connection and one channel multiplexed on it.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Per-consumer prefetch limit for the consumers started afterwards.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    /// Resolves once the broker reports the connection or channel closed.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}
