// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module processes one delivery: it runs the middleware-wrapped
//! handler and settles the delivery according to the acknowledgment policy.
//!
//! A handler outcome of `true` acknowledges the delivery. `false` rejects it
//! with the queue's requeue flag; without requeue the broker dead-letters
//! the message when the queue has a dead letter target. Ack and reject
//! transport failures are only logged: the broker still holds the message
//! and redelivers it once the channel goes away.

use crate::{
    broker::{Acker, Delivery},
    errors::AmqpError,
    handler::ConsumerHandler,
};
use tracing::{debug, error};

/// How a delivery is settled once its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject { requeue: bool },
}

impl AckDecision {
    /// Maps a handler outcome to a decision, given the queue's requeue flag.
    pub fn from_outcome(success: bool, requeue: bool) -> AckDecision {
        if success {
            AckDecision::Ack
        } else {
            AckDecision::Reject { requeue }
        }
    }

    /// Issues the decision on the delivery's channel. No retry on failure.
    pub async fn apply(self, queue: &str, acker: &dyn Acker) -> Result<(), AmqpError> {
        let result = match self {
            AckDecision::Ack => acker.ack().await,
            AckDecision::Reject { requeue } => acker.reject(requeue).await,
        };

        if let Err(err) = &result {
            error!(error = %err, queue, decision = ?self, "failure to settle message");
        }

        result
    }
}

/// Runs the handler for one delivery and settles it.
pub(crate) async fn consume(
    queue: &str,
    requeue: bool,
    handler: &dyn ConsumerHandler,
    delivery: Delivery,
) -> AckDecision {
    let Delivery { message, acker } = delivery;

    let success = handler.exec(&message).await;
    let decision = AckDecision::from_outcome(success, requeue);
    if decision.apply(queue, acker.as_ref()).await.is_ok() {
        debug!(queue, delivery_tag = message.delivery_tag, decision = ?decision, "message settled");
    }

    decision
}
