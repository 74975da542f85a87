// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler turns one inbound message into a boolean outcome: `true` means
//! the message was processed and can be acknowledged, `false` means it must
//! be rejected according to the queue's requeue policy.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::warn;

/// An inbound message as seen by handlers and middlewares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    /// Queue the message was consumed from
    pub queue: String,
    /// Broker assigned delivery tag, unique per channel
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key used at publish time
    pub routing_key: String,
    /// Set by the broker when this is not the first delivery attempt
    pub redelivered: bool,
    /// The AMQP `type` property, if any
    pub msg_type: Option<String>,
    /// Raw body
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub fn new(queue: &str, data: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    /// Body rendered for log lines.
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Business logic bound to a queue.
///
/// Failures, including malformed payloads, are reported by returning
/// `false`; they never escape as errors.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, msg: &ConsumerMessage) -> bool;
}

/// Handler backed by an async closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn exec(&self, msg: &ConsumerMessage) -> bool {
        (self.f)(msg.clone()).await
    }
}

/// Wraps an async closure into a shareable handler.
///
/// # Example
/// ```
/// use rmq_consumer::handler::handler_fn;
///
/// let handler = handler_fn(|msg| async move { !msg.data.is_empty() });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Turns a panic inside the wrapped handler into a `false` outcome.
///
/// Applied directly around the bound handler, below every middleware, so a
/// panic is seen by the middlewares as an ordinary failure.
pub(crate) struct PanicGuard {
    inner: Arc<dyn ConsumerHandler>,
}

impl PanicGuard {
    pub(crate) fn wrap(inner: Arc<dyn ConsumerHandler>) -> Arc<dyn ConsumerHandler> {
        Arc::new(PanicGuard { inner })
    }
}

#[async_trait]
impl ConsumerHandler for PanicGuard {
    async fn exec(&self, msg: &ConsumerMessage) -> bool {
        match AssertUnwindSafe(self.inner.exec(msg)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                warn!(queue = %msg.queue, delivery_tag = msg.delivery_tag, "handler panicked");
                false
            }
        }
    }
}
