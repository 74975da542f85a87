// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Middlewares
//!
//! A middleware wraps a handler into another handler with the same
//! signature. The chain applies middlewares outermost-first in registration
//! order: with `[logging, metrics]` a delivery goes
//! logging -> metrics -> handler -> metrics -> logging.

use crate::{
    handler::{ConsumerHandler, ConsumerMessage},
    otel::EventMetrics,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Instant};
use tracing::debug;

pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn ConsumerHandler>) -> Arc<dyn ConsumerHandler>;
}

/// Ordered list of middlewares applied to every bound handler.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> MiddlewareChain {
        MiddlewareChain::default()
    }

    /// Appends a middleware; earlier registrations end up outermost.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn apply(&self, handler: Arc<dyn ConsumerHandler>) -> Arc<dyn ConsumerHandler> {
        self.middlewares
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware.wrap(next))
    }
}

/// Logs a start and an end line per delivery with queue name and raw body.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

struct LoggingHandler {
    next: Arc<dyn ConsumerHandler>,
}

impl Middleware for LoggingMiddleware {
    fn wrap(&self, next: Arc<dyn ConsumerHandler>) -> Arc<dyn ConsumerHandler> {
        Arc::new(LoggingHandler { next })
    }
}

#[async_trait]
impl ConsumerHandler for LoggingHandler {
    async fn exec(&self, msg: &ConsumerMessage) -> bool {
        debug!(queue = %msg.queue, msg = %msg.body(), "start processing event");
        let result = self.next.exec(msg).await;
        debug!(queue = %msg.queue, msg = %msg.body(), result, "end processing event");
        result
    }
}

/// Counts received, processed and failed events and records the handler
/// duration, all per queue.
#[derive(Clone)]
pub struct MetricsMiddleware {
    metrics: Arc<dyn EventMetrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<dyn EventMetrics>) -> MetricsMiddleware {
        MetricsMiddleware { metrics }
    }
}

struct MetricsHandler {
    metrics: Arc<dyn EventMetrics>,
    next: Arc<dyn ConsumerHandler>,
}

impl Middleware for MetricsMiddleware {
    fn wrap(&self, next: Arc<dyn ConsumerHandler>) -> Arc<dyn ConsumerHandler> {
        Arc::new(MetricsHandler {
            metrics: self.metrics.clone(),
            next,
        })
    }
}

#[async_trait]
impl ConsumerHandler for MetricsHandler {
    async fn exec(&self, msg: &ConsumerMessage) -> bool {
        let start = Instant::now();
        self.metrics.event_received(&msg.queue);

        let result = self.next.exec(msg).await;
        if result {
            self.metrics.event_processed(&msg.queue);
        } else {
            self.metrics.event_failed(&msg.queue);
        }
        self.metrics.processing_time(&msg.queue, start.elapsed());

        result
    }
}
