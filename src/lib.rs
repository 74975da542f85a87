// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! Declares a registered topology, consumes every queue that has a handler
//! bound with a bounded number of workers, settles deliveries from the
//! handler outcome and keeps all of it running across broker reconnects.
//!
//! ```no_run
//! # async fn run() -> Result<(), rmq_consumer::errors::AmqpError> {
//! use rmq_consumer::{
//!     channel::LapinConnector, configs::RabbitMQConfigs, handler::handler_fn,
//!     middleware::{LoggingMiddleware, MiddlewareChain}, queue::QueueDefinition,
//!     supervisor::RabbitMQConsumer, topology::TopologyRegistry,
//! };
//! use std::sync::Arc;
//!
//! let cfg = RabbitMQConfigs::from_env();
//! let mut topology = TopologyRegistry::new();
//! topology.register_queue(
//!     QueueDefinition::new("orders").handler(handler_fn(|_| async { true })),
//! )?;
//!
//! let consumer = RabbitMQConsumer::new(
//!     Arc::new(LapinConnector::new(cfg.clone())),
//!     topology,
//!     MiddlewareChain::new().with(Arc::new(LoggingMiddleware)),
//!     &cfg,
//! );
//! consumer.start().await?;
//! consumer.stop().await;
//! # Ok(())
//! # }
//! ```

mod dispatcher;

pub mod account;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod middleware;
pub mod otel;
pub mod queue;
pub mod supervisor;
pub mod topology;
