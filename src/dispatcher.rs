// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module starts consumption for every queue with a bound handler and
//! runs the workers that drain the resulting delivery streams.
//!
//! Each session gets its own [`WorkerGeneration`]: a cancellation token
//! shared by all of its workers and a task tracker used as completion
//! barrier. The supervisor stops a generation, and waits for it, before the
//! next one is started, so two generations never consume the same queue.
//!
//! Per queue the broker QoS is set to the queue prefetch count and the same
//! number of workers share the stream. The broker withholds deliveries
//! beyond the prefetch count until earlier ones are settled.

use crate::{
    broker::{BrokerSession, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    handler::{ConsumerHandler, PanicGuard},
    middleware::MiddlewareChain,
    topology::TopologyRegistry,
};
use futures_util::{stream::Fuse, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A consumable queue with its middleware-wrapped handler.
#[derive(Clone)]
pub(crate) struct ConsumerBinding {
    pub(crate) queue: Arc<str>,
    pub(crate) prefetch_count: u16,
    pub(crate) requeue: bool,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Resolves the consumable queues of the topology, wrapping each handler
/// with the middleware chain once. A handler panic is caught below the
/// chain and reaches the middlewares as a `false` outcome.
pub(crate) fn bindings(
    topology: &TopologyRegistry,
    middlewares: &MiddlewareChain,
) -> Vec<ConsumerBinding> {
    topology
        .consumable()
        .filter_map(|queue| {
            queue.handler.clone().map(|handler| ConsumerBinding {
                queue: Arc::from(queue.name.as_str()),
                prefetch_count: queue.prefetch_count,
                requeue: queue.requeue,
                handler: middlewares.apply(PanicGuard::wrap(handler)),
            })
        })
        .collect()
}

/// The set of workers consuming on behalf of one session.
pub(crate) struct WorkerGeneration {
    id: u64,
    token: CancellationToken,
    interrupted: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerGeneration {
    fn new(id: u64, parent: &CancellationToken) -> WorkerGeneration {
        WorkerGeneration {
            id,
            token: parent.child_token(),
            interrupted: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Resolves when a delivery stream ended without a stop request, which
    /// means the broker side of the session went away.
    pub(crate) async fn interrupted(&self) {
        self.interrupted.cancelled().await
    }

    pub(crate) fn workers(&self) -> usize {
        self.tracker.len()
    }

    /// Signals every worker and waits until all of them returned. A worker
    /// busy with a delivery finishes and settles it first.
    pub(crate) async fn stop(self) {
        debug!(generation = self.id, workers = self.tracker.len(), "stopping workers");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(generation = self.id, "workers stopped");
    }
}

/// Applies QoS, starts one consumer per binding and spawns its workers.
///
/// Runs on the task owning the session; declarations must be done already.
/// On error every worker spawned so far is stopped before returning.
///
/// # Parameters
/// * `session` - The session the topology was installed on
/// * `bindings` - Consumable queues with their wrapped handlers
/// * `id` - Generation number, used in log lines
/// * `parent` - Shutdown token; the generation token is its child
///
/// # Returns
/// The running generation, or the first QoS or consume error
pub(crate) async fn dispatch(
    session: &dyn BrokerSession,
    bindings: &[ConsumerBinding],
    id: u64,
    parent: &CancellationToken,
) -> Result<WorkerGeneration, AmqpError> {
    let generation = WorkerGeneration::new(id, parent);

    for binding in bindings {
        if let Err(err) = start_queue(session, binding, &generation).await {
            generation.stop().await;
            return Err(err);
        }
    }

    info!(
        generation = id,
        queues = bindings.len(),
        workers = generation.workers(),
        "consumption started"
    );
    Ok(generation)
}

async fn start_queue(
    session: &dyn BrokerSession,
    binding: &ConsumerBinding,
    generation: &WorkerGeneration,
) -> Result<(), AmqpError> {
    if let Err(err) = session.qos(binding.prefetch_count).await {
        error!(error = %err, queue = %binding.queue, "error setting qos");
        return Err(err);
    }

    let tag = format!("{}-{}", binding.queue, Uuid::new_v4());
    let stream = match session.consume(&binding.queue, &tag).await {
        Err(err) => {
            error!(error = %err, queue = %binding.queue, "failure to create the consumer");
            return Err(err);
        }
        Ok(stream) => Arc::new(Mutex::new(stream.fuse())),
    };

    for worker in 0..binding.prefetch_count.max(1) {
        generation.tracker.spawn(run_worker(
            binding.clone(),
            worker,
            stream.clone(),
            generation.token.clone(),
            generation.interrupted.clone(),
        ));
    }

    debug!(
        queue = %binding.queue,
        consumer_tag = %tag,
        workers = binding.prefetch_count.max(1),
        "queue consumer started"
    );
    Ok(())
}

/// Pulls deliveries until stopped or until the stream ends.
///
/// Only the wait for the next delivery races the stop signal; a delivery
/// already taken is always handled and settled.
async fn run_worker(
    binding: ConsumerBinding,
    worker: u16,
    stream: Arc<Mutex<Fuse<DeliveryStream>>>,
    token: CancellationToken,
    interrupted: CancellationToken,
) {
    debug!(queue = %binding.queue, worker, "start process events");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = async { stream.lock().await.next().await } => next,
        };

        match next {
            Some(Ok(delivery)) => {
                debug!(
                    queue = %binding.queue,
                    worker,
                    delivery_tag = delivery.message.delivery_tag,
                    "got event"
                );
                consume(
                    &binding.queue,
                    binding.requeue,
                    binding.handler.as_ref(),
                    delivery,
                )
                .await;
            }
            Some(Err(err)) => {
                warn!(error = %err, queue = %binding.queue, worker, "consumer stream failed");
                interrupted.cancel();
                break;
            }
            None => {
                if !token.is_cancelled() {
                    warn!(queue = %binding.queue, worker, "consumer stream closed");
                    interrupted.cancel();
                }
                break;
            }
        }
    }

    debug!(queue = %binding.queue, worker, "stop process events");
}
