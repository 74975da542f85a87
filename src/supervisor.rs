// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! [`RabbitMQConsumer`] owns the broker session for its whole lifetime and
//! drives the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Recovering -> Connected
//!                                                       \-> Failed
//! ```
//!
//! - Dial failures are retried forever with a fixed interval.
//! - Once connected, the topology is declared and the dispatcher starts a
//!   new worker generation.
//! - When the broker reports the session closed, the current generation is
//!   stopped and drained, the old session is dropped and the whole
//!   connect -> declare -> consume sequence runs again on a fresh session.
//! - A declaration rejected by the broker is fatal and ends supervision in
//!   `Failed`; no further reconnect is attempted.

use crate::{
    broker::{BrokerConnector, BrokerSession},
    configs::RabbitMQConfigs,
    dispatcher::{self, ConsumerBinding, WorkerGeneration},
    errors::AmqpError,
    middleware::MiddlewareChain,
    topology::TopologyRegistry,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable state of the supervised connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Topology declared and workers of this generation running
    Connected { generation: u64 },
    Recovering,
    /// A fatal configuration error ended supervision
    Failed(AmqpError),
}

struct Supervisor {
    connector: Arc<dyn BrokerConnector>,
    topology: Arc<TopologyRegistry>,
    bindings: Vec<ConsumerBinding>,
    reconnect_interval: Duration,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    generations: AtomicU64,
}

impl Supervisor {
    /// Dials, declares and starts consumption, retrying transient failures
    /// until it succeeds. Only fatal errors and shutdown are returned.
    async fn establish(&self) -> Result<(Box<dyn BrokerSession>, WorkerGeneration), AmqpError> {
        loop {
            let session = self.dial().await?;
            let id = self.generations.fetch_add(1, Ordering::SeqCst) + 1;

            match self.setup(session.as_ref(), id).await {
                Ok(generation) => {
                    self.state.send_replace(ConnectionState::Connected { generation: id });
                    return Ok((session, generation));
                }
                Err(err) => {
                    close_session(session.as_ref()).await;

                    if err.is_fatal() {
                        error!(error = %err, "invalid topology, giving up");
                        return Err(err);
                    }

                    warn!(error = %err, "failure to set up the session, reconnecting");
                    self.backoff().await?;
                }
            }
        }
    }

    /// Declaration runs sequentially on this task before any worker starts.
    async fn setup(
        &self,
        session: &dyn BrokerSession,
        id: u64,
    ) -> Result<WorkerGeneration, AmqpError> {
        self.topology.install(session).await?;
        dispatcher::dispatch(session, &self.bindings, id, &self.shutdown).await
    }

    async fn dial(&self) -> Result<Box<dyn BrokerSession>, AmqpError> {
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            info!("start connect to rabbitmq");

            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(AmqpError::Shutdown),
                attempt = self.connector.connect() => attempt,
            };

            match attempt {
                Ok(session) => {
                    info!("success connect to rabbitmq");
                    return Ok(session);
                }
                Err(err) => {
                    error!(
                        error = %err,
                        retry_in = ?self.reconnect_interval,
                        "failed connect to rabbitmq"
                    );
                    self.backoff().await?;
                }
            }
        }
    }

    async fn backoff(&self) -> Result<(), AmqpError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(AmqpError::Shutdown),
            _ = sleep(self.reconnect_interval) => Ok(()),
        }
    }

    /// Watches the live session until shutdown or until it is lost.
    async fn supervise(
        self: Arc<Self>,
        mut session: Box<dyn BrokerSession>,
        mut generation: WorkerGeneration,
    ) {
        loop {
            let lost = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => false,
                _ = session.closed() => true,
                _ = generation.interrupted() => true,
            };

            let id = generation.id();
            generation.stop().await;
            close_session(session.as_ref()).await;

            if !lost {
                self.state.send_replace(ConnectionState::Disconnected);
                info!(generation = id, "closing rabbitmq channels and connection");
                return;
            }

            warn!(generation = id, "rabbitmq session closed, start reconnect");
            self.state.send_replace(ConnectionState::Recovering);

            match self.establish().await {
                Ok((next_session, next_generation)) => {
                    info!(generation = next_generation.id(), "success reconsume queues after reconnect");
                    session = next_session;
                    generation = next_generation;
                }
                Err(AmqpError::Shutdown) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    return;
                }
                Err(err) => {
                    error!(error = %err, "failed reconnect to rabbitmq");
                    self.state.send_replace(ConnectionState::Failed(err));
                    return;
                }
            }
        }
    }
}

async fn close_session(session: &dyn BrokerSession) {
    if let Err(err) = session.close().await {
        debug!(error = %err, "session was already closed");
    }
}

/// Consumes every handler-bound queue of a topology and keeps doing so
/// across broker disconnects.
pub struct RabbitMQConsumer {
    supervisor: Arc<Supervisor>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RabbitMQConsumer {
    /// Creates a consumer that is not connected yet.
    ///
    /// The topology is frozen from here on; handlers are wrapped with the
    /// middleware chain once.
    ///
    /// # Parameters
    /// * `connector` - Dials the broker, once per session
    /// * `topology` - Exchanges and queues to declare, with their handlers
    /// * `middlewares` - Chain wrapped around every bound handler
    /// * `cfg` - Connection settings; only the reconnect interval is read here
    ///
    /// # Returns
    /// A consumer in the `Disconnected` state
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: TopologyRegistry,
        middlewares: MiddlewareChain,
        cfg: &RabbitMQConfigs,
    ) -> RabbitMQConsumer {
        let bindings = dispatcher::bindings(&topology, &middlewares);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        RabbitMQConsumer {
            supervisor: Arc::new(Supervisor {
                connector,
                topology: Arc::new(topology),
                bindings,
                reconnect_interval: cfg.reconnect_interval,
                shutdown: CancellationToken::new(),
                state,
                generations: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.supervisor.topology
    }

    /// # Returns
    /// A receiver observing every connection state change
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state.subscribe()
    }

    /// Returns once the topology is declared and consumption runs.
    ///
    /// Keeps dialing while the broker is unreachable. Returns the error when
    /// the broker rejects the topology, or [`AmqpError::Shutdown`] when
    /// [`stop`](Self::stop) is called meanwhile.
    ///
    /// # Returns
    /// * `Ok(())` - Consumption runs and is supervised in the background
    /// * `Err(AmqpError::AlreadyStarted)` - A previous call already succeeded
    /// * `Err(err)` - A fatal declaration error, the state becomes `Failed`
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(AmqpError::AlreadyStarted);
        }

        info!(
            exchanges = self.supervisor.topology.exchanges().len(),
            queues = self.supervisor.topology.queues().len(),
            consumers = self.supervisor.bindings.len(),
            "starting consumer"
        );

        let (session, generation) = match self.supervisor.establish().await {
            Ok(established) => established,
            Err(err) => {
                let state = match &err {
                    AmqpError::Shutdown => ConnectionState::Disconnected,
                    _ => ConnectionState::Failed(err.clone()),
                };
                self.supervisor.state.send_replace(state);
                return Err(err);
            }
        };

        *task = Some(tokio::spawn(
            self.supervisor.clone().supervise(session, generation),
        ));
        Ok(())
    }

    /// Stops every worker, then closes the session and the connection.
    /// Returns once all of it is done; calling it again is a no-op.
    pub async fn stop(&self) {
        self.supervisor.shutdown.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "supervisor task failed");
            }
        }
    }
}

impl Drop for RabbitMQConsumer {
    fn drop(&mut self) {
        self.supervisor.shutdown.cancel();
    }
}
