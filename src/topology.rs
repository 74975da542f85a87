// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module keeps the declared queues and exchanges in memory and
//! installs them on a broker session. Registration has no broker side
//! effect; the supervisor calls [`TopologyRegistry::install`] once per
//! session, so a reconnect re-declares exactly what was registered.
//!
//! Names are unique per registry. A duplicate is reported immediately as a
//! fatal [`AmqpError`], before the consumer can be started.

use crate::{
    broker::BrokerSession, errors::AmqpError, exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use std::collections::HashSet;
use tracing::{debug, error, info};

/// In-memory set of exchanges and queues, in registration order.
#[derive(Debug, Default, Clone)]
pub struct TopologyRegistry {
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    queue_names: HashSet<String>,
    exchange_names: HashSet<String>,
}

impl TopologyRegistry {
    pub fn new() -> TopologyRegistry {
        TopologyRegistry::default()
    }

    /// Registers a standalone queue.
    ///
    /// # Parameters
    /// * `def` - The queue definition, optionally carrying its handler
    ///
    /// # Returns
    /// `Ok(())` or `DuplicateQueueError` when the name is already taken
    pub fn register_queue(&mut self, def: QueueDefinition) -> Result<(), AmqpError> {
        if self.queue_names.contains(&def.name) {
            error!(queue = %def.name, "queue already registered");
            return Err(AmqpError::DuplicateQueueError(def.name));
        }

        self.queue_names.insert(def.name.clone());
        self.queues.push(def);
        Ok(())
    }

    /// Registers an exchange and, before it, every queue bound to it.
    ///
    /// Nothing is registered when any of the names clash.
    ///
    /// # Parameters
    /// * `def` - The exchange definition with the queues bound to it
    ///
    /// # Returns
    /// `Ok(())`, `DuplicateExchangeError` for a known exchange name or
    /// `DuplicateQueueError` for a known or repeated queue name
    pub fn register_exchange(&mut self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        if self.exchange_names.contains(&def.name) {
            error!(exchange = %def.name, "exchange already registered");
            return Err(AmqpError::DuplicateExchangeError(def.name));
        }

        let mut incoming = HashSet::new();
        for queue in &def.queues {
            if self.queue_names.contains(&queue.name) || !incoming.insert(queue.name.as_str()) {
                error!(
                    queue = %queue.name,
                    exchange = %def.name,
                    "queue already registered"
                );
                return Err(AmqpError::DuplicateQueueError(queue.name.clone()));
            }
        }

        for queue in &def.queues {
            self.register_queue(queue.clone())?;
        }

        self.exchange_names.insert(def.name.clone());
        self.exchanges.push(def);
        Ok(())
    }

    /// Registers several queues, stopping at the first duplicate.
    pub fn register_queues(
        &mut self,
        defs: impl IntoIterator<Item = QueueDefinition>,
    ) -> Result<(), AmqpError> {
        defs.into_iter().try_for_each(|def| self.register_queue(def))
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Queues with a bound handler; only these are consumed.
    pub fn consumable(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.queues.iter().filter(|q| q.has_handler())
    }

    /// Installs the topology on the given session.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all queues
    /// 2. Declares all exchanges, each followed by the bindings of its queues
    ///
    /// # Parameters
    /// * `session` - An open broker session
    ///
    /// # Returns
    /// The first declaration or binding error, if any
    pub async fn install(&self, session: &dyn BrokerSession) -> Result<(), AmqpError> {
        self.install_queues(session).await?;
        self.install_exchanges(session).await?;

        info!(
            queues = self.queues.len(),
            exchanges = self.exchanges.len(),
            "topology declared"
        );
        Ok(())
    }

    async fn install_queues(&self, session: &dyn BrokerSession) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = session.declare_queue(def).await {
                error!(error = %err, queue = %def.name, "failure to declare queue");
                return Err(err);
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn install_exchanges(&self, session: &dyn BrokerSession) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = session.declare_exchange(exch).await {
                error!(
                    error = %err,
                    name = %exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            for queue in &exch.queues {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue.name, exch.name, queue.routing_key
                );

                if let Err(err) = session
                    .bind_queue(&queue.name, &exch.name, &queue.routing_key)
                    .await
                {
                    error!(error = %err, "error to bind queue to exchange");
                    return Err(err);
                }
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }
}
