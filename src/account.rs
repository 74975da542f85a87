// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Account and Company Event Consumers
//!
//! Handlers for the events published by the accounts service, the store
//! they write to and the topology they are consumed from.
//!
//! Account events are upserted by `external_id`. An event older than, or
//! as old as, the stored record is skipped and still acknowledged, so
//! replays and out-of-order deliveries never overwrite newer data.
//!
//! ```json
//! {
//!     "external_id": "1",
//!     "name": "account1",
//!     "created_at": "2020-11-20T22:56:57.565Z",
//!     "updated_at": "2020-11-20T22:56:57.565Z"
//! }
//! ```

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, ConsumerMessage},
    middleware::{LoggingMiddleware, MetricsMiddleware, MiddlewareChain},
    otel::EventMetrics,
    queue::{delayed_retry, QueueDefinition},
    topology::TopologyRegistry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

pub const COMPANIES_EXCHANGE: &str = "events.companies";
pub const COMPANIES_QUEUE: &str = "go-example-companies";
pub const ACCOUNTS_QUEUE: &str = "go-example-accounts";
pub const ACCOUNTS_FAILED_QUEUE: &str = "go-example-accounts-failed";

/// Time a failed account event waits before it is retried, in milliseconds.
pub const ACCOUNTS_RETRY_DELAY_MS: i32 = 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub external_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What `create_or_update` did with the incoming account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Upserted,
    /// The stored record is as new or newer
    Skipped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("account store unavailable `{0}`")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Inserts or replaces the account keyed by `external_id`. Unless
    /// `force` is set, only a strictly newer `updated_at` replaces a
    /// stored record.
    async fn create_or_update(
        &self,
        account: &Account,
        force: bool,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Account>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> InMemoryAccountStore {
        InMemoryAccountStore::default()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn create_or_update(
        &self,
        account: &Account,
        force: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut accounts = self.accounts.write().await;

        if let Some(stored) = accounts.get(&account.external_id) {
            if !force && stored.updated_at >= account.updated_at {
                return Ok(UpsertOutcome::Skipped);
            }
        }

        accounts.insert(account.external_id.clone(), account.clone());
        Ok(UpsertOutcome::Upserted)
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().await.get(external_id).cloned())
    }
}

/// Upserts the account carried by each event.
pub struct AccountEventHandler {
    store: Arc<dyn AccountStore>,
}

impl AccountEventHandler {
    pub fn new(store: Arc<dyn AccountStore>) -> AccountEventHandler {
        AccountEventHandler { store }
    }
}

#[async_trait]
impl ConsumerHandler for AccountEventHandler {
    async fn exec(&self, msg: &ConsumerMessage) -> bool {
        if msg.data.is_empty() {
            error!(queue = %msg.queue, "invalid account event: empty body");
            return false;
        }

        let account: Account = match serde_json::from_slice(&msg.data) {
            Ok(account) => account,
            Err(err) => {
                error!(msg = %msg.body(), error = %err, "invalid account event");
                return false;
            }
        };

        match self.store.create_or_update(&account, false).await {
            Ok(UpsertOutcome::Upserted) => true,
            Ok(UpsertOutcome::Skipped) => {
                info!(msg = %msg.body(), "skip duplicate or expired event");
                true
            }
            Err(err) => {
                error!(msg = %msg.body(), error = %err, "failed create or update account");
                false
            }
        }
    }
}

/// Accepts any non-empty company event.
pub struct CompanyEventHandler;

#[async_trait]
impl ConsumerHandler for CompanyEventHandler {
    async fn exec(&self, msg: &ConsumerMessage) -> bool {
        if msg.data.is_empty() {
            error!(queue = %msg.queue, "invalid company event: empty body");
            return false;
        }
        true
    }
}

/// Registers the company fanout and the account queues with their delayed
/// retry companion.
pub fn setup_topology(
    registry: &mut TopologyRegistry,
    store: Arc<dyn AccountStore>,
) -> Result<(), AmqpError> {
    let companies = QueueDefinition::new(COMPANIES_QUEUE)
        .routing_key(COMPANIES_EXCHANGE)
        .handler(Arc::new(CompanyEventHandler));
    registry.register_exchange(
        ExchangeDefinition::new(COMPANIES_EXCHANGE)
            .fanout()
            .queue(companies),
    )?;

    let (accounts, accounts_failed) = delayed_retry(
        QueueDefinition::new(ACCOUNTS_QUEUE).handler(Arc::new(AccountEventHandler::new(store))),
        ACCOUNTS_FAILED_QUEUE,
        ACCOUNTS_RETRY_DELAY_MS,
    );
    registry.register_queues([accounts, accounts_failed])
}

/// Logging outermost, then metrics.
pub fn middlewares(metrics: Arc<dyn EventMetrics>) -> MiddlewareChain {
    MiddlewareChain::new()
        .with(Arc::new(LoggingMiddleware))
        .with(Arc::new(MetricsMiddleware::new(metrics)))
}
