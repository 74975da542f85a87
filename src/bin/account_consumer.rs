// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rmq_consumer::{
    account::{middlewares, setup_topology, InMemoryAccountStore},
    channel::LapinConnector,
    configs::{LoggingConfigs, RabbitMQConfigs},
    logging::init_tracing,
    otel::OtelEventMetrics,
    supervisor::{ConnectionState, RabbitMQConsumer},
    topology::TopologyRegistry,
};
use std::{process::ExitCode, sync::Arc};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing(&LoggingConfigs::from_env()) {
        eprintln!("failure to init logging: {err}");
        return ExitCode::FAILURE;
    }

    let cfg = RabbitMQConfigs::from_env();
    let meter = opentelemetry::global::meter("rmq-consumer");
    let metrics = Arc::new(OtelEventMetrics::new(&meter));

    let mut topology = TopologyRegistry::new();
    if let Err(err) = setup_topology(&mut topology, Arc::new(InMemoryAccountStore::new())) {
        error!(error = %err, "invalid topology");
        return ExitCode::FAILURE;
    }

    let consumer = RabbitMQConsumer::new(
        Arc::new(LapinConnector::new(cfg.clone())),
        topology,
        middlewares(metrics),
        &cfg,
    );

    if let Err(err) = consumer.start().await {
        error!(error = %err, "failure to start consumer");
        return ExitCode::FAILURE;
    }
    info!(app = %cfg.app_name, "consumer running");

    let mut state = consumer.state();
    let failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            false
        }
        _ = state.wait_for(|s| matches!(s, ConnectionState::Failed(_))) => true,
    };

    consumer.stop().await;
    info!("consumer stopped");

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
