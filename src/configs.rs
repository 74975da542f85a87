// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! Connection and logging settings, loaded from environment variables with
//! defaults suitable for a local broker.

use std::{env, time::Duration};

/// Delay between two dial attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Reported to the broker as the connection name
    pub app_name: String,
    pub reconnect_interval: Duration,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            app_name: "rmq-consumer".to_owned(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl RabbitMQConfigs {
    pub fn from_env() -> Self {
        let defaults = RabbitMQConfigs::default();

        RabbitMQConfigs {
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: env::var("RABBITMQ_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            app_name: env::var("APP_NAME").unwrap_or(defaults.app_name),
            reconnect_interval: env::var("RABBITMQ_RECONNECT_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_interval),
        }
    }

    /// AMQP URI with credentials, host and vhost. The default vhost `/`
    /// has to be sent percent-encoded.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "%2f",
            other => other.trim_start_matches('/'),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfigs {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `rmq_consumer=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfigs {
    fn default() -> Self {
        LoggingConfigs {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfigs {
    pub fn from_env() -> Self {
        let format = match env::var("LOGS_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        LoggingConfigs {
            level: env::var("LOGS_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or_else(|_| "info".to_owned()),
            format,
        }
    }
}
