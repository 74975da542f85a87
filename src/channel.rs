// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker traits on top of lapin. Every dial
//! opens a new connection and one channel on it; the pair is dropped as a
//! whole on reconnect.
//!
//! Broker errors are classified here: a channel level refusal during
//! declaration (for instance `PRECONDITION_FAILED` on mismatching queue
//! arguments) is a configuration error. Connection level closes such as
//! `CONNECTION_FORCED` on a broker restart, and anything else, are
//! connectivity.

use crate::{
    broker::{Acker, BrokerConnector, BrokerSession, Delivery, DeliveryStream},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerMessage,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::AMQPErrorKind,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Opens a connection and a channel on it.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), rmq_consumer::errors::AmqpError> {
/// use rmq_consumer::{channel::new_amqp_channel, configs::RabbitMQConfigs};
///
/// let (conn, channel) = new_amqp_channel(&RabbitMQConfigs::default()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(cfg: &RabbitMQConfigs) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = %err, "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = %err, "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// Dials RabbitMQ with the configured URI.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    cfg: RabbitMQConfigs,
}

impl LapinConnector {
    pub fn new(cfg: RabbitMQConfigs) -> LapinConnector {
        LapinConnector { cfg }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.cfg).await?;
        Ok(Box::new(LapinSession::new(conn, channel)))
    }
}

/// A lapin connection with its single channel.
pub struct LapinSession {
    conn: Connection,
    channel: Channel,
    closed: Arc<Notify>,
}

impl LapinSession {
    pub fn new(conn: Connection, channel: Channel) -> LapinSession {
        let closed = Arc::new(Notify::new());

        let notify = closed.clone();
        conn.on_error(move |err| {
            error!(error = %err, "rabbitmq connection closed");
            notify.notify_one();
        });

        let notify = closed.clone();
        channel.on_error(move |err| {
            error!(error = %err, "rabbitmq channel closed");
            notify.notify_one();
        });

        LapinSession {
            conn,
            channel,
            closed,
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }
}

/// Soft protocol errors (403, 404, 406) are broker refusals of the
/// declaration; hard ones close the connection and are transport.
fn classify(err: lapin::Error, config_error: AmqpError) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(ref amqp) if matches!(amqp.kind(), AMQPErrorKind::Soft(_)) => {
            config_error
        }
        other => AmqpError::ChannelError(other.to_string()),
    }
}

/// Keeps the first failure of a close sequence.
fn first_error(results: [Result<(), AmqpError>; 2]) -> Result<(), AmqpError> {
    results.into_iter().collect()
}

#[async_trait]
impl BrokerSession for LapinSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
            .map_err(|err| classify(err, AmqpError::DeclareExchangeError(def.name.clone())))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.args.clone()),
            )
            .await
            .map(|_| ())
            .map_err(|err| classify(err, AmqpError::DeclareQueueError(def.name.clone())))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                classify(
                    err,
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned()),
                )
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::BindingConsumerError(err.to_string()))?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| into_delivery(&queue, delivery))
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn closed(&self) {
        if !self.is_open() {
            return;
        }
        self.closed.notified().await
    }

    /// Closes the channel, then the connection. The connection close is
    /// attempted even when the channel close failed.
    async fn close(&self) -> Result<(), AmqpError> {
        let mut results = [Ok(()), Ok(())];

        if self.channel.status().connected() {
            results[0] = self
                .channel
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|err| AmqpError::CloseError(err.to_string()));
        }

        if self.conn.status().connected() {
            results[1] = self
                .conn
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|err| AmqpError::CloseError(err.to_string()));
        }

        first_error(results)
    }
}

fn into_delivery(queue: &str, delivery: AmqpDelivery) -> Delivery {
    let message = ConsumerMessage {
        queue: queue.to_owned(),
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        msg_type: delivery
            .properties
            .kind()
            .as_ref()
            .map(|kind| kind.as_str().to_owned()),
        data: delivery.data,
    };

    Delivery::new(message, Box::new(ChannelAcker(delivery.acker)))
}

struct ChannelAcker(LapinAcker);

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::RejectMessageError)
    }
}
