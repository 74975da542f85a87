// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the single error type used across the crate. The
//! `AmqpError` enum covers topology registration, connection and channel
//! setup, declaration, consumption and acknowledgment failures.
//!
//! Errors fall in two classes, see [`AmqpError::is_fatal`]: configuration
//! errors abort startup, everything else is retried by the supervisor or
//! only logged.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// A queue with the same name was already registered
    #[error("queue already registered `{0}`")]
    DuplicateQueueError(String),

    /// An exchange with the same name was already registered
    #[error("exchange already registered `{0}`")]
    DuplicateExchangeError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The broker rejected an exchange declaration
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// The broker rejected a queue declaration
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker rejected a queue binding
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error pulling the next delivery from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// A stop request interrupted the operation
    #[error("consumer is shutting down")]
    Shutdown,

    /// `start` was called on a consumer that already ran
    #[error("consumer already started")]
    AlreadyStarted,
}

impl AmqpError {
    /// Configuration errors are programmer errors: the process must not keep
    /// running with an ambiguous or rejected topology.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::DuplicateQueueError(_)
                | AmqpError::DuplicateExchangeError(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }
}
