// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Consumer Layer
//!
//! Every failure the consumer layer can observe is expressed as an `AmqpError`.
//! The variants group into four families:
//!
//! - connection: `ConnectionError`, `ConnectionLost`, `Cancelled`
//! - topology: exchange, queue, binding, QoS and consumer declaration failures
//! - handler: `HandlerError`, `HandlerPanic`
//! - channel: `ChannelError`, `ChannelClosed`
//!
//! None of them is surfaced to the hosting process once the supervisor runs; they
//! drive reconnects, nacks and log lines. `ConfigError` is the only kind returned
//! at startup.

use thiserror::Error;

/// Represents errors that can occur while connecting to, declaring topology on,
/// or consuming from a RabbitMQ broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Invalid or unreadable configuration, detected before the supervisor starts
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Dialing the broker failed, possibly after exhausting every retry
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The broker closed the connection or the connection failed
    #[error("connection lost `{0}`")]
    ConnectionLost(String),

    /// The caller's cancellation token fired before the operation finished
    #[error("operation cancelled")]
    Cancelled,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// A consumer channel was closed underneath a queue runner
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Business logic rejected a delivery
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// Business logic panicked while handling a delivery
    #[error("handler panicked `{0}`")]
    HandlerPanic(String),
}

impl AmqpError {
    /// Whether the error came out of a handler rather than the broker plumbing.
    pub fn is_handler_error(&self) -> bool {
        matches!(self, AmqpError::HandlerError(_) | AmqpError::HandlerPanic(_))
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
