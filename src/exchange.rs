// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Specifications
//!
//! An `ExchangeSpec` is the validated, immutable form of one configured exchange.
//! It carries the dead-letter defaults inherited by its queues and the queues
//! themselves, already resolved against those defaults.

use crate::{errors::AmqpError, queue::QueueSpec};
use std::str::FromStr;

/// Represents the types of exchanges a consumer topology may declare.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::ConfigError(format!(
                "unsupported exchange kind `{other}`"
            ))),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Validated definition of an exchange and its consumed queues.
///
/// Built with the builder methods below; queues added with [`ExchangeSpec::queue`]
/// inherit the exchange's DLX/DLQ names unless they carry their own.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) declare: bool,
    pub(crate) dlx_name: String,
    pub(crate) dlq_name: String,
    pub(crate) queues: Vec<QueueSpec>,
}

impl ExchangeSpec {
    /// Creates a non-durable, undeclared exchange spec of the given kind.
    pub fn new(name: &str, kind: ExchangeKind) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            kind,
            durable: false,
            declare: false,
            dlx_name: String::new(),
            dlq_name: String::new(),
            queues: vec![],
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Asks the supervisor to declare the exchange on every connect.
    pub fn declare(mut self) -> Self {
        self.declare = true;
        self
    }

    /// Sets the default dead-letter exchange for the queues of this exchange.
    pub fn dlx(mut self, name: &str) -> Self {
        self.dlx_name = name.to_owned();
        self.resolve_queues();
        self
    }

    /// Sets the default dead-letter queue for the queues of this exchange.
    pub fn dlq(mut self, name: &str) -> Self {
        self.dlq_name = name.to_owned();
        self.resolve_queues();
        self
    }

    /// Adds a queue, resolving its dead-letter names against this exchange.
    pub fn queue(mut self, mut queue: QueueSpec) -> Self {
        queue.resolve(&self.dlx_name, &self.dlq_name);
        self.queues.push(queue);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    fn resolve_queues(&mut self) {
        for queue in self.queues.iter_mut() {
            queue.resolve(&self.dlx_name, &self.dlq_name);
        }
    }
}
