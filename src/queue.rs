// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specifications
//!
//! A `QueueSpec` describes one consumed queue: its bindings, prefetch, delivery
//! limit, which parts of its dead-letter topology to declare, and the handler
//! that processes its messages.
//!
//! Every main queue is declared as a quorum queue with single active consumer,
//! so replicated consumer processes never work the same queue concurrently and
//! poison messages are dead-lettered once the delivery limit is exceeded.

use crate::{configs::DEFAULT_PREFETCH, handler::Handler};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Constant for the argument used to select the queue type
pub const AMQP_ARGS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_ARGS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify the delivery limit of a quorum queue
pub const AMQP_ARGS_DELIVERY_LIMIT: &str = "x-delivery-limit";
/// Constant for the argument used to specify the dead lettering strategy
pub const AMQP_ARGS_DEAD_LETTER_STRATEGY: &str = "x-dead-letter-strategy";
/// Constant for the argument used to specify the overflow behaviour
pub const AMQP_ARGS_OVERFLOW: &str = "x-overflow";
/// Constant for the argument used to enable single active consumer
pub const AMQP_ARGS_SINGLE_ACTIVE_CONSUMER: &str = "x-single-active-consumer";

const QUORUM: &str = "quorum";
const AT_LEAST_ONCE: &str = "at-least-once";
const REJECT_PUBLISH: &str = "reject-publish";

/// Definition of a consumed queue.
///
/// Dead-letter names are kept twice: the override set on the queue itself and
/// the resolved value, which falls back to the owning exchange's default when
/// no override was given.
#[derive(Clone)]
pub struct QueueSpec {
    pub(crate) name: String,
    pub(crate) bindings: Vec<String>,
    pub(crate) prefetch: u16,
    pub(crate) delivery_limit: i32,
    pub(crate) declare: bool,
    pub(crate) declare_dlx: bool,
    pub(crate) declare_dlq: bool,
    pub(crate) dlx_override: String,
    pub(crate) dlq_override: String,
    pub(crate) dlx_name: Option<String>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) dl_routing_key: Option<String>,
    pub(crate) handler: Arc<dyn Handler>,
}

impl fmt::Debug for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSpec")
            .field("name", &self.name)
            .field("bindings", &self.bindings)
            .field("prefetch", &self.prefetch)
            .field("delivery_limit", &self.delivery_limit)
            .field("declare", &self.declare)
            .field("declare_dlx", &self.declare_dlx)
            .field("declare_dlq", &self.declare_dlq)
            .field("dlx_name", &self.dlx_name)
            .field("dlq_name", &self.dlq_name)
            .field("dl_routing_key", &self.dl_routing_key)
            .finish_non_exhaustive()
    }
}

impl QueueSpec {
    /// Creates a queue spec served by `handler`.
    ///
    /// Defaults: no bindings, prefetch of 32, delivery limit 0, nothing declared.
    pub fn new(name: &str, handler: Arc<dyn Handler>) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            bindings: vec![],
            prefetch: DEFAULT_PREFETCH,
            delivery_limit: 0,
            declare: false,
            declare_dlx: false,
            declare_dlq: false,
            dlx_override: String::new(),
            dlq_override: String::new(),
            dlx_name: None,
            dlq_name: None,
            dl_routing_key: None,
            handler,
        }
    }

    /// Binds the queue to its exchange with `key`.
    pub fn binding(mut self, key: &str) -> Self {
        self.bindings.push(key.to_owned());
        self
    }

    /// Sets the prefetch window. Zero keeps the default.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        if prefetch > 0 {
            self.prefetch = prefetch;
        }
        self
    }

    /// Sets how many deliveries a message gets before being dead-lettered.
    pub fn delivery_limit(mut self, limit: i32) -> Self {
        self.delivery_limit = limit;
        self
    }

    pub fn declare(mut self) -> Self {
        self.declare = true;
        self
    }

    pub fn declare_dlx(mut self) -> Self {
        self.declare_dlx = true;
        self
    }

    pub fn declare_dlq(mut self) -> Self {
        self.declare_dlq = true;
        self
    }

    /// Overrides the dead-letter exchange inherited from the exchange.
    pub fn dlx(mut self, name: &str) -> Self {
        self.dlx_override = name.to_owned();
        self.dlx_name = non_empty(name);
        self
    }

    /// Overrides the dead-letter queue inherited from the exchange.
    pub fn dlq(mut self, name: &str) -> Self {
        self.dlq_override = name.to_owned();
        self.dlq_name = non_empty(name);
        self
    }

    /// Routing key dead-lettered messages are republished with.
    pub fn dl_routing_key(mut self, key: &str) -> Self {
        self.dl_routing_key = non_empty(key);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    /// Resolved dead-letter exchange.
    pub fn dlx_name(&self) -> Option<&str> {
        self.dlx_name.as_deref()
    }

    /// Resolved dead-letter queue.
    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Applies the exchange defaults to every dead-letter name without an override.
    pub(crate) fn resolve(&mut self, exchange_dlx: &str, exchange_dlq: &str) {
        self.dlx_name = non_empty(&self.dlx_override).or_else(|| non_empty(exchange_dlx));
        self.dlq_name = non_empty(&self.dlq_override).or_else(|| non_empty(exchange_dlq));
    }

    /// Broker arguments of the main queue.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        args.insert(
            ShortString::from(AMQP_ARGS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from(QUORUM)),
        );

        if let Some(dlx) = &self.dlx_name {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }

        if let Some(key) = &self.dl_routing_key {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        args.insert(
            ShortString::from(AMQP_ARGS_DELIVERY_LIMIT),
            AMQPValue::LongInt(LongInt::from(self.delivery_limit)),
        );
        args.insert(
            ShortString::from(AMQP_ARGS_DEAD_LETTER_STRATEGY),
            AMQPValue::LongString(LongString::from(AT_LEAST_ONCE)),
        );
        args.insert(
            ShortString::from(AMQP_ARGS_OVERFLOW),
            AMQPValue::LongString(LongString::from(REJECT_PUBLISH)),
        );
        args.insert(
            ShortString::from(AMQP_ARGS_SINGLE_ACTIVE_CONSUMER),
            AMQPValue::Boolean(true),
        );

        FieldTable::from(args)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}
