// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A `Handler` holds the business logic for one queue. Handlers are resolved by
//! queue name once, when the topology is built, and stay fixed for the life of
//! the process. Acknowledgement is not their concern: returning `Ok` acks the
//! delivery, returning an error nacks it for redelivery.

use crate::{delivery::Delivery, errors::AmqpError};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Business logic invoked for every delivery of a queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes one delivery.
    ///
    /// `ctx` is cancelled when the consumer is shutting down.
    async fn handle(&self, ctx: &CancellationToken, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Maps queue names to their handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers the handler for a queue, replacing any previous one.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(mut self, queue: &str, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(queue.to_owned(), handler);
        self
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
