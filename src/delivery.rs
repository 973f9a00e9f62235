// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Read-only view of a broker delivery handed to handlers.
//!
//! The acker stays with the queue runner, so a handler can inspect a message but
//! never acknowledge or reject it itself.

/// Broker-supplied envelope of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Delivery {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

impl From<&lapin::message::Delivery> for Delivery {
    fn from(delivery: &lapin::message::Delivery) -> Self {
        Delivery {
            body: delivery.data.clone(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string()),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        }
    }
}
