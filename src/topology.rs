// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Turns the declarative exchange/queue configuration into validated specs and
//! declares exchanges on the broker.
//!
//! The main components are:
//! - `TopologyBuilder`: resolves configuration into `ExchangeSpec`s, dropping
//!   anything incomplete and assigning each queue its handler
//! - `declare_exchange`: declares one exchange on a channel
//!
//! Queue-level declarations (DLX, DLQ, main queue, bindings, QoS) belong to the
//! queue runner that owns the queue's channel.

use crate::{
    configs::ExchangeConfigs,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeSpec},
    handler::HandlerRegistry,
    queue::QueueSpec,
};
use lapin::{options::ExchangeDeclareOptions, types::FieldTable, Channel};
use tracing::{debug, error, warn};

/// Resolves configured exchanges and queues into specs.
pub struct TopologyBuilder<'tb> {
    registry: &'tb HandlerRegistry,
}

impl<'tb> TopologyBuilder<'tb> {
    /// Creates a builder resolving handlers from `registry`.
    ///
    /// # Parameters
    /// * `registry` - Handlers keyed by queue name; queues without one are skipped
    pub fn new(registry: &'tb HandlerRegistry) -> TopologyBuilder<'tb> {
        TopologyBuilder { registry }
    }

    /// Builds the exchange specs, in configuration order.
    ///
    /// Exchanges without a name or a known kind, queues without a name and
    /// queues without a registered handler are skipped with a warning. Every
    /// returned queue has its dead-letter names resolved.
    pub fn build(&self, configs: &[ExchangeConfigs]) -> Vec<ExchangeSpec> {
        let mut specs = vec![];

        for cfg in configs {
            if cfg.name.is_empty() || cfg.kind.is_empty() {
                warn!(
                    name = cfg.name,
                    kind = cfg.kind,
                    "skipping exchange without name or kind"
                );
                continue;
            }

            let kind = match cfg.kind.parse::<ExchangeKind>() {
                Ok(kind) => kind,
                Err(err) => {
                    warn!(error = err.to_string(), name = cfg.name, "skipping exchange");
                    continue;
                }
            };

            let mut spec = ExchangeSpec::new(&cfg.name, kind)
                .dlx(&cfg.dlx_name)
                .dlq(&cfg.dlq_name);

            if cfg.durable {
                spec = spec.durable();
            }

            if cfg.declare {
                spec = spec.declare();
            }

            for queue in &cfg.queues {
                if queue.name.is_empty() {
                    warn!(exchange = cfg.name, "skipping queue without name");
                    continue;
                }

                let Some(handler) = self.registry.get(&queue.name) else {
                    warn!(
                        exchange = cfg.name,
                        queue = queue.name,
                        "skipping queue without handler"
                    );
                    continue;
                };

                let mut queue_spec = QueueSpec::new(&queue.name, handler)
                    .prefetch(queue.prefetch)
                    .delivery_limit(queue.delivery_limit)
                    .dlx(&queue.dlx_name)
                    .dlq(&queue.dlq_name)
                    .dl_routing_key(&queue.dl_routing_key);

                for key in &queue.bindings {
                    queue_spec = queue_spec.binding(key);
                }

                if queue.declare {
                    queue_spec = queue_spec.declare();
                }

                if queue.declare_dlx {
                    queue_spec = queue_spec.declare_dlx();
                }

                if queue.declare_dlq {
                    queue_spec = queue_spec.declare_dlq();
                }

                spec = spec.queue(queue_spec);
            }

            debug!(
                exchange = spec.name(),
                queues = spec.queues().len(),
                "exchange resolved"
            );

            specs.push(spec);
        }

        specs
    }
}

/// Declares an exchange on `channel`.
///
/// A declaration that conflicts with an existing exchange fails and closes the
/// channel on the broker side; it is never treated as success.
pub async fn declare_exchange(channel: &Channel, exch: &ExchangeSpec) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", exch.name);

    match channel
        .exchange_declare(
            &exch.name,
            (&exch.kind).into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: exch.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exch.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(exch.name.clone()))
        }
        _ => {
            debug!("exchange: {} was created", exch.name);
            Ok(())
        }
    }
}
