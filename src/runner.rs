// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Runner
//!
//! One `QueueRunner` consumes one queue for the duration of a connection cycle.
//! Building it opens a channel and declares the queue's topology: DLX, DLQ, the
//! main quorum queue, its bindings and the prefetch window. Running it consumes
//! deliveries, hands each one to the queue's handler and acks or nacks it.
//!
//! Handler failures, panics included, end in a nack with requeue. The broker
//! counts redeliveries and dead-letters the message once the queue's delivery
//! limit is exceeded.

use crate::{
    delivery::Delivery, errors::AmqpError, exchange::ExchangeKind, handler::Handler, otel,
    queue::QueueSpec,
};
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

pub struct QueueRunner {
    exchange: String,
    spec: QueueSpec,
    channel: Channel,
    consumer_tag: String,
    closed: AtomicBool,
}

impl QueueRunner {
    /// Opens a channel on `conn` and declares the topology of `spec`.
    ///
    /// Any declaration failure closes the channel and is returned.
    ///
    /// # Parameters
    /// * `conn` - The live connection of the current cycle
    /// * `exchange` - Name of the exchange the queue is bound to
    /// * `spec` - The queue's resolved declaration and handler
    ///
    /// # Returns
    /// A runner ready to consume, owning its own channel
    pub async fn new(conn: &Connection, exchange: &str, spec: &QueueSpec) -> Result<Self, AmqpError> {
        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), queue = spec.name(), "error to create the channel");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };

        if let Err(err) = declare(&channel, exchange, spec).await {
            if let Err(close_err) = channel.close(REPLY_SUCCESS, "declaration failed").await {
                debug!(error = close_err.to_string(), "failure to close channel");
            }
            return Err(err);
        }

        Ok(QueueRunner {
            exchange: exchange.to_owned(),
            spec: spec.clone(),
            channel,
            consumer_tag: consumer_tag(exchange, spec.name()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &str {
        self.spec.name()
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Consumes the queue until `ctx` is cancelled or the channel closes.
    ///
    /// Cancellation closes the channel and returns `Ok`; losing the channel
    /// returns `AmqpError::ChannelClosed`.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                self.spec.name(),
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = self.spec.name(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(self.spec.name().to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(
            exchange = self.exchange,
            queue = self.spec.name(),
            consumer = self.consumer_tag,
            "consuming"
        );

        let tracer = global::tracer("amqp consumer");

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!(queue = self.spec.name(), "consumer cancelled");
                    let _ = self.close().await;
                    return Ok(());
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let mut span = otel::new_span(&delivery.properties, &tracer, self.spec.name());
                        let envelope = Delivery::from(&delivery);

                        match dispatch(self.spec.handler().as_ref(), &ctx, &envelope).await {
                            Ok(()) => {
                                debug!(queue = self.spec.name(), "message successfully processed");
                                match delivery.ack(BasicAckOptions { multiple: false }).await {
                                    Err(err) => {
                                        error!(error = err.to_string(), queue = self.spec.name(), "error whiling ack msg");
                                        span.record_error(&AmqpError::AckMessageError);
                                        span.set_status(Status::Error {
                                            description: Cow::from("error to ack msg"),
                                        });
                                    }
                                    _ => span.set_status(Status::Ok),
                                }
                            }
                            Err(err) => {
                                warn!(
                                    error = err.to_string(),
                                    queue = self.spec.name(),
                                    redelivered = envelope.redelivered,
                                    "error whiling handling msg, requeuing"
                                );
                                span.record_error(&err);
                                span.set_status(Status::Error {
                                    description: Cow::from(err.to_string()),
                                });

                                if let Err(err) = delivery
                                    .nack(BasicNackOptions {
                                        multiple: false,
                                        requeue: true,
                                    })
                                    .await
                                {
                                    error!(error = err.to_string(), queue = self.spec.name(), "error whiling nack msg");
                                    span.record_error(&AmqpError::NackMessageError);
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = err.to_string(), queue = self.spec.name(), "consumer channel failure");
                        return Err(AmqpError::ChannelClosed(format!("{}: {}", self.spec.name(), err)));
                    }
                    None => {
                        warn!(queue = self.spec.name(), "consumer stream ended");
                        return Err(AmqpError::ChannelClosed(self.spec.name().to_owned()));
                    }
                }
            }
        }
    }

    /// Closes the channel if it is still open. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.channel.status().connected() {
            return Ok(());
        }

        match self.channel.close(REPLY_SUCCESS, "closing").await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(error = err.to_string(), queue = self.spec.name(), "failure to close channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

/// Runs the handler, turning a panic into `AmqpError::HandlerPanic`.
pub(crate) async fn dispatch(
    handler: &dyn Handler,
    ctx: &CancellationToken,
    delivery: &Delivery,
) -> Result<(), AmqpError> {
    match AssertUnwindSafe(handler.handle(ctx, delivery))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(AmqpError::HandlerPanic(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn consumer_tag(exchange: &str, queue: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();

    format!("{exchange}-{queue}-{nanos}")
}

/// Declares DLX, DLQ, main queue, bindings and QoS, each when asked to.
async fn declare(channel: &Channel, exchange: &str, spec: &QueueSpec) -> Result<(), AmqpError> {
    if spec.declare_dlx {
        match spec.dlx_name() {
            Some(dlx) => declare_dlx(channel, dlx).await?,
            None => warn!(queue = spec.name(), "declare_dlx set without a dead-letter exchange"),
        }
    }

    if spec.declare_dlq {
        match spec.dlq_name() {
            Some(dlq) => declare_dlq(channel, spec, dlq).await?,
            None => warn!(queue = spec.name(), "declare_dlq set without a dead-letter queue"),
        }
    }

    if spec.declare {
        debug!("creating queue: {}", spec.name());

        match channel
            .queue_declare(
                spec.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                spec.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = spec.name(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(spec.name().to_owned()))
            }
            _ => {
                debug!("queue: {} was created", spec.name());
                Ok(())
            }
        }?;
    }

    for key in spec.bindings() {
        bind(channel, spec.name(), exchange, key).await?;
    }

    match channel
        .basic_qos(spec.prefetch_count(), BasicQosOptions { global: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = spec.name(), "error to configure qos");
            Err(AmqpError::QoSDeclarationError(spec.name().to_owned()))
        }
        _ => Ok(()),
    }
}

async fn declare_dlx(channel: &Channel, dlx: &str) -> Result<(), AmqpError> {
    debug!("creating dead-letter exchange: {}", dlx);

    match channel
        .exchange_declare(
            dlx,
            (&ExchangeKind::Fanout).into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = dlx, "error to declare the dead-letter exchange");
            Err(AmqpError::DeclareExchangeError(dlx.to_owned()))
        }
        _ => Ok(()),
    }
}

async fn declare_dlq(channel: &Channel, spec: &QueueSpec, dlq: &str) -> Result<(), AmqpError> {
    debug!("creating dead-letter queue: {}", dlq);

    match channel
        .queue_declare(
            dlq,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = dlq, "error to declare the dead-letter queue");
            Err(AmqpError::DeclareQueueError(dlq.to_owned()))
        }
        _ => Ok(()),
    }?;

    match spec.dlx_name() {
        Some(dlx) => {
            let key = spec.dl_routing_key.as_deref().unwrap_or_default();
            bind(channel, dlq, dlx, key).await
        }
        None => Ok(()),
    }
}

async fn bind(channel: &Channel, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue, exchange, key
    );

    match channel
        .queue_bind(
            queue,
            exchange,
            key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ))
        }
        _ => Ok(()),
    }
}
