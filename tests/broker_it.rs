//! Scenarios against a live RabbitMQ.
//!
//! Run with `cargo test -- --ignored` and point `RABBITMQ__HOST`, `RABBITMQ__PORT`,
//! `RABBITMQ__USER` and `RABBITMQ__PASSWORD` at a broker with quorum queue support.

use async_trait::async_trait;
use lapin::{
    options::{BasicGetOptions, BasicPublishOptions, QueueDeclareOptions, QueueDeleteOptions},
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties,
};
use rabbitmq_consumers::{
    configs::{self, ExchangeConfigs, QueueConfigs, RabbitMQConfigs},
    AmqpError, Delivery, Handler, HandlerRegistry, Manager, Shutdowner,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Counting {
    calls: AtomicUsize,
    fail: bool,
}

impl Counting {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for Counting {
    async fn handle(&self, _: &CancellationToken, _: &Delivery) -> Result<(), AmqpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AmqpError::HandlerError("always failing".into()));
        }
        Ok(())
    }
}

fn deadline(after: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        timer.cancel();
    });
    token
}

async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn topology(cfg: &mut RabbitMQConfigs, id: &str, queue: QueueConfigs) {
    cfg.exchanges = vec![ExchangeConfigs {
        name: format!("it-{id}"),
        kind: "topic".into(),
        durable: true,
        declare: true,
        dlx_name: format!("it-{id}.dlx"),
        dlq_name: format!("it-{id}.dlq"),
        queues: vec![queue],
    }];
}

async fn publish(cfg: &RabbitMQConfigs, exchange: &str, key: &str, bodies: &[Vec<u8>]) {
    let conn = Connection::connect(&cfg.uri(), ConnectionProperties::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();

    for body in bodies {
        channel
            .basic_publish(
                exchange,
                key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .unwrap()
            .await
            .unwrap();
    }

    conn.close(200, "done").await.unwrap();
}

async fn message_count(cfg: &RabbitMQConfigs, queue: &str) -> u32 {
    let conn = Connection::connect(&cfg.uri(), ConnectionProperties::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();
    let declared = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    let count = declared.message_count();
    conn.close(200, "done").await.unwrap();
    count
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn valid_messages_are_each_handled_once() {
    let id = Uuid::new_v4().to_string();
    let queue = format!("it-{id}.users");
    let mut cfg = configs::load(None).unwrap();
    topology(
        &mut cfg,
        &id,
        QueueConfigs {
            name: queue.clone(),
            bindings: vec!["user.#".into()],
            delivery_limit: 5,
            declare: true,
            ..Default::default()
        },
    );

    let handler = Counting::new(false);
    let registry = HandlerRegistry::new().register(&queue, handler.clone());
    let manager = Manager::new(&cfg, &registry).unwrap();
    let handle = manager.start(&CancellationToken::new());

    handle.wait_ready(&deadline(Duration::from_secs(10))).await.unwrap();

    let bodies: Vec<Vec<u8>> = (0..10).map(|i| format!("{{\"n\":{i}}}").into_bytes()).collect();
    publish(&cfg, &format!("it-{id}"), "user.created", &bodies).await;

    assert!(wait_until(Duration::from_secs(10), || handler.calls() == 10).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handler.calls(), 10);
    assert_eq!(message_count(&cfg, &queue).await, 0);

    handle.shutdown(&deadline(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn poison_message_lands_in_the_dead_letter_queue() {
    let id = Uuid::new_v4().to_string();
    let queue = format!("it-{id}.passwords");
    let dlq = format!("it-{id}.dlq");
    let mut cfg = configs::load(None).unwrap();
    topology(
        &mut cfg,
        &id,
        QueueConfigs {
            name: queue.clone(),
            bindings: vec!["password.*".into()],
            delivery_limit: 5,
            declare: true,
            declare_dlx: true,
            declare_dlq: true,
            dl_routing_key: "password.dead".into(),
            ..Default::default()
        },
    );

    let handler = Counting::new(true);
    let registry = HandlerRegistry::new().register(&queue, handler.clone());
    let manager = Manager::new(&cfg, &registry).unwrap();
    let handle = manager.start(&CancellationToken::new());

    handle.wait_ready(&deadline(Duration::from_secs(10))).await.unwrap();

    let body = br#"{"identifier":"u-1"}"#.to_vec();
    publish(&cfg, &format!("it-{id}"), "password.updated", &[body.clone()]).await;

    assert!(wait_until(Duration::from_secs(10), || handler.calls() >= 6).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.calls(), 6);

    let conn = Connection::connect(&cfg.uri(), ConnectionProperties::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();
    let dead = channel
        .basic_get(&dlq, BasicGetOptions { no_ack: true })
        .await
        .unwrap()
        .expect("one dead-lettered message");

    assert_eq!(dead.delivery.data, body);
    assert_eq!(dead.delivery.routing_key.as_str(), "password.dead");
    assert!(channel
        .basic_get(&dlq, BasicGetOptions { no_ack: true })
        .await
        .unwrap()
        .is_none());
    conn.close(200, "done").await.unwrap();

    handle.shutdown(&deadline(Duration::from_secs(5))).await.unwrap();
}

async fn delete_queue(cfg: &RabbitMQConfigs, queue: &str) {
    let conn = Connection::connect(&cfg.uri(), ConnectionProperties::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();
    channel
        .queue_delete(queue, QueueDeleteOptions::default())
        .await
        .unwrap();
    conn.close(200, "done").await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn consumers_resume_after_their_queue_is_lost() {
    let id = Uuid::new_v4().to_string();
    let queue = format!("it-{id}.resume");
    let exchange = format!("it-{id}");
    let mut cfg = configs::load(None).unwrap();
    topology(
        &mut cfg,
        &id,
        QueueConfigs {
            name: queue.clone(),
            bindings: vec!["user.#".into()],
            delivery_limit: 5,
            declare: true,
            ..Default::default()
        },
    );

    let handler = Counting::new(false);
    let registry = HandlerRegistry::new().register(&queue, handler.clone());
    let manager = Manager::new(&cfg, &registry).unwrap();
    let handle = manager.start(&CancellationToken::new());

    handle.wait_ready(&deadline(Duration::from_secs(10))).await.unwrap();
    assert_eq!(handle.cycles(), 1);

    let before: Vec<Vec<u8>> = (0..5).map(|i| format!("{{\"n\":{i}}}").into_bytes()).collect();
    publish(&cfg, &exchange, "user.created", &before).await;
    assert!(wait_until(Duration::from_secs(10), || handler.calls() == 5).await);

    // the broker cancels the consumer, which ends the cycle
    delete_queue(&cfg, &queue).await;
    assert!(wait_until(Duration::from_secs(20), || handle.cycles() >= 2).await);
    assert!(handle.is_ready());
    handle.wait_ready(&CancellationToken::new()).await.unwrap();

    let after: Vec<Vec<u8>> = (5..10).map(|i| format!("{{\"n\":{i}}}").into_bytes()).collect();
    publish(&cfg, &exchange, "user.created", &after).await;

    assert!(wait_until(Duration::from_secs(10), || handler.calls() == 10).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handler.calls(), 10);
    assert_eq!(message_count(&cfg, &queue).await, 0);
    assert_eq!(handle.cycles(), 2);

    handle.shutdown(&deadline(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ"]
async fn readiness_and_shutdown_are_stable() {
    let id = Uuid::new_v4().to_string();
    let queue = format!("it-{id}.ready");
    let mut cfg = configs::load(None).unwrap();
    topology(
        &mut cfg,
        &id,
        QueueConfigs {
            name: queue.clone(),
            declare: true,
            ..Default::default()
        },
    );

    let registry = HandlerRegistry::new().register(&queue, Counting::new(false));
    let manager = Manager::new(&cfg, &registry).unwrap();
    let handle = manager.start(&CancellationToken::new());

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .wait_ready(&deadline(Duration::from_secs(10)))
                    .await
            })
        })
        .collect();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
    assert!(manager.is_ready());

    assert_eq!(handle.shutdown(&deadline(Duration::from_secs(5))).await, Ok(()));
    assert_eq!(handle.shutdown(&deadline(Duration::from_secs(5))).await, Ok(()));
}
