// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Supervisor
//!
//! The `Manager` keeps every configured queue consumed across connection losses.
//! Each cycle of its background loop:
//!
//! 1. connects (with backoff, see [`ConnectionManager::connect`])
//! 2. declares the exchanges flagged for declaration, aborting the cycle on failure
//! 3. builds one [`QueueRunner`] per queue, skipping the ones that fail
//! 4. runs the runners and a connection watcher as one task group
//! 5. signals readiness, the first time only
//! 6. waits for the first task of the group to stop, cancels the others,
//!    closes runners and connection, and starts over
//!
//! A failed connect round is retried at once, since `connect` already backs
//! off between dials. Cycles that end shortly after connecting, such as a
//! rejected exchange declaration or a queue that cannot be consumed, are
//! spaced out by a [`CyclePacer`].
//!
//! The loop ends when the token given to [`Manager::start`] is cancelled or
//! [`Manager::shutdown`](Shutdowner::shutdown) is called.

use crate::{
    configs::RabbitMQConfigs,
    connection::{backoff, ConnectionManager},
    errors::AmqpError,
    exchange::ExchangeSpec,
    handler::HandlerRegistry,
    runner::QueueRunner,
    topology::{declare_exchange, TopologyBuilder},
};
use async_trait::async_trait;
use lapin::Connection;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Once,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

/// A cycle serving at least this long is considered healthy.
const STABLE_CYCLE: Duration = Duration::from_secs(30);

/// Graceful shutdown contract used by the hosting process.
#[async_trait]
pub trait Shutdowner: Send + Sync {
    /// Stops the component, waiting for it at most until `ctx` is cancelled.
    async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), AmqpError>;
}

/// Readiness latch: set at most once, observed by any number of waiters.
pub(crate) struct ReadySignal {
    once: Once,
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ReadySignal {
            once: Once::new(),
            tx,
        }
    }

    /// Sets the latch. Returns whether this call was the one that set it.
    pub(crate) fn fire(&self) -> bool {
        let mut fired = false;
        self.once.call_once(|| {
            self.tx.send_replace(true);
            fired = true;
        });
        fired
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self, ctx: &CancellationToken) -> Result<(), AmqpError> {
        let mut rx = self.tx.subscribe();

        tokio::select! {
            ready = rx.wait_for(|ready| *ready) => ready
                .map(|_| ())
                .map_err(|err| AmqpError::InternalError(err.to_string())),
            _ = ctx.cancelled() => Err(AmqpError::Cancelled),
        }
    }
}

struct Inner {
    connection: ConnectionManager,
    exchanges: Vec<ExchangeSpec>,
    max_retries: u32,
    ready: ReadySignal,
    cycles: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    done: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises the consumers of every configured queue.
///
/// Cloning is cheap; all clones drive the same background loop.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Builds a manager from configuration, resolving each queue's handler.
    ///
    /// Fails only on configuration errors such as unusable TLS material.
    ///
    /// # Parameters
    /// * `cfg` - Connection settings and the exchange/queue topology
    /// * `registry` - Handlers keyed by queue name
    ///
    /// # Returns
    /// A manager that is not started yet
    pub fn new(cfg: &RabbitMQConfigs, registry: &HandlerRegistry) -> Result<Self, AmqpError> {
        let connection = ConnectionManager::new(cfg)?;
        let exchanges = TopologyBuilder::new(registry).build(&cfg.exchanges);

        Ok(Manager::with_topology(connection, exchanges, cfg.max_retries))
    }

    /// Builds a manager from already resolved exchange specs.
    ///
    /// # Parameters
    /// * `connection` - The connection manager the loop dials through
    /// * `exchanges` - Exchanges with their queues and handlers
    /// * `max_retries` - Dial attempts per connect round
    pub fn with_topology(
        connection: ConnectionManager,
        exchanges: Vec<ExchangeSpec>,
        max_retries: u32,
    ) -> Self {
        Manager {
            inner: Arc::new(Inner {
                connection,
                exchanges,
                max_retries,
                ready: ReadySignal::new(),
                cycles: AtomicU64::new(0),
                cancel: Mutex::new(None),
                done: Mutex::new(None),
            }),
        }
    }

    /// Launches the reconnect loop in the background and returns immediately.
    ///
    /// The loop runs on a child of `ctx`. Starting an already started manager
    /// only returns another handle to it.
    pub fn start(&self, ctx: &CancellationToken) -> Manager {
        let mut cancel = lock(&self.inner.cancel);
        if cancel.is_some() {
            warn!("consumer manager already started");
            return self.clone();
        }

        let token = ctx.child_token();
        *cancel = Some(token.clone());
        drop(cancel);

        let handle = tokio::spawn(run(self.inner.clone(), token));
        *lock(&self.inner.done) = Some(handle);

        self.clone()
    }

    /// Waits until the topology is declared and the consumers are live, or
    /// until `ctx` is cancelled.
    pub async fn wait_ready(&self, ctx: &CancellationToken) -> Result<(), AmqpError> {
        self.inner.ready.wait(ctx).await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_set()
    }

    /// Number of cycles that reached the point of serving, reconnects included.
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.inner.exchanges
    }
}

#[async_trait]
impl Shutdowner for Manager {
    /// Cancels the loop, waits for it (bounded by `ctx`) and closes the
    /// connection. Safe to call any number of times.
    async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), AmqpError> {
        let token = lock(&self.inner.cancel).clone();
        if let Some(token) = token {
            token.cancel();
        }

        let handle = lock(&self.inner.done).take();
        let mut timed_out = false;

        if let Some(handle) = handle {
            tokio::select! {
                joined = handle => {
                    if let Err(err) = joined {
                        error!(error = err.to_string(), "consumer supervisor task failed");
                    }
                }
                _ = ctx.cancelled() => {
                    warn!("shutdown deadline reached before the consumers stopped");
                    timed_out = true;
                }
            }
        }

        self.inner.connection.close().await?;
        info!("consumer manager stopped");

        if timed_out {
            return Err(AmqpError::Cancelled);
        }

        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(inner: Arc<Inner>, ctx: CancellationToken) {
    let mut pacer = CyclePacer::new(STABLE_CYCLE);

    loop {
        if ctx.is_cancelled() {
            if let Err(err) = inner.connection.close().await {
                warn!(error = err.to_string(), "failure to close connection on exit");
            }
            info!("consumer loop stopped");
            return;
        }

        let conn = match inner.connection.connect(&ctx, inner.max_retries).await {
            Ok(conn) => conn,
            Err(AmqpError::Cancelled) => continue,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect, retrying");
                continue;
            }
        };

        let started = Instant::now();

        if let Err(err) = declare_exchanges(&conn, &inner.exchanges).await {
            error!(error = err.to_string(), "failure to declare exchanges, reconnecting");
            if let Err(err) = inner.connection.close().await {
                debug!(error = err.to_string(), "failure to close connection after declaration");
            }
            pause(&ctx, pacer.record(started.elapsed())).await;
            continue;
        }

        let mut runners = vec![];
        for exchange in &inner.exchanges {
            for queue in exchange.queues() {
                match QueueRunner::new(&conn, exchange.name(), queue).await {
                    Ok(runner) => runners.push(Arc::new(runner)),
                    Err(err) => error!(
                        error = err.to_string(),
                        exchange = exchange.name(),
                        queue = queue.name(),
                        "skipping queue for this cycle"
                    ),
                }
            }
        }
        drop(conn);

        let cycle = ctx.child_token();
        let mut tasks = JoinSet::new();

        for runner in &runners {
            let runner = runner.clone();
            let token = cycle.clone();
            tasks.spawn(async move { runner.run(token).await });
        }

        let closed = inner.connection.monitor_connection().await;
        let token = cycle.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                notice = closed => match notice {
                    Ok(Some(err)) => Err(err),
                    _ => Err(AmqpError::Cancelled),
                },
            }
        });

        let serving = inner.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        if inner.ready.fire() {
            info!(queues = runners.len(), "consumers ready");
        } else {
            info!(queues = runners.len(), cycle = serving, "consumers resumed");
        }

        if let Some(first) = tasks.join_next().await {
            log_task_exit(first);
        }

        cycle.cancel();
        while let Some(rest) = tasks.join_next().await {
            log_task_exit(rest);
        }

        for runner in &runners {
            let _ = runner.close().await;
        }

        if let Err(err) = inner.connection.close().await {
            debug!(error = err.to_string(), "failure to close connection after cycle");
        }

        debug!("consumer cycle ended");
        pause(&ctx, pacer.record(started.elapsed())).await;
    }
}

/// Spaces out cycles that keep failing shortly after connecting.
///
/// A cycle shorter than `stable_after` counts as a failure and yields
/// `backoff(n)` for the `n`-th failure in a row. A cycle that lasted longer
/// resets the count and yields no delay.
pub(crate) struct CyclePacer {
    failures: u32,
    stable_after: Duration,
}

impl CyclePacer {
    pub(crate) fn new(stable_after: Duration) -> Self {
        CyclePacer {
            failures: 0,
            stable_after,
        }
    }

    /// Records how long a cycle lasted and returns the delay before the next dial.
    pub(crate) fn record(&mut self, lasted: Duration) -> Option<Duration> {
        if lasted >= self.stable_after {
            self.failures = 0;
            return None;
        }

        let delay = backoff(self.failures);
        self.failures = self.failures.saturating_add(1);
        Some(delay)
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

async fn pause(ctx: &CancellationToken, delay: Option<Duration>) {
    let Some(delay) = delay else {
        return;
    };
    if ctx.is_cancelled() {
        return;
    }

    warn!(delay_ms = delay.as_millis() as u64, "cycle ended early, pausing before reconnect");
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn declare_exchanges(conn: &Connection, exchanges: &[ExchangeSpec]) -> Result<(), AmqpError> {
    for exchange in exchanges {
        if !exchange.declare {
            debug!(exchange = exchange.name(), "exchange not flagged for declaration");
            continue;
        }

        let channel = conn
            .create_channel()
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        let declared = declare_exchange(&channel, exchange).await;

        if channel.status().connected() {
            let _ = channel.close(REPLY_SUCCESS, "exchange declared").await;
        }

        declared?;
    }

    Ok(())
}

fn log_task_exit(exit: Result<Result<(), AmqpError>, tokio::task::JoinError>) {
    match exit {
        Ok(Ok(())) | Ok(Err(AmqpError::Cancelled)) => {}
        Ok(Err(err)) => warn!(error = err.to_string(), "consumer task stopped"),
        Err(err) => error!(error = err.to_string(), "consumer task crashed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_configs() -> RabbitMQConfigs {
        RabbitMQConfigs {
            host: "127.0.0.1".into(),
            port: 1,
            max_retries: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ready_signal_fires_once_for_every_waiter() {
        let signal = Arc::new(ReadySignal::new());
        let ctx = CancellationToken::new();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { signal.wait(&ctx).await })
            })
            .collect();

        assert!(!signal.is_set());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_set());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(()));
        }

        assert_eq!(signal.wait(&ctx).await, Ok(()));
    }

    #[tokio::test]
    async fn wait_ready_gives_up_when_ctx_is_cancelled() {
        let manager = Manager::new(&unreachable_configs(), &HandlerRegistry::new()).unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert_eq!(manager.wait_ready(&ctx).await, Err(AmqpError::Cancelled));
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let manager = Manager::new(&unreachable_configs(), &HandlerRegistry::new()).unwrap();
        let root = CancellationToken::new();
        let handle = manager.start(&root);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let deadline = CancellationToken::new();
        let timer = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            timer.cancel();
        });

        assert_eq!(handle.shutdown(&deadline).await, Ok(()));
        assert_eq!(handle.shutdown(&deadline).await, Ok(()));
        assert!(!root.is_cancelled());
    }

    #[test]
    fn pacer_backs_off_on_consecutive_short_cycles() {
        let mut pacer = CyclePacer::new(Duration::from_secs(30));

        let first = pacer.record(Duration::from_millis(10)).unwrap();
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1250));

        let second = pacer.record(Duration::ZERO).unwrap();
        assert!(second >= Duration::from_secs(2) && second <= Duration::from_millis(2500));

        let third = pacer.record(Duration::from_secs(29)).unwrap();
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_secs(5));
        assert_eq!(pacer.failures(), 3);
    }

    #[test]
    fn pacer_resets_after_a_stable_cycle() {
        let mut pacer = CyclePacer::new(Duration::from_secs(30));

        for _ in 0..10 {
            pacer.record(Duration::ZERO);
        }
        assert_eq!(pacer.failures(), 10);

        assert_eq!(pacer.record(Duration::from_secs(30)), None);
        assert_eq!(pacer.failures(), 0);

        let delay = pacer.record(Duration::ZERO).unwrap();
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn pacer_delay_is_capped() {
        let mut pacer = CyclePacer::new(Duration::from_secs(30));

        for _ in 0..100 {
            let delay = pacer.record(Duration::ZERO).unwrap();
            assert!(delay <= Duration::from_millis(37_500));
        }
    }

    #[tokio::test]
    async fn pause_returns_when_ctx_is_cancelled() {
        let ctx = CancellationToken::new();
        ctx.cancel();

        let started = Instant::now();
        pause(&ctx, Some(Duration::from_secs(60))).await;
        pause(&ctx, None).await;

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unreachable_broker_never_counts_a_cycle() {
        let manager = Manager::new(&unreachable_configs(), &HandlerRegistry::new()).unwrap();
        let handle = manager.start(&CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.cycles(), 0);
        assert!(!handle.is_ready());

        handle.shutdown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        let manager = Manager::new(&unreachable_configs(), &HandlerRegistry::new()).unwrap();

        assert_eq!(manager.shutdown(&CancellationToken::new()).await, Ok(()));
    }
}
