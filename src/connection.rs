// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! The `ConnectionManager` owns the single broker connection shared by every
//! queue runner. It dials with exponential backoff and jitter, hands out the
//! cached connection while it is still alive, and exposes a one-shot
//! notification fired when the broker drops the connection.

use crate::{
    configs::{RabbitMQConfigs, TlsConfigs},
    errors::AmqpError,
};
use lapin::{tcp::{OwnedIdentity, OwnedTLSConfig}, types::LongString, Connection, ConnectionProperties};
use rand::Rng;
use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound of the exponential part of the backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const REPLY_SUCCESS: u16 = 200;

/// Receives at most one value when the connection closes: the broker error, or
/// `None` when the connection went away without one.
pub type CloseNotification = oneshot::Receiver<Option<AmqpError>>;

#[derive(Default)]
struct ConnectionState {
    conn: Option<Arc<Connection>>,
    notify: Option<CloseNotification>,
}

pub struct ConnectionManager {
    uri: String,
    name: String,
    tls: Option<OwnedTLSConfig>,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    /// Creates a manager for the broker described by `cfg`.
    ///
    /// TLS material is loaded and validated here, so a broken TLS setup fails at
    /// startup instead of on every reconnect.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials, connection name and TLS settings
    ///
    /// # Returns
    /// A manager with no open connection, or `AmqpError::ConfigError` for unusable TLS settings
    pub fn new(cfg: &RabbitMQConfigs) -> Result<Self, AmqpError> {
        let tls = match &cfg.tls {
            Some(tls) => Some(load_tls(tls, &cfg.host)?),
            None => None,
        };

        Ok(ConnectionManager {
            uri: cfg.uri(),
            name: cfg.connection_name.clone(),
            tls,
            state: Mutex::new(ConnectionState::default()),
        })
    }

    /// Returns a live connection, dialing up to `max_retries` times if needed.
    ///
    /// The cached connection is reused when a throwaway channel can still be
    /// opened on it; otherwise it is closed and replaced. Attempt `n > 0` first
    /// sleeps `backoff(n - 1)`. Cancelling `ctx` aborts both the sleep and the
    /// dial with `AmqpError::Cancelled`.
    pub async fn connect(
        &self,
        ctx: &CancellationToken,
        max_retries: u32,
    ) -> Result<Arc<Connection>, AmqpError> {
        let mut state = self.state.lock().await;

        if let Some(conn) = state.conn.clone() {
            if probe(&conn).await {
                return Ok(conn);
            }

            warn!("cached amqp connection is dead, reconnecting");
            close_connection(&conn).await;
            *state = ConnectionState::default();
        }

        let attempts = max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before redial");

                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(AmqpError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let dialed = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(AmqpError::Cancelled),
                dialed = self.dial() => dialed,
            };

            match dialed {
                Ok((conn, notify)) => {
                    info!(attempt, "amqp connected");
                    let conn = Arc::new(conn);
                    state.conn = Some(conn.clone());
                    state.notify = Some(notify);
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "failure to connect");
                    last_error = err.to_string();
                }
            }
        }

        error!(attempts, "giving up connecting to the broker");
        Err(AmqpError::ConnectionError(format!(
            "after {attempts} attempts: {last_error}"
        )))
    }

    /// Takes the close notification of the current connection.
    ///
    /// Meant to be read once per connection. Without a connection, or when the
    /// notification was already taken, the returned receiver resolves at once.
    pub async fn monitor_connection(&self) -> CloseNotification {
        let mut state = self.state.lock().await;

        match state.notify.take() {
            Some(notify) => notify,
            None => {
                let (_, rx) = oneshot::channel();
                rx
            }
        }
    }

    /// Closes the connection, if any. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        let conn = state.conn.take();
        state.notify = None;
        drop(state);

        let Some(conn) = conn else {
            return Ok(());
        };

        if !conn.status().connected() {
            return Ok(());
        }

        match conn.close(REPLY_SUCCESS, "closing").await {
            Ok(()) => {
                debug!("amqp connection closed");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }

    async fn dial(&self) -> Result<(Connection, CloseNotification), AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.name.clone()));

        let connected = match &self.tls {
            Some(tls) => {
                let tls = OwnedTLSConfig {
                    identity: tls.identity.as_ref().map(|identity| OwnedIdentity {
                        der: identity.der.clone(),
                        password: identity.password.clone(),
                    }),
                    cert_chain: tls.cert_chain.clone(),
                };
                Connection::connect_with_config(&self.uri, options, tls).await
            }
            None => Connection::connect(&self.uri, options).await,
        };

        let conn = connected.map_err(|err| AmqpError::ConnectionError(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let tx = StdMutex::new(Some(tx));
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            let sender = match tx.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(sender) = sender {
                let _ = sender.send(Some(AmqpError::ConnectionLost(err.to_string())));
            }
        });

        Ok((conn, rx))
    }
}

/// Delay before redial number `attempt + 1`.
///
/// `min(2^attempt s, 30 s)` plus a uniform jitter of up to a quarter of that.
pub fn backoff(attempt: u32) -> Duration {
    let base = base_delay(attempt);
    let jitter_ms = (base.as_millis() / 4) as u64;
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);

    base + Duration::from_millis(jitter)
}

fn base_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

async fn probe(conn: &Connection) -> bool {
    if !conn.status().connected() {
        return false;
    }

    match conn.create_channel().await {
        Ok(channel) => {
            let _ = channel.close(REPLY_SUCCESS, "probe").await;
            true
        }
        Err(err) => {
            debug!(error = err.to_string(), "liveness probe failed");
            false
        }
    }
}

async fn close_connection(conn: &Connection) {
    if conn.status().connected() {
        if let Err(err) = conn.close(REPLY_SUCCESS, "stale").await {
            debug!(error = err.to_string(), "failure to close stale connection");
        }
    }
}

fn load_tls(cfg: &TlsConfigs, host: &str) -> Result<OwnedTLSConfig, AmqpError> {
    if cfg.insecure_skip_validation {
        return Err(AmqpError::ConfigError(
            "tls certificate validation cannot be disabled".to_owned(),
        ));
    }

    if let Some(server_name) = cfg.server_name.as_deref().filter(|name| !name.is_empty()) {
        if server_name != host {
            return Err(AmqpError::ConfigError(format!(
                "tls server name `{server_name}` must match host `{host}`"
            )));
        }
    }

    let cert_chain = match cfg.root_ca_file.as_deref().filter(|path| !path.is_empty()) {
        Some(path) => {
            let pem = std::fs::read_to_string(path).map_err(|err| {
                AmqpError::ConfigError(format!("failure to read root ca `{path}`: {err}"))
            })?;

            if !pem.contains("-----BEGIN CERTIFICATE-----") {
                return Err(AmqpError::ConfigError(format!(
                    "root ca `{path}` holds no PEM certificate"
                )));
            }

            Some(pem)
        }
        None => None,
    };

    Ok(OwnedTLSConfig {
        cert_chain,
        ..Default::default()
    })
}
