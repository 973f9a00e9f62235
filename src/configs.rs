// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! Declarative description of the broker connection and of the exchange/queue
//! topology the consumers own. Values are deserialized with `serde` and can be
//! loaded from a file merged with `RABBITMQ__*` environment variables.

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Prefetch applied to queues that leave it unset or zero.
pub const DEFAULT_PREFETCH: u16 = 32;

/// Connection attempts made per reconnect cycle.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Broker connection and topology settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMQConfigs {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_user")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub tls: Option<TlsConfigs>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfigs>,
}

/// Optional TLS material for `amqps` connections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfigs {
    #[serde(default)]
    pub root_ca_file: Option<String>,
    #[serde(default)]
    pub insecure_skip_validation: bool,
    #[serde(default)]
    pub server_name: Option<String>,
}

/// One exchange and the queues bound to it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeConfigs {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub declare: bool,
    #[serde(default)]
    pub dlx_name: String,
    #[serde(default)]
    pub dlq_name: String,
    #[serde(default)]
    pub queues: Vec<QueueConfigs>,
}

/// One consumed queue.
///
/// `dlx_name`/`dlq_name` override the owning exchange's defaults when non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfigs {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<String>,
    #[serde(default)]
    pub prefetch: u16,
    #[serde(default)]
    pub delivery_limit: i32,
    #[serde(default)]
    pub declare: bool,
    #[serde(default)]
    pub declare_dlx: bool,
    #[serde(default)]
    pub declare_dlq: bool,
    #[serde(default)]
    pub dlx_name: String,
    #[serde(default)]
    pub dlq_name: String,
    #[serde(default)]
    pub dl_routing_key: String,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_connection_name() -> String {
    "rabbitmq-consumers".to_owned()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_user(),
            vhost: default_vhost(),
            connection_name: default_connection_name(),
            max_retries: default_max_retries(),
            tls: None,
            exchanges: vec![],
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these settings.
    ///
    /// The scheme switches to `amqps` when a TLS section is present.
    pub fn uri(&self) -> String {
        let scheme = if self.tls.is_some() { "amqps" } else { "amqp" };

        format!(
            "{}://{}:{}@{}:{}/{}",
            scheme,
            encode(&self.user),
            encode(&self.password),
            self.host,
            self.port,
            encode(&self.vhost)
        )
    }
}

/// Loads the configuration from an optional file and the environment.
///
/// Environment variables use the `RABBITMQ` prefix and `__` as the nesting
/// separator, e.g. `RABBITMQ__HOST` or `RABBITMQ__TLS__SERVER_NAME`.
pub fn load(path: Option<&str>) -> Result<RabbitMQConfigs, AmqpError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path).required(false));
    }

    let cfg = builder
        .add_source(Environment::with_prefix("RABBITMQ").separator("__"))
        .build()?;

    Ok(cfg.try_deserialize()?)
}

/// Percent-encodes everything outside the URI unreserved set.
fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02x}", byte)),
        }
    }
    out
}
