// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{parse_payload, present};
use crate::{
    delivery::Delivery,
    directory::{DirectoryError, InstanceDirectory, KeyPair, PassphraseUpdate},
    errors::AmqpError,
    handler::Handler,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Payload published when a user changes their password elsewhere.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangeMessage {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub iterations: i64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

impl PasswordChangeMessage {
    /// Checks the required fields and builds the directory update.
    ///
    /// The key pair is only carried when both halves are present.
    pub fn into_update(self) -> Result<(String, PassphraseUpdate), AmqpError> {
        if self.identifier.is_empty() {
            return Err(AmqpError::HandlerError("missing identifier".to_owned()));
        }

        if self.hash.is_empty() {
            return Err(AmqpError::HandlerError("missing passphrase hash".to_owned()));
        }

        let iterations = u32::try_from(self.iterations)
            .ok()
            .filter(|iterations| *iterations > 0)
            .ok_or_else(|| {
                AmqpError::HandlerError(format!("invalid iterations `{}`", self.iterations))
            })?;

        let key_pair = match (present(&self.public_key), present(&self.private_key)) {
            (Some(public_key), Some(private_key)) => Some(KeyPair {
                public_key,
                private_key,
            }),
            (None, None) => None,
            _ => {
                debug!(identifier = self.identifier, "ignoring incomplete key pair");
                None
            }
        };

        let update = PassphraseUpdate {
            hash: self.hash,
            iterations,
            key: present(&self.key),
            key_pair,
        };

        Ok((self.identifier, update))
    }
}

/// Applies password changes to the matching instance.
pub struct PasswordChangeHandler {
    directory: Arc<dyn InstanceDirectory>,
}

impl PasswordChangeHandler {
    /// # Parameters
    /// * `directory` - Where instances are looked up and their passphrase replaced
    pub fn new(directory: Arc<dyn InstanceDirectory>) -> Self {
        PasswordChangeHandler { directory }
    }
}

#[async_trait]
impl Handler for PasswordChangeHandler {
    async fn handle(&self, _ctx: &CancellationToken, delivery: &Delivery) -> Result<(), AmqpError> {
        let msg: PasswordChangeMessage = parse_payload(&delivery.body)?;
        let (identifier, update) = msg.into_update()?;

        let instance = self
            .directory
            .lookup(&identifier)
            .await
            .map_err(directory_error)?;

        self.directory
            .force_update_passphrase(&instance, update)
            .await
            .map_err(directory_error)?;

        info!(domain = instance.domain, "passphrase updated");
        Ok(())
    }
}

fn directory_error(err: DirectoryError) -> AmqpError {
    AmqpError::HandlerError(err.to_string())
}
