// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{parse_payload, present};
use crate::{
    delivery::Delivery, directory::InstanceDirectory, errors::AmqpError, handler::Handler,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Payload published when a user account is created.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedMessage {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Confirms that a newly created user has an instance in the directory.
///
/// Fails while the instance is unknown, so the message is retried until the
/// directory catches up or the delivery limit dead-letters it.
pub struct UserCreatedHandler {
    directory: Arc<dyn InstanceDirectory>,
}

impl UserCreatedHandler {
    pub fn new(directory: Arc<dyn InstanceDirectory>) -> Self {
        UserCreatedHandler { directory }
    }
}

#[async_trait]
impl Handler for UserCreatedHandler {
    async fn handle(&self, _ctx: &CancellationToken, delivery: &Delivery) -> Result<(), AmqpError> {
        let msg: UserCreatedMessage = parse_payload(&delivery.body)?;

        if msg.identifier.is_empty() {
            return Err(AmqpError::HandlerError("missing identifier".to_owned()));
        }

        let instance = self
            .directory
            .lookup(&msg.identifier)
            .await
            .map_err(|err| AmqpError::HandlerError(err.to_string()))?;

        info!(
            domain = instance.domain,
            email = present(&msg.email).unwrap_or_default(),
            "user created"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryError, Instance, MockInstanceDirectory};

    #[tokio::test]
    async fn known_instance_is_acknowledged() {
        let mut directory = MockInstanceDirectory::new();
        directory
            .expect_lookup()
            .withf(|identifier| identifier.to_string() == "u-7")
            .times(1)
            .returning(|identifier| {
                Ok(Instance {
                    identifier: identifier.to_owned(),
                    domain: "bob.example.net".into(),
                })
            });
        directory.expect_force_update_passphrase().never();

        let handler = UserCreatedHandler::new(Arc::new(directory));
        let delivery = Delivery::new(r#"{"identifier":"u-7","email":"bob@example.net"}"#);

        assert_eq!(handler.handle(&CancellationToken::new(), &delivery).await, Ok(()));
    }

    #[tokio::test]
    async fn unknown_instance_is_retried() {
        let mut directory = MockInstanceDirectory::new();
        directory
            .expect_lookup()
            .returning(|_| Err(DirectoryError::Unavailable("timeout".into())));

        let handler = UserCreatedHandler::new(Arc::new(directory));
        let delivery = Delivery::new(r#"{"identifier":"u-7"}"#);

        assert!(handler.handle(&CancellationToken::new(), &delivery).await.is_err());
    }

    #[tokio::test]
    async fn missing_identifier_is_rejected() {
        let handler = UserCreatedHandler::new(Arc::new(MockInstanceDirectory::new()));
        let delivery = Delivery::new(r#"{"email":"bob@example.net"}"#);

        assert_eq!(
            handler.handle(&CancellationToken::new(), &delivery).await,
            Err(AmqpError::HandlerError("missing identifier".into()))
        );
    }
}
