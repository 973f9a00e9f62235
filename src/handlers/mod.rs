// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Business handlers for the account lifecycle queues.

mod password;
mod user;

pub use password::{PasswordChangeHandler, PasswordChangeMessage};
pub use user::{UserCreatedHandler, UserCreatedMessage};

use crate::errors::AmqpError;
use serde::de::DeserializeOwned;

/// Decodes a JSON payload, mapping failures to a handler error.
pub(crate) fn parse_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, AmqpError> {
    serde_json::from_slice(body)
        .map_err(|err| AmqpError::HandlerError(format!("invalid payload: {err}")))
}

/// Treats empty strings as absent.
pub(crate) fn present(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}
