// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Contract of the instance directory the handlers call into.
//!
//! The directory itself lives outside this crate; handlers only see this trait.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// An instance as known by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub identifier: String,
    pub domain: String,
}

/// Public/private key pair stored alongside a passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// New passphrase material for an instance.
///
/// `key` and `key_pair` are applied only when present; absent values leave the
/// stored ones untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseUpdate {
    pub hash: String,
    pub iterations: u32,
    pub key: Option<String>,
    pub key_pair: Option<KeyPair>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("instance `{0}` not found")]
    NotFound(String),

    #[error("instance directory unavailable `{0}`")]
    Unavailable(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Finds the instance owning a stable identifier.
    async fn lookup(&self, identifier: &str) -> Result<Instance, DirectoryError>;

    /// Replaces the passphrase of an instance without checking the old one.
    async fn force_update_passphrase(
        &self,
        instance: &Instance,
        update: PassphraseUpdate,
    ) -> Result<(), DirectoryError>;
}
