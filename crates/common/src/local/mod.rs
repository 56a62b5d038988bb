//! Local registry contract
//!
//! The local registry is the single namespace consumers query. Agents register
//! proxies to remote objects into it and announce whole subtrees through
//! lifecycle notifications.

mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::name::{ObjectMetadata, ObjectName};

pub use memory::MemoryRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("name `{0}` is already registered")]
    NameCollision(ObjectName),
    #[error("local registry unavailable: {0}")]
    Unavailable(String),
}

/// A local stand-in for an object living on a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProxy {
    /// Name of the object on the remote side
    pub remote_name: ObjectName,
    /// Address of the endpoint serving the object
    pub endpoint: String,
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Added,
    Removed,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleKind::Added => write!(f, "added"),
            LifecycleKind::Removed => write!(f, "removed"),
        }
    }
}

/// Announces that a namespace subtree appeared or disappeared as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleNotification {
    /// Object name the notification is published on behalf of
    pub source: ObjectName,
    /// Subtree prefix; empty for a root mount
    pub prefix: String,
    pub kind: LifecycleKind,
}

#[async_trait]
pub trait LocalRegistry: Send + Sync + fmt::Debug + 'static {
    /// Register a proxy under `local`
    ///
    /// Fails with [`RegistryError::NameCollision`] if the name is taken.
    async fn register_object(
        &self,
        local: ObjectName,
        proxy: ObjectProxy,
    ) -> Result<(), RegistryError>;

    /// Remove `local`; returns whether anything was removed
    async fn unregister_object(&self, local: &ObjectName) -> Result<bool, RegistryError>;

    /// Every name living under `prefix`
    async fn names_under(&self, prefix: &str) -> Result<Vec<ObjectName>, RegistryError>;

    async fn publish_lifecycle_notification(&self, notification: LifecycleNotification);
}
