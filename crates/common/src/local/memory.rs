use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{LifecycleNotification, LocalRegistry, ObjectProxy, RegistryError};
use crate::name::{NamePattern, ObjectName};
use crate::notify::Broadcaster;

/// In-memory local registry
///
/// Cheap to clone; clones share the same namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    objects: Arc<RwLock<BTreeMap<ObjectName, ObjectProxy>>>,
    lifecycle: Arc<Broadcaster<LifecycleNotification>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every published lifecycle notification
    pub fn subscribe(&self) -> flume::Receiver<LifecycleNotification> {
        self.lifecycle.subscribe()
    }

    pub fn names(&self, pattern: Option<&NamePattern>) -> Vec<ObjectName> {
        self.objects
            .read()
            .keys()
            .filter(|name| pattern.map_or(true, |p| p.matches(name)))
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &ObjectName) -> Option<ObjectProxy> {
        self.objects.read().get(name).cloned()
    }

    pub fn contains(&self, name: &ObjectName) -> bool {
        self.objects.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl LocalRegistry for MemoryRegistry {
    async fn register_object(
        &self,
        local: ObjectName,
        proxy: ObjectProxy,
    ) -> Result<(), RegistryError> {
        let mut objects = self.objects.write();
        if objects.contains_key(&local) {
            return Err(RegistryError::NameCollision(local));
        }
        objects.insert(local, proxy);
        Ok(())
    }

    async fn unregister_object(&self, local: &ObjectName) -> Result<bool, RegistryError> {
        Ok(self.objects.write().remove(local).is_some())
    }

    async fn names_under(&self, prefix: &str) -> Result<Vec<ObjectName>, RegistryError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|name| name.is_under(prefix))
            .cloned()
            .collect())
    }

    async fn publish_lifecycle_notification(&self, notification: LifecycleNotification) {
        tracing::debug!(
            prefix = %notification.prefix,
            kind = %notification.kind,
            "publishing lifecycle notification"
        );
        self.lifecycle.emit(notification);
    }
}
