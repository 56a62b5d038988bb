//! In-process transport
//!
//! Simulates remote endpoints inside the current process. Each endpoint holds
//! its own object set and can be told to refuse connections, delay them, drop
//! and restore connectivity, or lose notifications.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{
    Connection, ConnectionError, ConnectionFactory, ConnectivityEvent, EndpointDescriptor,
    RemoteObjectEvent,
};
use crate::name::{NamePattern, ObjectMetadata, ObjectName, ObjectQuery, RemoteObject};
use crate::notify::Broadcaster;

/// Factory over a set of simulated endpoints, keyed by address
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    endpoints: Arc<Mutex<HashMap<String, Arc<MemoryEndpoint>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the remote side of an endpoint
    pub fn endpoint(&self, endpoint: &EndpointDescriptor) -> Arc<MemoryEndpoint> {
        self.endpoints
            .lock()
            .entry(endpoint.address())
            .or_insert_with(|| Arc::new(MemoryEndpoint::new(endpoint.address())))
            .clone()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryTransport {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        let remote = self.endpoint(endpoint);

        let delay = *remote.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !remote.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Refused {
                endpoint: remote.address.clone(),
                reason: "endpoint unreachable".to_string(),
            });
        }

        remote.connects.fetch_add(1, Ordering::SeqCst);
        remote.online.store(true, Ordering::SeqCst);
        tracing::debug!(endpoint = %remote.address, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            remote,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Remote side of a simulated endpoint
#[derive(Debug)]
pub struct MemoryEndpoint {
    address: String,
    objects: RwLock<BTreeMap<ObjectName, ObjectMetadata>>,
    reachable: AtomicBool,
    online: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    connectivity: Broadcaster<ConnectivityEvent>,
    object_events: Broadcaster<RemoteObjectEvent>,
}

impl MemoryEndpoint {
    fn new(address: String) -> Self {
        Self {
            address,
            objects: RwLock::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            online: AtomicBool::new(true),
            connect_delay: Mutex::new(None),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            connectivity: Broadcaster::new(),
            object_events: Broadcaster::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register an object on the remote side
    ///
    /// Connected agents are only told about it while the link is up.
    pub fn register(&self, name: ObjectName, metadata: ObjectMetadata) {
        self.objects.write().insert(name.clone(), metadata.clone());
        if self.is_online() {
            self.object_events
                .emit(RemoteObjectEvent::Registered(RemoteObject::new(name, metadata)));
        }
    }

    pub fn unregister(&self, name: &ObjectName) -> bool {
        let removed = self.objects.write().remove(name).is_some();
        if removed && self.is_online() {
            self.object_events
                .emit(RemoteObjectEvent::Unregistered(name.clone()));
        }
        removed
    }

    pub fn object_names(&self) -> Vec<ObjectName> {
        self.objects.read().keys().cloned().collect()
    }

    /// Whether new connection attempts succeed
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    /// Drop the link; open connections report `Failed`
    pub fn fail(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.connectivity.emit(ConnectivityEvent::Failed);
    }

    /// Close the link from the remote side; open connections report `Closed`
    pub fn close_link(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.connectivity.emit(ConnectivityEvent::Closed);
    }

    /// Bring the link back; open connections report `Opened`
    pub fn restore(&self) {
        self.online.store(true, Ordering::SeqCst);
        self.connectivity.emit(ConnectivityEvent::Opened);
    }

    /// Tell open connections that object notifications were dropped
    pub fn lose_notifications(&self) {
        self.connectivity.emit(ConnectivityEvent::NotificationsLost);
    }

    /// Change objects without telling anyone, as if the notifications were lost
    pub fn register_silently(&self, name: ObjectName, metadata: ObjectMetadata) {
        self.objects.write().insert(name, metadata);
    }

    pub fn unregister_silently(&self, name: &ObjectName) -> bool {
        self.objects.write().remove(name).is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MemoryConnection {
    remote: Arc<MemoryEndpoint>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn enumerate_objects(
        &self,
        pattern: Option<&NamePattern>,
        query: Option<&dyn ObjectQuery>,
    ) -> Result<Vec<RemoteObject>, ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed(self.remote.address.clone()));
        }
        if !self.remote.is_online() {
            return Err(ConnectionError::Unavailable {
                endpoint: self.remote.address.clone(),
                reason: "link is down".to_string(),
            });
        }

        let objects = self.remote.objects.read();
        Ok(objects
            .iter()
            .filter(|(name, _)| pattern.map_or(true, |p| p.matches(name)))
            .filter(|(name, meta)| query.map_or(true, |q| q.matches(name, meta)))
            .map(|(name, meta)| RemoteObject::new(name.clone(), meta.clone()))
            .collect())
    }

    fn subscribe_connectivity(&self) -> flume::Receiver<ConnectivityEvent> {
        self.remote.connectivity.subscribe()
    }

    fn subscribe_objects(&self) -> flume::Receiver<RemoteObjectEvent> {
        self.remote.object_events.subscribe()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.remote.closes.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(endpoint = %self.remote.address, "memory connection closed");
        }
    }
}
