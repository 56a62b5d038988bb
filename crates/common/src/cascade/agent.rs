use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{AgentEvent, AgentState, CascadeError, MountHandle};
use crate::local::{
    LifecycleKind, LifecycleNotification, LocalRegistry, ObjectProxy, RegistryError,
};
use crate::name::{NamePattern, ObjectMetadata, ObjectName, ObjectQuery, RemoteObject};
use crate::notify::Broadcaster;
use crate::remote::{
    Connection, ConnectionError, ConnectionFactory, ConnectivityEvent, EndpointDescriptor,
    RemoteObjectEvent,
};

/// Everything an agent needs to know about its mount, fixed at creation
#[derive(Debug, Clone)]
pub(crate) struct AgentConfig {
    pub endpoint: EndpointDescriptor,
    pub pattern: Option<NamePattern>,
    pub query: Option<Arc<dyn ObjectQuery>>,
    /// Already translated prefix
    pub target_path: String,
    pub delegate: ObjectName,
    pub connect_timeout: Duration,
    pub enumerate_timeout: Duration,
    /// When false, any object collision during start aborts the mount
    pub allow_collisions: bool,
}

#[derive(Debug)]
struct MountedObject {
    local_name: ObjectName,
    metadata: ObjectMetadata,
}

#[derive(Debug, Default)]
struct AgentInner {
    connection: Option<Arc<dyn Connection>>,
    /// remote name -> what this agent registered for it
    mounted: BTreeMap<ObjectName, MountedObject>,
    supervisor: Option<JoinHandle<()>>,
}

/// Owns one endpoint's connection and its mounted subtree
///
/// Agents are created and started by the
/// [`CascadingService`](super::CascadingService). State transitions, local
/// registrations and connection ownership are all serialized by a single
/// async lock, so a stop can never race a remount into double deregistration.
#[derive(Debug)]
pub struct CascadingAgent {
    handle: MountHandle,
    config: AgentConfig,
    factory: Arc<dyn ConnectionFactory>,
    local: Arc<dyn LocalRegistry>,
    inner: Mutex<AgentInner>,
    state_tx: watch::Sender<AgentState>,
    events: Broadcaster<AgentEvent>,
}

impl CascadingAgent {
    pub(crate) fn new(
        handle: MountHandle,
        config: AgentConfig,
        factory: Arc<dyn ConnectionFactory>,
        local: Arc<dyn LocalRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AgentState::Inactive);
        Self {
            handle,
            config,
            factory,
            local,
            inner: Mutex::new(AgentInner::default()),
            state_tx,
            events: Broadcaster::new(),
        }
    }

    /* Getters */

    pub fn handle(&self) -> MountHandle {
        self.handle
    }

    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == AgentState::Active
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.config.endpoint
    }

    pub fn target_path(&self) -> &str {
        &self.config.target_path
    }

    pub fn pattern(&self) -> Option<&NamePattern> {
        self.config.pattern.as_ref()
    }

    pub fn description(&self) -> String {
        let target = if self.config.target_path.is_empty() {
            "<root>"
        } else {
            &self.config.target_path
        };
        format!("{} mounted at {}", self.config.endpoint, target)
    }

    /// Local names of every object currently mounted by this agent
    pub async fn mounted_objects(&self) -> Vec<ObjectName> {
        self.inner
            .lock()
            .await
            .mounted
            .values()
            .map(|m| m.local_name.clone())
            .collect()
    }

    pub async fn mounted_count(&self) -> usize {
        self.inner.lock().await.mounted.len()
    }

    /// Receive the events this agent forwards
    pub fn subscribe(&self) -> flume::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Connect, mount the filtered remote namespace and start supervising
    ///
    /// On error nothing stays registered and the agent ends up `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<(), CascadeError> {
        {
            let _inner = self.inner.lock().await;
            let state = self.state();
            if !self.transition(AgentState::Connecting) {
                return Err(CascadeError::InvalidState {
                    handle: self.handle,
                    state,
                });
            }
        }

        // the lock is not held while connecting so that stop() can get in
        let connected = self.connect().await;

        let mut inner = self.inner.lock().await;
        let connection = match connected {
            Ok(connection) => connection,
            Err(e) => {
                self.transition(AgentState::Stopped);
                return Err(e.into());
            }
        };
        if self.state() == AgentState::Stopped {
            drop(inner);
            tracing::debug!(mount = %self.handle, "discarding connection, agent stopped while connecting");
            connection.close().await;
            return Err(CascadeError::Stopped(self.handle));
        }

        // subscribe before enumerating so nothing falls between the two
        let connectivity = connection.subscribe_connectivity();
        let objects = connection.subscribe_objects();
        inner.connection = Some(connection.clone());

        if let Err(e) = self.establish(&mut inner).await {
            self.unmount_all(&mut inner).await;
            inner.connection = None;
            self.transition(AgentState::Stopped);
            drop(inner);
            connection.close().await;
            return Err(e);
        }

        self.transition(AgentState::Active);
        inner.supervisor = Some(self.spawn_supervisor(connectivity, objects));
        self.publish_lifecycle(LifecycleKind::Added).await;
        tracing::info!(
            mount = %self.handle,
            endpoint = %self.config.endpoint,
            prefix = %self.config.target_path,
            objects = inner.mounted.len(),
            "cascading agent active"
        );
        drop(inner);

        self.events.emit(AgentEvent::ConnectivityChanged {
            event: ConnectivityEvent::Opened,
            state: AgentState::Active,
        });
        Ok(())
    }

    /// Unmount everything, close the connection and stop supervising
    ///
    /// Returns `false` if the agent was already stopped.
    pub async fn stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let previous = self.state();
        if !self.transition(AgentState::Stopped) {
            return false;
        }
        if matches!(previous, AgentState::Inactive | AgentState::Connecting) {
            // a pending start() sees the state and discards its connection
            return true;
        }

        let removed = self.unmount_all(&mut inner).await;
        let connection = inner.connection.take();
        let supervisor = inner.supervisor.take();
        self.publish_lifecycle(LifecycleKind::Removed).await;
        drop(inner);

        if let Some(connection) = connection {
            connection.close().await;
        }
        self.events.emit(AgentEvent::ConnectivityChanged {
            event: ConnectivityEvent::Closed,
            state: AgentState::Stopped,
        });
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                tracing::warn!(mount = %self.handle, "agent supervisor ended abnormally: {}", e);
            }
        }

        tracing::info!(
            mount = %self.handle,
            endpoint = %self.config.endpoint,
            removed,
            "cascading agent stopped"
        );
        true
    }

    fn transition(&self, next: AgentState) -> bool {
        let current = self.state();
        if !current.can_transition(next) {
            return false;
        }
        tracing::debug!(mount = %self.handle, from = %current, to = %next, "agent state change");
        self.state_tx.send_replace(next);
        true
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        let endpoint = &self.config.endpoint;
        let timeout = self.config.connect_timeout;
        tracing::debug!(mount = %self.handle, %endpoint, "connecting");
        match tokio::time::timeout(timeout, self.factory.connect(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                endpoint: endpoint.address(),
                timeout,
            }),
        }
    }

    async fn establish(&self, inner: &mut AgentInner) -> Result<(), CascadeError> {
        let prefix = &self.config.target_path;
        if !prefix.is_empty() {
            let occupied = self.local.names_under(prefix).await?;
            if let Some(existing) = occupied.first() {
                return Err(CascadeError::NameCollision {
                    prefix: prefix.clone(),
                    existing: existing.to_string(),
                });
            }
        }
        self.mount_all(inner, !self.config.allow_collisions).await?;
        Ok(())
    }

    async fn enumerate(&self, inner: &AgentInner) -> Result<Vec<RemoteObject>, CascadeError> {
        let connection = inner
            .connection
            .clone()
            .ok_or(CascadeError::Stopped(self.handle))?;
        let timeout = self.config.enumerate_timeout;
        let listing = connection.enumerate_objects(
            self.config.pattern.as_ref(),
            self.config.query.as_deref(),
        );
        match tokio::time::timeout(timeout, listing).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout {
                endpoint: self.config.endpoint.address(),
                timeout,
            }
            .into()),
        }
    }

    /// Mount every eligible remote object
    ///
    /// With `strict` the first object that cannot be registered fails the
    /// whole call; otherwise it is skipped.
    async fn mount_all(&self, inner: &mut AgentInner, strict: bool) -> Result<usize, CascadeError> {
        let objects = self.enumerate(inner).await?;
        let mut mounted = 0;
        for object in objects {
            match self.mount_object(inner, object).await {
                Ok(true) => mounted += 1,
                Ok(false) => {}
                Err(e) if strict => return Err(e.into()),
                Err(_) => {}
            }
        }
        Ok(mounted)
    }

    /// Register one remote object locally, or refresh it if its metadata changed
    ///
    /// Returns whether a new local name was registered.
    async fn mount_object(
        &self,
        inner: &mut AgentInner,
        object: RemoteObject,
    ) -> Result<bool, RegistryError> {
        if let Some(existing) = inner.mounted.get(&object.name) {
            if existing.metadata != object.metadata {
                self.refresh_object(inner, object).await;
            }
            return Ok(false);
        }
        let prefix = &self.config.target_path;
        if object.name.is_under(prefix) {
            tracing::warn!(
                mount = %self.handle,
                name = %object.name,
                "remote object already lives under the target path, skipping"
            );
            return Ok(false);
        }

        let local_name = object.name.with_prefix(prefix);
        let proxy = self.proxy(&object);
        match self.local.register_object(local_name.clone(), proxy).await {
            Ok(()) => {
                tracing::debug!(mount = %self.handle, local = %local_name, "mounted object");
                inner.mounted.insert(
                    object.name.clone(),
                    MountedObject {
                        local_name: local_name.clone(),
                        metadata: object.metadata,
                    },
                );
                self.events.emit(AgentEvent::ObjectAdded {
                    local_name,
                    remote_name: object.name,
                });
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(mount = %self.handle, local = %local_name, "skipping object: {}", e);
                Err(e)
            }
        }
    }

    fn proxy(&self, object: &RemoteObject) -> ObjectProxy {
        ObjectProxy {
            remote_name: object.name.clone(),
            endpoint: self.config.endpoint.address(),
            metadata: object.metadata.clone(),
        }
    }

    /// Replace the proxy of an already mounted object under the same local name
    async fn refresh_object(&self, inner: &mut AgentInner, object: RemoteObject) {
        let Some(mounted) = inner.mounted.get_mut(&object.name) else {
            return;
        };
        let local_name = mounted.local_name.clone();
        if let Err(e) = self.local.unregister_object(&local_name).await {
            tracing::warn!(mount = %self.handle, local = %local_name, "failed to unregister stale object: {}", e);
        }
        match self.local.register_object(local_name.clone(), self.proxy(&object)).await {
            Ok(()) => {
                tracing::debug!(mount = %self.handle, local = %local_name, "refreshed object metadata");
                mounted.metadata = object.metadata;
            }
            Err(e) => {
                tracing::warn!(mount = %self.handle, local = %local_name, "lost object while refreshing: {}", e);
                inner.mounted.remove(&object.name);
                self.events.emit(AgentEvent::ObjectRemoved { local_name });
            }
        }
    }

    async fn unmount_object(&self, inner: &mut AgentInner, remote_name: &ObjectName) -> bool {
        let Some(MountedObject { local_name, .. }) = inner.mounted.remove(remote_name) else {
            return false;
        };
        if let Err(e) = self.local.unregister_object(&local_name).await {
            tracing::warn!(mount = %self.handle, local = %local_name, "failed to unregister object: {}", e);
        }
        tracing::debug!(mount = %self.handle, local = %local_name, "unmounted object");
        self.events.emit(AgentEvent::ObjectRemoved { local_name });
        true
    }

    /// Best-effort removal of everything this agent registered
    async fn unmount_all(&self, inner: &mut AgentInner) -> usize {
        let remote_names: Vec<ObjectName> = inner.mounted.keys().cloned().collect();
        let mut removed = 0;
        for remote_name in remote_names {
            if self.unmount_object(inner, &remote_name).await {
                removed += 1;
            }
        }
        removed
    }

    /// Bring the mounted set back in line with the remote side
    async fn resync(&self, inner: &mut AgentInner) -> Result<(), CascadeError> {
        let objects = self.enumerate(inner).await?;
        let present: BTreeSet<&ObjectName> = objects.iter().map(|o| &o.name).collect();
        let gone: Vec<ObjectName> = inner
            .mounted
            .keys()
            .filter(|name| !present.contains(name))
            .cloned()
            .collect();
        for name in &gone {
            self.unmount_object(inner, name).await;
        }
        for object in objects {
            // failures are logged and skipped
            let _ = self.mount_object(inner, object).await;
        }
        Ok(())
    }

    fn eligible(&self, object: &RemoteObject) -> bool {
        self.config
            .pattern
            .as_ref()
            .map_or(true, |p| p.matches(&object.name))
            && self
                .config
                .query
                .as_ref()
                .map_or(true, |q| q.matches(&object.name, &object.metadata))
    }

    async fn publish_lifecycle(&self, kind: LifecycleKind) {
        self.local
            .publish_lifecycle_notification(LifecycleNotification {
                source: self.config.delegate.clone(),
                prefix: self.config.target_path.clone(),
                kind,
            })
            .await;
    }

    fn spawn_supervisor(
        self: &Arc<Self>,
        connectivity: flume::Receiver<ConnectivityEvent>,
        objects: flume::Receiver<RemoteObjectEvent>,
    ) -> JoinHandle<()> {
        let agent: Weak<Self> = Arc::downgrade(self);
        let mut state_rx = self.state_tx.subscribe();
        let handle = self.handle;

        tokio::spawn(async move {
            let mut connectivity_open = true;
            let mut objects_open = true;
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() || state_rx.borrow_and_update().is_terminal() {
                            break;
                        }
                    }
                    event = connectivity.recv_async(), if connectivity_open => match event {
                        Ok(event) => {
                            let Some(agent) = agent.upgrade() else { break };
                            agent.handle_connectivity(event).await;
                        }
                        Err(_) => connectivity_open = false,
                    },
                    event = objects.recv_async(), if objects_open => match event {
                        Ok(event) => {
                            let Some(agent) = agent.upgrade() else { break };
                            agent.handle_object_event(event).await;
                        }
                        Err(_) => objects_open = false,
                    },
                }
            }
            tracing::debug!(mount = %handle, "agent supervisor exiting");
        })
    }

    async fn handle_connectivity(&self, event: ConnectivityEvent) {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        match (event, state) {
            (ConnectivityEvent::Failed | ConnectivityEvent::Closed, AgentState::Active) => {
                let removed = self.unmount_all(&mut inner).await;
                self.transition(AgentState::Failed);
                tracing::warn!(
                    mount = %self.handle,
                    endpoint = %self.config.endpoint,
                    removed,
                    "connection lost, objects unmounted until it comes back"
                );
            }
            (ConnectivityEvent::Opened, AgentState::Failed) => {
                match self.mount_all(&mut inner, false).await {
                    Ok(mounted) => {
                        self.transition(AgentState::Active);
                        tracing::info!(
                            mount = %self.handle,
                            endpoint = %self.config.endpoint,
                            mounted,
                            "connection restored, objects remounted"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(mount = %self.handle, "remount after reconnect failed: {}", e);
                    }
                }
            }
            (ConnectivityEvent::NotificationsLost, AgentState::Active) => {
                tracing::info!(mount = %self.handle, "notifications lost, resynchronising");
                if let Err(e) = self.resync(&mut inner).await {
                    tracing::warn!(mount = %self.handle, "resynchronisation failed: {}", e);
                }
            }
            (event, state) => {
                tracing::debug!(mount = %self.handle, %event, %state, "ignoring connectivity event");
            }
        }
        let state = self.state();
        drop(inner);

        if !state.is_terminal() {
            self.events
                .emit(AgentEvent::ConnectivityChanged { event, state });
        }
    }

    async fn handle_object_event(&self, event: RemoteObjectEvent) {
        let mut inner = self.inner.lock().await;
        if self.state() != AgentState::Active {
            return;
        }
        match event {
            RemoteObjectEvent::Registered(object) => {
                if self.eligible(&object) {
                    let _ = self.mount_object(&mut inner, object).await;
                } else {
                    // re-registered with metadata the query no longer accepts
                    self.unmount_object(&mut inner, &object.name).await;
                }
            }
            RemoteObjectEvent::Unregistered(name) => {
                self.unmount_object(&mut inner, &name).await;
            }
        }
    }
}
