use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::agent::{AgentConfig, CascadingAgent};
use super::{AgentEvent, AgentState, CascadeError, MountHandle};
use crate::local::LocalRegistry;
use crate::name::{NamePattern, ObjectName, ObjectQuery};
use crate::path;
use crate::remote::{ConnectionFactory, EndpointDescriptor};

/// Name lifecycle notifications are published under unless configured otherwise
pub const DEFAULT_DELEGATE_NAME: &str = "cascade:type=NamespaceDelegate";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CascadeSettings {
    /// Source of subtree lifecycle notifications
    pub delegate_name: ObjectName,
    pub connect_timeout: Duration,
    pub enumerate_timeout: Duration,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            delegate_name: ObjectName::parse(DEFAULT_DELEGATE_NAME)
                .unwrap_or_else(|_| unreachable!("default delegate name is valid")),
            connect_timeout: DEFAULT_TIMEOUT,
            enumerate_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// What to mount and where
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub endpoint: EndpointDescriptor,
    pub pattern: Option<NamePattern>,
    pub query: Option<Arc<dyn ObjectQuery>>,
    /// Target path template; `None` mounts at the root
    pub target_path: Option<String>,
    /// Skip objects whose local name is taken instead of failing the mount
    pub allow_collisions: bool,
}

impl MountRequest {
    pub fn new(endpoint: EndpointDescriptor) -> Self {
        Self {
            endpoint,
            pattern: None,
            query: None,
            target_path: None,
            allow_collisions: true,
        }
    }

    pub fn with_pattern(mut self, pattern: NamePattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_query(mut self, query: impl ObjectQuery + 'static) -> Self {
        self.query = Some(Arc::new(query));
        self
    }

    pub fn with_target_path(mut self, template: impl Into<String>) -> Self {
        self.target_path = Some(template.into());
        self
    }

    /// Fail the mount if any object collides with an existing local name
    pub fn strict(mut self) -> Self {
        self.allow_collisions = false;
        self
    }
}

/// Snapshot of one mount for operational inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub handle: MountHandle,
    pub endpoint: String,
    pub target_path: String,
    pub state: AgentState,
    pub object_count: usize,
}

#[derive(Debug)]
struct ServiceInner {
    factory: Arc<dyn ConnectionFactory>,
    local: Arc<dyn LocalRegistry>,
    settings: CascadeSettings,
    agents: DashMap<MountHandle, Arc<CascadingAgent>>,
    /// endpoint address -> mount, reserved before the agent connects
    endpoints: DashMap<String, MountHandle>,
    /// non-empty target path -> mount; one agent per prefix
    prefixes: DashMap<String, MountHandle>,
}

/// The authoritative table of live mounts
///
/// The only thing that creates or destroys cascading agents. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CascadingService {
    inner: Arc<ServiceInner>,
}

impl CascadingService {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        local: Arc<dyn LocalRegistry>,
        settings: CascadeSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                factory,
                local,
                settings,
                agents: DashMap::new(),
                endpoints: DashMap::new(),
                prefixes: DashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.inner.settings
    }

    /// Mount an endpoint's namespace
    ///
    /// All or nothing: on error no agent is left behind and nothing is
    /// registered locally. Each endpoint address and each non-empty target
    /// path belongs to at most one mount at a time.
    pub async fn mount(&self, request: MountRequest) -> Result<MountHandle, CascadeError> {
        let target_path = path::translate(request.target_path.as_deref(), &request.endpoint)?;
        let address = request.endpoint.address();
        let handle = MountHandle::generate();

        match self.inner.endpoints.entry(address.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(endpoint = %address, "endpoint already mounted");
                return Err(CascadeError::AlreadyMounted(address));
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
            }
        }
        if let Err(e) = self.reserve_prefix(&target_path, handle) {
            self.inner.endpoints.remove_if(&address, |_, h| *h == handle);
            return Err(e);
        }

        let settings = &self.inner.settings;
        let config = AgentConfig {
            endpoint: request.endpoint,
            pattern: request.pattern,
            query: request.query,
            target_path,
            delegate: settings.delegate_name.clone(),
            connect_timeout: settings.connect_timeout,
            enumerate_timeout: settings.enumerate_timeout,
            allow_collisions: request.allow_collisions,
        };
        let agent = Arc::new(CascadingAgent::new(
            handle,
            config,
            self.inner.factory.clone(),
            self.inner.local.clone(),
        ));
        // visible while connecting so shutdown() can reach it
        self.inner.agents.insert(handle, agent.clone());

        if let Err(e) = agent.start().await {
            self.inner.agents.remove(&handle);
            self.release(handle, &address, agent.target_path());
            tracing::warn!(endpoint = %address, "mount failed: {}", e);
            return Err(e);
        }

        tracing::info!(mount = %handle, "mounted {}", agent.description());
        Ok(handle)
    }

    /// Stop a mount and remove its subtree
    ///
    /// Unknown handles are reported as [`CascadeError::UnknownMount`], a soft
    /// error with no side effects.
    pub async fn unmount(&self, handle: MountHandle) -> Result<(), CascadeError> {
        let Some((_, agent)) = self.inner.agents.remove(&handle) else {
            tracing::warn!(mount = %handle, "unmount requested for unknown mount");
            return Err(CascadeError::UnknownMount(handle));
        };

        agent.stop().await;
        self.release(handle, &agent.endpoint().address(), agent.target_path());
        tracing::info!(mount = %handle, endpoint = %agent.endpoint(), "unmounted");
        Ok(())
    }

    /// Claim `prefix` for `handle`; root mounts claim nothing
    fn reserve_prefix(&self, prefix: &str, handle: MountHandle) -> Result<(), CascadeError> {
        if prefix.is_empty() {
            return Ok(());
        }
        match self.inner.prefixes.entry(prefix.to_string()) {
            Entry::Occupied(entry) => {
                tracing::debug!(%prefix, owner = %entry.get(), "target path already claimed");
                Err(CascadeError::NameCollision {
                    prefix: prefix.to_string(),
                    existing: format!("mount {}", entry.get()),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    fn release(&self, handle: MountHandle, address: &str, prefix: &str) {
        self.inner.endpoints.remove_if(address, |_, h| *h == handle);
        self.inner.prefixes.remove_if(prefix, |_, h| *h == handle);
    }

    pub fn list_mounts(&self) -> Vec<MountHandle> {
        let mut handles: Vec<MountHandle> = self.inner.agents.iter().map(|e| *e.key()).collect();
        handles.sort();
        handles
    }

    pub async fn mount_info(&self, handle: MountHandle) -> Option<MountInfo> {
        let agent = self.agent(handle)?;
        Some(MountInfo {
            handle,
            endpoint: agent.endpoint().address(),
            target_path: agent.target_path().to_string(),
            state: agent.state(),
            object_count: agent.mounted_count().await,
        })
    }

    /// Receive the events forwarded by one mount's agent
    pub fn subscribe(&self, handle: MountHandle) -> Option<flume::Receiver<AgentEvent>> {
        self.agent(handle).map(|agent| agent.subscribe())
    }

    pub fn agent(&self, handle: MountHandle) -> Option<Arc<CascadingAgent>> {
        self.inner.agents.get(&handle).map(|a| a.value().clone())
    }

    /// Unmount everything
    pub async fn shutdown(&self) {
        let handles = self.list_mounts();
        tracing::info!(mounts = handles.len(), "shutting down cascading service");
        for handle in handles {
            // a concurrent unmount may have got there first
            let _ = self.unmount(handle).await;
        }
    }
}
