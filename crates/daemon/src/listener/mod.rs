//! Discovery listener adapter
//!
//! Subscribes to a discovery feed and turns arrivals and withdrawals into
//! mount and unmount calls on the cascading service. The feed's delivery
//! thread only queues work; mounts run on per-reference lanes.

mod lanes;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::cascade::{CascadingService, MountHandle, MountRequest};
use common::name::NamePattern;
use common::path::DEFAULT_TARGET_PATH;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::discovery::{
    service_filter, DiscoveryError, DiscoveryFeed, ServiceEvent, ServiceListener,
    ServiceReference,
};
use lanes::{Job, JobHandler, Lanes};

/// How discovered endpoints are mounted
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Target path template; `None` mounts at the root
    pub target_path: Option<String>,
    pub source_pattern: Option<NamePattern>,
    /// Merged into every endpoint descriptor
    pub connection_options: BTreeMap<String, String>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            target_path: Some(DEFAULT_TARGET_PATH.to_string()),
            source_pattern: None,
            connection_options: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct EventDispatch {
    service: CascadingService,
    options: ListenerOptions,
    /// reference id -> mount
    records: DashMap<Uuid, MountHandle>,
    lanes: Lanes,
}

/// What the feed holds on to
#[derive(Debug)]
struct FeedListener {
    dispatch: Arc<EventDispatch>,
}

impl ServiceListener for FeedListener {
    fn service_changed(&self, event: ServiceEvent) {
        tracing::debug!(kind = ?event.kind, reference = %event.reference, "discovery event");
        self.dispatch
            .lanes
            .dispatch(Job::from(event), self.dispatch.clone());
    }
}

#[async_trait]
impl JobHandler for EventDispatch {
    async fn handle(&self, job: Job) {
        match job {
            Job::Mount(reference) => self.arrived(reference).await,
            Job::Refresh(reference) => {
                // connection parameters are fixed for the lifetime of a mount;
                // an address change arrives as a withdrawal plus a new arrival
                // TODO: confirm feeds never change a reference's URL in place;
                // if they can, this should remount
                tracing::debug!(reference = %reference, "ignoring service update");
            }
            Job::Unmount(reference) => self.withdrawn(reference).await,
        }
    }
}

impl EventDispatch {
    async fn arrived(&self, reference: ServiceReference) {
        let id = reference.id();
        if let Some(handle) = self.records.get(&id) {
            tracing::debug!(reference = %reference, mount = %*handle, "reference already mounted");
            return;
        }

        let url = reference.url();
        let mut request = MountRequest::new(url.endpoint(&self.options.connection_options));
        if let Some(pattern) = &self.options.source_pattern {
            request = request.with_pattern(pattern.clone());
        }
        if let Some(template) = &self.options.target_path {
            request = request.with_target_path(template.clone());
        }

        tracing::info!(host = %url.host(), port = url.port(), "mounting discovered endpoint");
        match self.service.mount(request).await {
            Ok(handle) => {
                self.records.insert(id, handle);
            }
            Err(e) => {
                // retried only if the feed announces the reference again
                tracing::warn!(
                    host = %url.host(),
                    port = url.port(),
                    "failed to mount discovered endpoint: {}",
                    e
                );
            }
        }
    }

    async fn withdrawn(&self, reference: ServiceReference) {
        let Some((_, handle)) = self.records.remove(&reference.id()) else {
            tracing::warn!(reference = %reference, "no cascading registration for withdrawn reference");
            return;
        };

        let url = reference.url();
        tracing::info!(host = %url.host(), port = url.port(), mount = %handle, "unmounting withdrawn endpoint");
        if let Err(e) = self.service.unmount(handle).await {
            tracing::warn!(reference = %reference, mount = %handle, "unable to unmount: {}", e);
        }
    }
}

/// Bridges a discovery feed to a cascading service
#[derive(Debug)]
pub struct DiscoveryListener {
    feed: Arc<dyn DiscoveryFeed>,
    listener: Arc<dyn ServiceListener>,
    dispatch: Arc<EventDispatch>,
    /// Filters currently subscribed on the feed
    filters: Mutex<Vec<String>>,
}

impl DiscoveryListener {
    /// Must be called from within a tokio runtime; lanes run on it
    pub fn new(
        feed: Arc<dyn DiscoveryFeed>,
        service: CascadingService,
        options: ListenerOptions,
    ) -> Result<Self, DiscoveryError> {
        let runtime = Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
        let dispatch = Arc::new(EventDispatch {
            service,
            options,
            records: DashMap::new(),
            lanes: Lanes::new(runtime),
        });
        let listener: Arc<dyn ServiceListener> = Arc::new(FeedListener {
            dispatch: dispatch.clone(),
        });
        Ok(Self {
            feed,
            listener,
            dispatch,
            filters: Mutex::new(Vec::new()),
        })
    }

    /// Mount every reference matching `filter`
    pub fn listen_for(&self, filter: &str) -> Result<(), DiscoveryError> {
        tracing::info!(%filter, "listening for services");
        self.feed.subscribe(filter, self.listener.clone())?;
        self.filters.lock().push(filter.to_string());
        Ok(())
    }

    /// Mount every reference of an abstract service type
    pub fn listen_for_service(&self, service_type: &str) -> Result<(), DiscoveryError> {
        self.listen_for(&service_filter(service_type))
    }

    /// Stop following `filter`; existing mounts stay in place
    pub fn remove_query(&self, filter: &str) -> Result<(), DiscoveryError> {
        tracing::info!(%filter, "no longer listening for services");
        self.feed.unsubscribe(&self.listener, filter)?;
        let mut filters = self.filters.lock();
        if let Some(position) = filters.iter().position(|f| f == filter) {
            filters.remove(position);
        }
        Ok(())
    }

    pub fn remove_service_query(&self, service_type: &str) -> Result<(), DiscoveryError> {
        self.remove_query(&service_filter(service_type))
    }

    /// Mount created for a discovery reference, if any
    pub fn mount_for(&self, reference_id: Uuid) -> Option<MountHandle> {
        self.dispatch.records.get(&reference_id).map(|h| *h)
    }

    pub fn mounted(&self) -> Vec<(Uuid, MountHandle)> {
        self.dispatch
            .records
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Wait for all queued discovery work to finish
    pub async fn drain(&self) {
        self.dispatch.lanes.drain().await
    }

    /// Leave the feed and finish queued work
    ///
    /// Mounts made so far stay in place; [`CascadingService::shutdown`]
    /// removes them.
    pub async fn shutdown(&self) {
        self.unsubscribe_all();
        self.drain().await;
        tracing::info!(mounts = self.dispatch.records.len(), "discovery listener shut down");
    }

    fn unsubscribe_all(&self) {
        let filters = std::mem::take(&mut *self.filters.lock());
        for filter in filters {
            if let Err(e) = self.feed.unsubscribe(&self.listener, &filter) {
                tracing::warn!(%filter, "failed to leave discovery feed: {}", e);
            }
        }
    }

    pub fn service(&self) -> &CascadingService {
        &self.dispatch.service
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.dispatch.options
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
