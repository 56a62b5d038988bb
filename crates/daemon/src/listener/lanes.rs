//! Per-reference dispatch lanes
//!
//! Each discovery reference gets its own lane: an unbounded flume channel
//! drained by one task. Jobs for a reference run strictly in order, lanes for
//! different references run concurrently, and a lane whose channel is empty
//! retires itself. Dispatch and retirement both happen under the lane table's
//! per-key lock, so a job can never be queued on a lane that is going away.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::discovery::{ServiceEvent, ServiceEventKind, ServiceReference};

/// Work queued on a reference's lane
#[derive(Debug, Clone)]
pub(crate) enum Job {
    /// The reference arrived; mount its endpoint
    Mount(ServiceReference),
    /// The reference's attributes changed
    Refresh(ServiceReference),
    /// The reference was withdrawn; unmount whatever it mounted
    Unmount(ServiceReference),
}

impl Job {
    pub fn reference(&self) -> &ServiceReference {
        match self {
            Job::Mount(r) | Job::Refresh(r) | Job::Unmount(r) => r,
        }
    }
}

impl From<ServiceEvent> for Job {
    fn from(event: ServiceEvent) -> Self {
        match event.kind {
            ServiceEventKind::Arrived => Job::Mount(event.reference),
            ServiceEventKind::Updated => Job::Refresh(event.reference),
            ServiceEventKind::Withdrawn => Job::Unmount(event.reference),
        }
    }
}

#[async_trait]
pub(crate) trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job);
}

#[derive(Debug)]
pub(crate) struct Lanes {
    lanes: Arc<DashMap<Uuid, flume::Sender<Job>>>,
    runtime: Handle,
    idle: Arc<Notify>,
}

impl Lanes {
    pub fn new(runtime: Handle) -> Self {
        Self {
            lanes: Arc::new(DashMap::new()),
            runtime,
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queue a job on its reference's lane, opening the lane if needed
    ///
    /// Never blocks on the job itself.
    pub fn dispatch(&self, job: Job, handler: Arc<dyn JobHandler>) {
        let id = job.reference().id();
        match self.lanes.entry(id) {
            Entry::Occupied(lane) => {
                // the receiver lives until the lane is removed under this same lock
                if lane.get().send(job).is_err() {
                    tracing::error!(reference = %id, "dispatch lane closed unexpectedly");
                }
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = flume::unbounded();
                let _ = tx.send(job);
                slot.insert(tx);
                self.spawn_lane(id, rx, handler);
            }
        }
    }

    fn spawn_lane(&self, id: Uuid, rx: flume::Receiver<Job>, handler: Arc<dyn JobHandler>) {
        let lanes = self.lanes.clone();
        let idle = self.idle.clone();
        self.runtime.spawn(async move {
            tracing::trace!(reference = %id, "lane opened");
            loop {
                match rx.try_recv() {
                    Ok(job) => handler.handle(job).await,
                    Err(_) => {
                        if lanes.remove_if(&id, |_, tx| tx.is_empty()).is_some() {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(reference = %id, "lane retired");
            idle.notify_waiters();
        });
    }

    pub fn active(&self) -> usize {
        self.lanes.len()
    }

    /// Wait until every lane has retired
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lanes.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
