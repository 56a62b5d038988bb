use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    DiscoveryError, DiscoveryFeed, Filter, ServiceEvent, ServiceEventKind, ServiceListener,
    ServiceReference, ServiceUrl, SERVICE_TYPE,
};

/// In-process discovery feed
///
/// Delivers events synchronously on the calling thread, after releasing its
/// own lock, so listeners may call back into the feed.
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscovery {
    state: Arc<Mutex<FeedState>>,
}

#[derive(Debug, Default)]
struct FeedState {
    services: BTreeMap<Uuid, ServiceReference>,
    subscriptions: Vec<Subscription>,
}

#[derive(Debug)]
struct Subscription {
    source: String,
    filter: Filter,
    listener: Arc<dyn ServiceListener>,
}

type Delivery = Vec<(Arc<dyn ServiceListener>, ServiceEvent)>;

fn same_listener(a: &Arc<dyn ServiceListener>, b: &Arc<dyn ServiceListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn deliver(delivery: Delivery) {
    for (listener, event) in delivery {
        listener.service_changed(event);
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; its abstract type is recorded as `service-type`
    /// unless the attributes already say otherwise
    pub fn register(
        &self,
        url: &str,
        mut attributes: BTreeMap<String, String>,
    ) -> Result<ServiceReference, DiscoveryError> {
        let url = ServiceUrl::parse(url)?;
        attributes
            .entry(SERVICE_TYPE.to_string())
            .or_insert_with(|| url.abstract_type().to_string());
        let reference = ServiceReference::new(url, attributes);

        let delivery = {
            let mut state = self.state.lock();
            state.services.insert(reference.id(), reference.clone());
            state
                .subscriptions
                .iter()
                .filter(|s| s.filter.matches(reference.attributes()))
                .map(|s| {
                    (
                        s.listener.clone(),
                        ServiceEvent::new(ServiceEventKind::Arrived, reference.clone()),
                    )
                })
                .collect::<Delivery>()
        };
        tracing::debug!(reference = %reference, listeners = delivery.len(), "service registered");
        deliver(delivery);
        Ok(reference)
    }

    /// Replace a service's attributes
    ///
    /// Subscribers that matched before and after see an update; those whose
    /// filter starts or stops matching see an arrival or a withdrawal.
    pub fn modify(
        &self,
        id: Uuid,
        attributes: BTreeMap<String, String>,
    ) -> Option<ServiceReference> {
        let (reference, delivery) = {
            let mut state = self.state.lock();
            let FeedState {
                services,
                subscriptions,
            } = &mut *state;
            let reference = services.get_mut(&id)?;
            let before = reference.attributes().clone();
            reference.set_attributes(attributes);
            let reference = reference.clone();

            let delivery = subscriptions
                .iter()
                .filter_map(|s| {
                    let kind = match (
                        s.filter.matches(&before),
                        s.filter.matches(reference.attributes()),
                    ) {
                        (true, true) => ServiceEventKind::Updated,
                        (false, true) => ServiceEventKind::Arrived,
                        (true, false) => ServiceEventKind::Withdrawn,
                        (false, false) => return None,
                    };
                    Some((s.listener.clone(), ServiceEvent::new(kind, reference.clone())))
                })
                .collect::<Delivery>();
            (reference, delivery)
        };
        deliver(delivery);
        Some(reference)
    }

    pub fn unregister(&self, id: Uuid) -> Option<ServiceReference> {
        let (reference, delivery) = {
            let mut state = self.state.lock();
            let reference = state.services.remove(&id)?;
            let delivery = state
                .subscriptions
                .iter()
                .filter(|s| s.filter.matches(reference.attributes()))
                .map(|s| {
                    (
                        s.listener.clone(),
                        ServiceEvent::new(ServiceEventKind::Withdrawn, reference.clone()),
                    )
                })
                .collect::<Delivery>();
            (reference, delivery)
        };
        tracing::debug!(reference = %reference, "service unregistered");
        deliver(delivery);
        Some(reference)
    }

    pub fn services(&self) -> Vec<ServiceReference> {
        self.state.lock().services.values().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

impl DiscoveryFeed for MemoryDiscovery {
    fn subscribe(
        &self,
        filter: &str,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), DiscoveryError> {
        let parsed = Filter::parse(filter)?;
        let delivery = {
            let mut state = self.state.lock();
            let delivery = state
                .services
                .values()
                .filter(|r| parsed.matches(r.attributes()))
                .map(|r| {
                    (
                        listener.clone(),
                        ServiceEvent::new(ServiceEventKind::Arrived, r.clone()),
                    )
                })
                .collect::<Delivery>();
            state.subscriptions.push(Subscription {
                source: filter.to_string(),
                filter: parsed,
                listener,
            });
            delivery
        };
        deliver(delivery);
        Ok(())
    }

    fn unsubscribe(
        &self,
        listener: &Arc<dyn ServiceListener>,
        filter: &str,
    ) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        let position = state
            .subscriptions
            .iter()
            .position(|s| s.source == filter && same_listener(&s.listener, listener))
            .ok_or_else(|| DiscoveryError::UnknownSubscription(filter.to_string()))?;
        state.subscriptions.remove(position);
        Ok(())
    }
}
