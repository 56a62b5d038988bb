//! Discovery feed contract
//!
//! A discovery feed announces remote endpoints as [`ServiceReference`]s and
//! notifies subscribed [`ServiceListener`]s when references matching their
//! filter arrive, change or are withdrawn. Events for one reference are
//! delivered in order; events for different references may interleave and
//! may be delivered from any thread.

mod filter;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use common::remote::EndpointDescriptor;
use uuid::Uuid;

pub use filter::{Filter, MAX_FILTER_DEPTH};
pub use memory::MemoryDiscovery;

/// Attribute carrying a reference's abstract service type
pub const SERVICE_TYPE: &str = "service-type";

const SERVICE_PREFIX: &str = "service:";

/// Filter selecting every reference of one abstract service type
pub fn service_filter(service_type: &str) -> String {
    format!("({}={})", SERVICE_TYPE, service_type)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid filter `{filter}`: {reason}")]
    InvalidSyntax { filter: String, reason: String },
    #[error("invalid service url `{url}`: {reason}")]
    InvalidServiceUrl { url: String, reason: String },
    #[error("no subscription for filter `{0}`")]
    UnknownSubscription(String),
    #[error("no tokio runtime available to run discovery work")]
    NoRuntime,
}

/// `service:<abstract>:<concrete>://<host>:<port><path>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUrl {
    raw: String,
    abstract_type: String,
    concrete_type: String,
    host: String,
    port: u16,
    path: String,
}

impl ServiceUrl {
    pub fn parse(raw: &str) -> Result<Self, DiscoveryError> {
        let invalid = |reason: &str| DiscoveryError::InvalidServiceUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let rest = raw
            .strip_prefix(SERVICE_PREFIX)
            .ok_or_else(|| invalid("missing `service:` prefix"))?;
        let (service_type, address) = rest
            .split_once("://")
            .ok_or_else(|| invalid("missing `://` address separator"))?;
        let (abstract_type, concrete_type) = service_type
            .split_once(':')
            .ok_or_else(|| invalid("service type needs an abstract and a concrete part"))?;
        if abstract_type.is_empty() || concrete_type.is_empty() {
            return Err(invalid("empty service type"));
        }

        let parsed = url::Url::parse(&format!("cascade://{}", address))
            .map_err(|e| invalid(&e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = parsed.port().ok_or_else(|| invalid("missing port"))?;

        Ok(Self {
            raw: raw.to_string(),
            abstract_type: abstract_type.to_string(),
            concrete_type: concrete_type.to_string(),
            host: host.to_string(),
            port,
            path: parsed.path().to_string(),
        })
    }

    /* Getters */

    pub fn abstract_type(&self) -> &str {
        &self.abstract_type
    }

    pub fn concrete_type(&self) -> &str {
        &self.concrete_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Connection protocol for the endpoint behind this url
    ///
    /// `service:jmx:rmi://..` connects over `jmx:rmi`; for any other abstract
    /// type (`service:billing:jmx:rmi://..`) the concrete type is the protocol.
    pub fn protocol(&self) -> String {
        if self.abstract_type == "jmx" {
            format!("jmx:{}", self.concrete_type)
        } else {
            self.concrete_type.clone()
        }
    }

    /// Endpoint descriptor carrying the given connection options
    pub fn endpoint(&self, options: &BTreeMap<String, String>) -> EndpointDescriptor {
        EndpointDescriptor::new(self.protocol(), &self.host, self.port)
            .with_path(&self.path)
            .with_options(options)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ServiceUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One registration in the discovery feed
///
/// Identity is the feed-assigned id; two references are equal iff their ids are.
#[derive(Debug, Clone)]
pub struct ServiceReference {
    id: Uuid,
    url: ServiceUrl,
    attributes: BTreeMap<String, String>,
}

impl ServiceReference {
    pub fn new(url: ServiceUrl, attributes: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            attributes,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub(crate) fn set_attributes(&mut self, attributes: BTreeMap<String, String>) {
        self.attributes = attributes;
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventKind {
    Arrived,
    Updated,
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub reference: ServiceReference,
}

impl ServiceEvent {
    pub fn new(kind: ServiceEventKind, reference: ServiceReference) -> Self {
        Self { kind, reference }
    }
}

/// Receives discovery events; called from the feed's delivery thread
pub trait ServiceListener: Send + Sync + fmt::Debug + 'static {
    fn service_changed(&self, event: ServiceEvent);
}

pub trait DiscoveryFeed: Send + Sync + fmt::Debug + 'static {
    /// Deliver events for references matching `filter` to `listener`
    ///
    /// References already registered and matching are announced as arrivals.
    fn subscribe(
        &self,
        filter: &str,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), DiscoveryError>;

    fn unsubscribe(
        &self,
        listener: &Arc<dyn ServiceListener>,
        filter: &str,
    ) -> Result<(), DiscoveryError>;
}
