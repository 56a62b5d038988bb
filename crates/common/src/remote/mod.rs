//! Remote connection contract
//!
//! A [`ConnectionFactory`] turns an [`EndpointDescriptor`] into a live
//! [`Connection`] to the endpoint's object registry. Connections report their
//! own connectivity changes, and keep reporting after a failure: the same
//! connection object is reused when the link comes back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::name::{NamePattern, ObjectName, ObjectQuery, RemoteObject};

mod memory;

pub use memory::{MemoryEndpoint, MemoryTransport};

/// Address and connection parameters of a remote endpoint
///
/// Immutable once an agent has been created from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    options: BTreeMap<String, String>,
}

impl EndpointDescriptor {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: String::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: &BTreeMap<String, String>) -> Self {
        self.options
            .extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /* Getters */

    pub fn protocol(&self) -> &str {
        &self.protocol
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

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Identity of the endpoint: protocol, host, port and path
    ///
    /// Connection options are deliberately not part of the address.
    pub fn address(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.path
        )
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {endpoint} refused: {reason}")]
    Refused { endpoint: String, reason: String },
    #[error("connection to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("connection to {0} is closed")]
    Closed(String),
    #[error("connection to {endpoint} is unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },
}

/// Connectivity notifications emitted by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityEvent {
    Opened,
    Closed,
    Failed,
    NotificationsLost,
}

impl ConnectivityEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityEvent::Opened => "opened",
            ConnectivityEvent::Closed => "closed",
            ConnectivityEvent::Failed => "failed",
            ConnectivityEvent::NotificationsLost => "notifications_lost",
        }
    }
}

impl fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of objects on the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteObjectEvent {
    Registered(RemoteObject),
    Unregistered(ObjectName),
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug + 'static {
    /// Open a connection to the endpoint's object registry
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn Connection>, ConnectionError>;
}

#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Enumerate remote objects matching `pattern` and `query`
    ///
    /// `None` for either filter means "no restriction".
    async fn enumerate_objects(
        &self,
        pattern: Option<&NamePattern>,
        query: Option<&dyn ObjectQuery>,
    ) -> Result<Vec<RemoteObject>, ConnectionError>;

    /// Subscribe to connectivity notifications for this connection
    fn subscribe_connectivity(&self) -> flume::Receiver<ConnectivityEvent>;

    /// Subscribe to object registration changes on the remote side
    fn subscribe_objects(&self) -> flume::Receiver<RemoteObjectEvent>;

    /// Release the connection; later calls are no-ops
    async fn close(&self);
}
