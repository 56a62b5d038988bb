//! Discovery-driven cascading
//!
//! Follows a discovery feed and mounts every announced endpoint into the
//! local namespace through the cascading engine in `common`.

pub mod config;
pub mod discovery;
pub mod listener;
pub mod observability;

pub use config::{Config, ConfigError};
pub use discovery::{
    DiscoveryError, DiscoveryFeed, MemoryDiscovery, ServiceEvent, ServiceEventKind,
    ServiceListener, ServiceReference, ServiceUrl,
};
pub use listener::{DiscoveryListener, ListenerOptions};
