//! Namespace cascading engine
//!
//! Mounts filtered, renamed views of remote object namespaces into a single
//! local namespace and keeps them in step with the remote side.
//!
//! # Architecture
//!
//! - [`name`]: object names, name patterns and object queries
//! - [`path`]: target path templates and prefix translation
//! - [`local`]: the local registry contract and an in-memory registry
//! - [`remote`]: the remote connection contract and an in-memory transport
//! - [`cascade`]: cascading agents and the cascading service that owns them

pub mod cascade;
pub mod local;
pub mod name;
pub mod notify;
pub mod path;
pub mod remote;

pub mod prelude {
    pub use crate::cascade::{
        AgentEvent, AgentState, CascadeError, CascadeSettings, CascadingAgent, CascadingService,
        MountHandle, MountInfo, MountRequest,
    };
    pub use crate::local::{
        LifecycleKind, LifecycleNotification, LocalRegistry, MemoryRegistry, ObjectProxy,
        RegistryError,
    };
    pub use crate::name::{
        AttributeQuery, NameError, NamePattern, ObjectMetadata, ObjectName, ObjectQuery,
        RemoteObject,
    };
    pub use crate::path::{translate, PathTemplateError, DEFAULT_TARGET_PATH};
    pub use crate::remote::{
        Connection, ConnectionError, ConnectionFactory, ConnectivityEvent, EndpointDescriptor,
        MemoryEndpoint, MemoryTransport, RemoteObjectEvent,
    };
}
