//! Cascading agents and the service that owns them

mod agent;
mod error;
mod service;
mod state;

pub use agent::CascadingAgent;
pub use error::CascadeError;
pub use service::{
    CascadeSettings, CascadingService, MountInfo, MountRequest, DEFAULT_DELEGATE_NAME,
};
pub use state::{AgentEvent, AgentState, MountHandle};
