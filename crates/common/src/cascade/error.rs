use crate::local::RegistryError;
use crate::path::PathTemplateError;
use crate::remote::ConnectionError;

use super::{AgentState, MountHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CascadeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("invalid target path: {0}")]
    InvalidPathTemplate(#[from] PathTemplateError),
    #[error("target path `{prefix}` is already occupied (e.g. by `{existing}`)")]
    NameCollision { prefix: String, existing: String },
    #[error("endpoint {0} is already mounted")]
    AlreadyMounted(String),
    #[error("unknown mount {0}")]
    UnknownMount(MountHandle),
    #[error("mount {0} was stopped")]
    Stopped(MountHandle),
    #[error("mount {handle} cannot do that while {state}")]
    InvalidState {
        handle: MountHandle,
        state: AgentState,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl CascadeError {
    /// Soft errors are reported as warnings rather than failures
    pub fn is_soft(&self) -> bool {
        matches!(self, CascadeError::UnknownMount(_))
    }

    /// Whether a later re-announcement of the endpoint may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CascadeError::Connection(_) | CascadeError::Stopped(_) | CascadeError::Registry(_)
        )
    }
}
