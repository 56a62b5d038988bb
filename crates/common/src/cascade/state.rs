use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::name::ObjectName;
use crate::remote::ConnectivityEvent;

/// Opaque identifier returned by a successful mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountHandle(Uuid);

impl MountHandle {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MountHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a cascading agent
///
/// `Inactive -> Connecting -> Active <-> Failed -> Stopped`. Any state may
/// move to `Stopped`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Inactive,
    Connecting,
    Active,
    Failed,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Inactive => "inactive",
            AgentState::Connecting => "connecting",
            AgentState::Active => "active",
            AgentState::Failed => "failed",
            AgentState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Stopped)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (*self, next),
            (Inactive, Connecting)
                | (Connecting, Active)
                | (Active, Failed)
                | (Failed, Active)
                | (Inactive | Connecting | Active | Failed, Stopped)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events an agent forwards to its local listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The agent's connection changed; `state` is the agent state after handling it
    ConnectivityChanged {
        event: ConnectivityEvent,
        state: AgentState,
    },
    ObjectAdded {
        local_name: ObjectName,
        remote_name: ObjectName,
    },
    ObjectRemoved {
        local_name: ObjectName,
    },
}
