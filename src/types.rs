//! Identifiers and small shared value types

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used by the core's own bus identities
pub const SYSTEM_NAMESPACE: &str = "system";

/// Identity of an external agent, scoped by namespace (the agent's swarm).
///
/// The core only references agents; their lifecycle lives in the
/// [`AgentDirectory`](crate::agent::AgentDirectory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    /// Swarm or subsystem the agent belongs to
    pub namespace: String,
    /// Name within the namespace
    pub id: String,
}

impl AgentId {
    /// Create an id from its parts
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Identity for a core subsystem talking on the bus
    pub fn system(name: impl Into<String>) -> Self {
        Self::new(SYSTEM_NAMESPACE, name)
    }

    /// Whether this is a core subsystem identity
    pub fn is_system(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a bus message
    MessageId
);
uuid_id!(
    /// Unique identifier for a submitted task
    TaskId
);
uuid_id!(
    /// Unique identifier for a consensus proposal
    ProposalId
);
uuid_id!(
    /// Unique identifier for a topic subscription
    SubscriptionId
);

/// Priority class shared by messages and tasks, ordered `low < normal < high < critical`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}
