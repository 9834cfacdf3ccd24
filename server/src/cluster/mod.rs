//! Cluster coordination: command routing, inter-node transport, discovery
//! and admission.

pub mod admission;
pub mod api;
pub mod coordinator;
pub mod discovery;
pub mod peers;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;
use crate::raft::ApplyResult;

pub use admission::Admission;
pub use coordinator::{Coordinator, Routed};
pub use discovery::{DiscoveryService, PeerDecision, PeerObserver};
pub use peers::PeerRegistry;
pub use transport::{ClusterTransport, HttpTransport};

/// Role of this node as reported by the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Follower,
    Candidate,
    Learner,
    Shutdown,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Leader => "leader",
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Learner => "learner",
            NodeRole::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: String,
    pub address: String,
    pub is_voter: bool,
}

impl ClusterMember {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            is_voter: true,
        }
    }
}

/// The operations the coordination core needs from the consensus engine.
/// Membership and the log stay owned by the engine; callers only go through
/// these methods.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    fn state(&self) -> NodeRole;

    /// Current leader, with the HTTP address it serves on.
    fn leader(&self) -> Option<ClusterMember>;

    /// Append `entry` and wait until it is committed and applied.
    async fn apply(&self, entry: Vec<u8>, timeout: Duration) -> Result<ApplyResult, ConsensusError>;

    /// Admit a node as a voting member. Leader only.
    async fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> Result<(), ConsensusError>;

    async fn configuration(&self) -> Result<Vec<ClusterMember>, ConsensusError>;

    /// Initialize a brand new cluster. Succeeds quietly if the cluster was
    /// already initialized.
    async fn bootstrap(&self, members: Vec<ClusterMember>) -> Result<(), ConsensusError>;
}
