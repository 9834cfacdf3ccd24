use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::Event;

pub type NodeId = u64;

/// Membership entry for one node: its stable name and the HTTP address that
/// serves both raft RPC and the cluster endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberNode {
    pub name: String,
    pub addr: String,
}

impl MemberNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }

    pub fn id(&self) -> NodeId {
        member_id(&self.name)
    }
}

impl fmt::Display for MemberNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// Raft id for a member name. Stable across restarts and nodes.
pub fn member_id(name: &str) -> NodeId {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// A serialized [`Event`] as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCommand(pub Vec<u8>);

impl LogCommand {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// What applying one log entry produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyResult {
    /// The handler replied (with either `_ok` or `_fail`).
    Reply { event: Event },
    /// The entry could not be applied at all (undecodable or unknown method).
    Failed { error: String },
    /// Blank and membership entries.
    Ack,
}

impl ApplyResult {
    pub fn failed(error: impl Into<String>) -> Self {
        ApplyResult::Failed {
            error: error.into(),
        }
    }

    pub fn reply(&self) -> Option<&Event> {
        match self {
            ApplyResult::Reply { event } => Some(event),
            _ => None,
        }
    }
}

openraft::declare_raft_types!(
    /// Raft type configuration for the game cluster.
    pub TypeConfig:
        D = LogCommand,
        R = ApplyResult,
        NodeId = NodeId,
        Node = MemberNode,
        SnapshotData = Cursor<Vec<u8>>,
);

pub type GameRaft = openraft::Raft<TypeConfig>;
pub type RaftEntry = openraft::Entry<TypeConfig>;
pub type RaftLogId = openraft::LogId<NodeId>;
pub type RaftVote = openraft::Vote<NodeId>;
pub type RaftStoredMembership = openraft::StoredMembership<NodeId, MemberNode>;
pub type RaftSnapshotMeta = openraft::SnapshotMeta<NodeId, MemberNode>;
pub type RaftSnapshot = openraft::storage::Snapshot<TypeConfig>;
pub type RaftStorageError = openraft::StorageError<NodeId>;
pub type RaftMetrics = openraft::RaftMetrics<NodeId, MemberNode>;
