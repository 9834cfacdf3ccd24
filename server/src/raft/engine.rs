use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{ChangeMembers, ServerState};
use tracing::{info, warn};

use super::types::{ApplyResult, GameRaft, LogCommand, MemberNode, NodeId, RaftMetrics};
use crate::cluster::{ClusterMember, ConsensusEngine, NodeRole};
use crate::error::ConsensusError;

/// [`ConsensusEngine`] backed by an openraft instance.
#[derive(Clone)]
pub struct OpenRaftEngine {
    node_id: NodeId,
    raft: Arc<GameRaft>,
}

impl OpenRaftEngine {
    pub fn new(node_id: NodeId, raft: Arc<GameRaft>) -> Self {
        Self { node_id, raft }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }
}

fn role(state: ServerState) -> NodeRole {
    match state {
        ServerState::Leader => NodeRole::Leader,
        ServerState::Follower => NodeRole::Follower,
        ServerState::Candidate => NodeRole::Candidate,
        ServerState::Learner => NodeRole::Learner,
        ServerState::Shutdown => NodeRole::Shutdown,
    }
}

fn write_error(err: RaftError<NodeId, ClientWriteError<NodeId, MemberNode>>) -> ConsensusError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => ConsensusError::NotLeader {
            leader: forward.leader_node.map(|node| node.addr),
        },
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            ConsensusError::Membership(e.to_string())
        }
        other => ConsensusError::Commit(other.to_string()),
    }
}

/// Cluster members from a metrics snapshot, voters flagged.
pub(crate) fn members(metrics: &RaftMetrics) -> Vec<ClusterMember> {
    let membership = metrics.membership_config.membership();
    let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
    membership
        .nodes()
        .map(|(id, node)| ClusterMember {
            id: node.name.clone(),
            address: node.addr.clone(),
            is_voter: voters.contains(id),
        })
        .collect()
}

#[async_trait]
impl ConsensusEngine for OpenRaftEngine {
    fn state(&self) -> NodeRole {
        role(self.raft.metrics().borrow().state)
    }

    fn leader(&self) -> Option<ClusterMember> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        let membership = metrics.membership_config.membership();
        let node = membership.get_node(&leader)?;
        Some(ClusterMember {
            id: node.name.clone(),
            address: node.addr.clone(),
            is_voter: membership.voter_ids().any(|id| id == leader),
        })
    }

    async fn apply(&self, entry: Vec<u8>, timeout: Duration) -> Result<ApplyResult, ConsensusError> {
        let write = self.raft.client_write(LogCommand(entry));
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(e)) => Err(write_error(e)),
            Err(_) => Err(ConsensusError::Timeout(timeout)),
        }
    }

    async fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> Result<(), ConsensusError> {
        let node = MemberNode::new(id, address);
        let node_id = node.id();

        let change = async {
            self.raft.add_learner(node_id, node, true).await.map_err(write_error)?;
            let voters = BTreeSet::from([node_id]);
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(voters), false)
                .await
                .map_err(write_error)?;
            Ok::<(), ConsensusError>(())
        };

        match tokio::time::timeout(timeout, change).await {
            Ok(Ok(())) => {
                info!(member = %id, %address, raft_id = node_id, "added voter");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConsensusError::Timeout(timeout)),
        }
    }

    async fn configuration(&self) -> Result<Vec<ClusterMember>, ConsensusError> {
        Ok(members(&self.metrics()))
    }

    async fn bootstrap(&self, members: Vec<ClusterMember>) -> Result<(), ConsensusError> {
        let nodes: BTreeMap<NodeId, MemberNode> = members
            .into_iter()
            .map(|m| {
                let node = MemberNode::new(m.id, m.address);
                (node.id(), node)
            })
            .collect();

        match self.raft.initialize(nodes).await {
            Ok(()) => {
                info!(raft_id = self.node_id, "cluster bootstrapped");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                warn!(error = %e, "cluster already initialized, skipping bootstrap");
                Ok(())
            }
            Err(e) => Err(ConsensusError::Bootstrap(e.to_string())),
        }
    }
}
