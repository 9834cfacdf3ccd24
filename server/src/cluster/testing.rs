//! In-memory stand-ins for the consensus engine and the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::transport::PeerInfo;
use super::{ClusterMember, ClusterTransport, ConsensusEngine, NodeRole};
use crate::bus::{MessageBus, Subscription};
use crate::error::{BusError, ConsensusError, TransportError};
use crate::handler::{Authenticator, MemoryHandler};
use crate::protocol::Event;
use crate::raft::state_machine::dispatch;
use crate::raft::ApplyResult;

pub(crate) const SIGNING_KEY: &str = "test-signing-key";

/// Engine that applies entries straight to a [`MemoryHandler`].
pub(crate) struct MockEngine {
    role: Mutex<NodeRole>,
    leader: Mutex<Option<ClusterMember>>,
    members: Mutex<Vec<ClusterMember>>,
    handler: Mutex<MemoryHandler>,
    applied: Mutex<Vec<Vec<u8>>>,
    /// When set, `apply` answers not-leader naming this address.
    redirect: Mutex<Option<String>>,
    reject_voters: Mutex<bool>,
    /// How long a commit takes; `apply` gives up after its timeout.
    commit_delay: Mutex<Option<Duration>>,
}

impl MockEngine {
    pub(crate) fn new(role: NodeRole) -> Self {
        Self {
            role: Mutex::new(role),
            leader: Mutex::new(None),
            members: Mutex::new(Vec::new()),
            handler: Mutex::new(MemoryHandler::new(Authenticator::new(SIGNING_KEY))),
            applied: Mutex::new(Vec::new()),
            redirect: Mutex::new(None),
            reject_voters: Mutex::new(false),
            commit_delay: Mutex::new(None),
        }
    }

    pub(crate) fn leader_node(name: &str, address: &str) -> Self {
        let engine = Self::new(NodeRole::Leader);
        let me = ClusterMember::voter(name, address);
        *engine.leader.lock().unwrap() = Some(me.clone());
        engine.members.lock().unwrap().push(me);
        engine
    }

    pub(crate) fn follower_of(leader: Option<ClusterMember>) -> Self {
        let engine = Self::new(NodeRole::Follower);
        if let Some(leader) = &leader {
            engine.members.lock().unwrap().push(leader.clone());
        }
        *engine.leader.lock().unwrap() = leader;
        engine
    }

    pub(crate) fn redirect_to(&self, address: &str) {
        *self.redirect.lock().unwrap() = Some(address.to_string());
    }

    pub(crate) fn delay_commits(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn reject_voters(&self) {
        *self.reject_voters.lock().unwrap() = true;
    }

    /// Record `name` as a non-voting member.
    pub(crate) fn add_learner(&self, name: &str, address: &str) {
        self.members.lock().unwrap().push(ClusterMember {
            id: name.to_string(),
            address: address.to_string(),
            is_voter: false,
        });
    }

    pub(crate) fn applied(&self) -> Vec<Vec<u8>> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn members(&self) -> Vec<ClusterMember> {
        self.members.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsensusEngine for MockEngine {
    fn state(&self) -> NodeRole {
        *self.role.lock().unwrap()
    }

    fn leader(&self) -> Option<ClusterMember> {
        self.leader.lock().unwrap().clone()
    }

    async fn apply(&self, entry: Vec<u8>, timeout: Duration) -> Result<ApplyResult, ConsensusError> {
        if let Some(leader) = self.redirect.lock().unwrap().clone() {
            return Err(ConsensusError::NotLeader { leader: Some(leader) });
        }
        if self.state() != NodeRole::Leader {
            return Err(ConsensusError::NotLeader { leader: None });
        }
        let delay = *self.commit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .map_err(|_| ConsensusError::Timeout(timeout))?;
        }
        let result = dispatch(&mut *self.handler.lock().unwrap(), &entry);
        self.applied.lock().unwrap().push(entry);
        Ok(result)
    }

    async fn add_voter(&self, id: &str, address: &str, _timeout: Duration) -> Result<(), ConsensusError> {
        if self.state() != NodeRole::Leader {
            return Err(ConsensusError::NotLeader { leader: None });
        }
        if *self.reject_voters.lock().unwrap() {
            return Err(ConsensusError::Membership("configuration change in progress".into()));
        }
        let mut members = self.members.lock().unwrap();
        members.retain(|m| m.id != id);
        members.push(ClusterMember::voter(id, address));
        Ok(())
    }

    async fn configuration(&self) -> Result<Vec<ClusterMember>, ConsensusError> {
        Ok(self.members())
    }

    async fn bootstrap(&self, members: Vec<ClusterMember>) -> Result<(), ConsensusError> {
        let mut current = self.members.lock().unwrap();
        if current.is_empty() {
            *current = members;
        }
        Ok(())
    }
}

/// Transport that records calls and answers from canned data.
#[derive(Default)]
pub(crate) struct MockTransport {
    forwards: Mutex<Vec<(String, Vec<u8>)>>,
    joins: Mutex<Vec<(String, String, String)>>,
    forward_result: Mutex<Option<ApplyResult>>,
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn answer_forwards_with(&self, result: ApplyResult) {
        *self.forward_result.lock().unwrap() = Some(result);
    }

    pub(crate) fn add_peer(&self, name: &str, address: &str, role: NodeRole) {
        self.peers.lock().unwrap().insert(
            address.to_string(),
            PeerInfo {
                name: name.to_string(),
                address: address.to_string(),
                role,
            },
        );
    }

    pub(crate) fn forwards(&self) -> Vec<(String, Vec<u8>)> {
        self.forwards.lock().unwrap().clone()
    }

    pub(crate) fn joins(&self) -> Vec<(String, String, String)> {
        self.joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterTransport for MockTransport {
    async fn join_cluster(&self, target: &str, node_id: &str, node_address: &str) -> Result<(), TransportError> {
        self.joins
            .lock()
            .unwrap()
            .push((target.to_string(), node_id.to_string(), node_address.to_string()));
        Ok(())
    }

    async fn forward_command(&self, leader: &str, entry: Vec<u8>) -> Result<ApplyResult, TransportError> {
        self.forwards.lock().unwrap().push((leader.to_string(), entry));
        Ok(self.forward_result.lock().unwrap().clone().unwrap_or(ApplyResult::Ack))
    }

    async fn describe_peer(&self, address: &str) -> Result<PeerInfo, TransportError> {
        self.peers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::Rejected {
                address: address.to_string(),
                status: 404,
                message: "unknown peer".into(),
            })
    }
}

/// Bus whose publishes fail at once or never finish.
pub(crate) struct BrokenBus {
    stall: bool,
    attempts: AtomicUsize,
    abandoned: Arc<AtomicUsize>,
}

/// Counts publishes dropped before they finished.
struct Abandoned(Arc<AtomicUsize>);

impl Drop for Abandoned {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl BrokenBus {
    fn new(stall: bool) -> Self {
        Self {
            stall,
            attempts: AtomicUsize::new(0),
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn failing() -> Self {
        Self::new(false)
    }

    pub(crate) fn stalled() -> Self {
        Self::new(true)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for BrokenBus {
    async fn publish(&self, _topic: &str, _event: &Event) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.stall {
            return Err(BusError::Closed);
        }
        let _abandoned = Abandoned(self.abandoned.clone());
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn subscribe(&self, _filters: Vec<String>) -> Result<Subscription, BusError> {
        Err(BusError::Closed)
    }
}
