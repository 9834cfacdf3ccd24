use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ClusterTransport, ConsensusEngine, NodeRole, PeerDecision, PeerObserver};

/// Adds discovered peers to the cluster as voters. Only acts on the leader.
pub struct Admission {
    engine: Arc<dyn ConsensusEngine>,
    transport: Arc<dyn ClusterTransport>,
    timeout: Duration,
}

impl Admission {
    pub fn new(engine: Arc<dyn ConsensusEngine>, transport: Arc<dyn ClusterTransport>, timeout: Duration) -> Self {
        Self {
            engine,
            transport,
            timeout,
        }
    }
}

#[async_trait]
impl PeerObserver for Admission {
    async fn on_peer_discovered(&self, address: &str) -> PeerDecision {
        if self.engine.state() != NodeRole::Leader {
            debug!(%address, "not leader, deferring admission");
            return PeerDecision::Deferred;
        }

        // The peer's member id is its node name, which only it knows.
        let info = match self.transport.describe_peer(address).await {
            Ok(info) => info,
            Err(e) => {
                warn!(%address, error = %e, "could not identify discovered peer");
                return PeerDecision::Deferred;
            }
        };

        match self.engine.configuration().await {
            Ok(members) => match members.iter().find(|m| m.id == info.name || m.address == address) {
                Some(member) if member.is_voter => {
                    debug!(%address, name = %info.name, "discovered peer already a voter");
                    return PeerDecision::AlreadyMember;
                }
                // Left behind when an earlier admission stopped before promotion.
                Some(_) => info!(%address, name = %info.name, "discovered peer is a learner, promoting"),
                None => {}
            },
            Err(e) => {
                warn!(%address, error = %e, "could not read cluster configuration");
                return PeerDecision::Deferred;
            }
        }

        match self.engine.add_voter(&info.name, address, self.timeout).await {
            Ok(()) => {
                info!(%address, name = %info.name, "admitted discovered peer as voter");
                PeerDecision::Admitted
            }
            Err(e) => {
                warn!(%address, name = %info.name, error = %e, "failed to admit discovered peer");
                PeerDecision::Deferred
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{MockEngine, MockTransport};
    use crate::cluster::ClusterMember;

    fn admission(engine: Arc<MockEngine>, transport: Arc<MockTransport>) -> Admission {
        Admission::new(engine, transport, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_follower_defers() {
        let engine = Arc::new(MockEngine::follower_of(Some(ClusterMember::voter("node-1", "10.0.0.1:8080"))));
        let transport = Arc::new(MockTransport::new());
        transport.add_peer("node-2", "10.0.0.2:8080", NodeRole::Follower);

        let decision = admission(engine.clone(), transport).on_peer_discovered("10.0.0.2:8080").await;

        assert_eq!(decision, PeerDecision::Deferred);
        assert_eq!(engine.members().len(), 1);
    }

    #[tokio::test]
    async fn test_leader_admits_new_peer() {
        let engine = Arc::new(MockEngine::leader_node("node-1", "10.0.0.1:8080"));
        let transport = Arc::new(MockTransport::new());
        transport.add_peer("node-2", "10.0.0.2:8080", NodeRole::Follower);
        let admission = admission(engine.clone(), transport);

        assert_eq!(admission.on_peer_discovered("10.0.0.2:8080").await, PeerDecision::Admitted);
        assert!(engine.members().contains(&ClusterMember::voter("node-2", "10.0.0.2:8080")));

        assert_eq!(admission.on_peer_discovered("10.0.0.2:8080").await, PeerDecision::AlreadyMember);
    }

    #[tokio::test]
    async fn test_unreachable_or_rejected_peer_is_deferred() {
        let engine = Arc::new(MockEngine::leader_node("node-1", "10.0.0.1:8080"));
        let transport = Arc::new(MockTransport::new());
        let admission = admission(engine.clone(), transport.clone());

        assert_eq!(admission.on_peer_discovered("10.0.0.9:8080").await, PeerDecision::Deferred);

        transport.add_peer("node-2", "10.0.0.2:8080", NodeRole::Follower);
        engine.reject_voters();
        assert_eq!(admission.on_peer_discovered("10.0.0.2:8080").await, PeerDecision::Deferred);
        assert_eq!(engine.members().len(), 1);
    }

    #[tokio::test]
    async fn test_learner_is_promoted_to_voter() {
        let engine = Arc::new(MockEngine::leader_node("node-1", "10.0.0.1:8080"));
        engine.add_learner("node-2", "10.0.0.2:8080");
        let transport = Arc::new(MockTransport::new());
        transport.add_peer("node-2", "10.0.0.2:8080", NodeRole::Follower);
        let admission = admission(engine.clone(), transport);

        assert_eq!(admission.on_peer_discovered("10.0.0.2:8080").await, PeerDecision::Admitted);
        let members = engine.members();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&ClusterMember::voter("node-2", "10.0.0.2:8080")));
    }

    #[tokio::test]
    async fn test_failed_promotion_is_deferred_not_settled() {
        let engine = Arc::new(MockEngine::leader_node("node-1", "10.0.0.1:8080"));
        engine.add_learner("node-2", "10.0.0.2:8080");
        engine.reject_voters();
        let transport = Arc::new(MockTransport::new());
        transport.add_peer("node-2", "10.0.0.2:8080", NodeRole::Learner);

        let decision = admission(engine.clone(), transport).on_peer_discovered("10.0.0.2:8080").await;

        assert_eq!(decision, PeerDecision::Deferred);
        assert!(engine.members().iter().any(|m| m.id == "node-2" && !m.is_voter));
    }
}
