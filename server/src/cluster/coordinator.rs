use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{ClusterTransport, ConsensusEngine, NodeRole};
use crate::bus::MessageBus;
use crate::error::{BusError, ConsensusError, CoordinatorError};
use crate::protocol::{reply_topic, Event};
use crate::raft::ApplyResult;

/// How a command reached the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Committed through the local engine.
    Applied(ApplyResult),
    /// Handed to the leader at `leader`.
    Forwarded { leader: String, result: ApplyResult },
}

impl Routed {
    pub fn result(&self) -> &ApplyResult {
        match self {
            Routed::Applied(result) => result,
            Routed::Forwarded { result, .. } => result,
        }
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(self, Routed::Forwarded { .. })
    }
}

/// Routes client commands into the replicated log and publishes replies.
#[derive(Clone)]
pub struct Coordinator {
    engine: Arc<dyn ConsensusEngine>,
    transport: Arc<dyn ClusterTransport>,
    bus: Arc<dyn MessageBus>,
    apply_timeout: Duration,
    publish_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        transport: Arc<dyn ClusterTransport>,
        bus: Arc<dyn MessageBus>,
        apply_timeout: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            transport,
            bus,
            apply_timeout,
            publish_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ConsensusEngine> {
        &self.engine
    }

    /// Get `event` committed, locally when leader or through the leader
    /// otherwise, then publish the reply on the event's reply topic.
    ///
    /// The publish runs in the background and never fails the command.
    pub async fn handle(&self, event: &Event) -> Result<Routed, CoordinatorError> {
        let entry = event.to_bytes()?;
        let routed = self.route(entry).await?;

        match routed.result() {
            ApplyResult::Failed { error } => return Err(CoordinatorError::Apply(error.clone())),
            ApplyResult::Reply { event: reply } => self.publish(reply_topic(event), reply.clone()),
            ApplyResult::Ack => {}
        }
        Ok(routed)
    }

    /// Commit `entry` through the local engine without forwarding or
    /// publishing. Serves commands other nodes forward to us.
    pub async fn commit(&self, entry: Vec<u8>) -> Result<ApplyResult, CoordinatorError> {
        match self.engine.apply(entry, self.apply_timeout).await? {
            ApplyResult::Failed { error } => Err(CoordinatorError::Apply(error)),
            result => Ok(result),
        }
    }

    async fn route(&self, entry: Vec<u8>) -> Result<Routed, CoordinatorError> {
        if self.engine.state() != NodeRole::Leader {
            let leader = self.engine.leader().ok_or(CoordinatorError::LeaderUnknown)?;
            return self.forward(leader.address, entry).await;
        }

        match self.engine.apply(entry.clone(), self.apply_timeout).await {
            Ok(result) => Ok(Routed::Applied(result)),
            // Leadership moved between the role check and the append.
            Err(ConsensusError::NotLeader { leader: Some(leader) }) => self.forward(leader, entry).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn forward(&self, leader: String, entry: Vec<u8>) -> Result<Routed, CoordinatorError> {
        debug!(%leader, bytes = entry.len(), "forwarding command to leader");
        let result = self.transport.forward_command(&leader, entry).await?;
        Ok(Routed::Forwarded { leader, result })
    }

    fn publish(&self, topic: String, event: Event) {
        let bus = self.bus.clone();
        let timeout = self.publish_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, bus.publish(&topic, &event)).await {
                Ok(Ok(())) => debug!(%topic, method = %event.method, "reply published"),
                Ok(Err(e)) => warn!(%topic, method = %event.method, error = %e, "failed to publish reply"),
                Err(_) => warn!(%topic, method = %event.method, ?timeout, "publishing reply timed out"),
            }
        });
    }

    /// Consume commands from the bus. Each message is handled in its own task;
    /// reply events are skipped.
    pub async fn serve_bus(self: Arc<Self>, filters: Vec<String>) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.bus.subscribe(filters).await?;
        debug!(filters = ?subscription.filters(), "bus ingress subscribed");

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if message.event.is_reply() {
                    trace!(topic = %message.topic, method = %message.event.method, "ignoring reply event");
                    continue;
                }
                let coordinator = self.clone();
                tokio::spawn(async move {
                    let method = message.event.method.clone();
                    match coordinator.handle(&message.event).await {
                        Ok(routed) => debug!(
                            topic = %message.topic,
                            %method,
                            forwarded = routed.is_forwarded(),
                            "command handled"
                        ),
                        Err(e) => warn!(topic = %message.topic, %method, error = %e, "command failed"),
                    }
                });
            }
            debug!("bus ingress stopped");
        }))
    }
}
