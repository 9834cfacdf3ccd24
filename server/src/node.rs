//! Startup wiring for one cluster node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::bus::{gateway, LocalBus, MessageBus};
use crate::cluster::api::{self, ApiState};
use crate::cluster::discovery::DiscoveryHandle;
use crate::cluster::{
    Admission, ClusterMember, ClusterTransport, ConsensusEngine, Coordinator, DiscoveryService, HttpTransport,
};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::handler::{Authenticator, MemoryHandler};
use crate::protocol::INBOUND_TOPICS;
use crate::raft::state_machine::StateMachineStore;
use crate::raft::{rpc, NodeId, RaftNode};

/// A running node: HTTP server, raft, bus ingress and discovery.
pub struct ClusterNode {
    config: Arc<NodeConfig>,
    local_addr: SocketAddr,
    advertise_addr: String,
    raft: RaftNode,
    bus: LocalBus,
    coordinator: Arc<Coordinator>,
    discovery: Option<DiscoveryHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterNode {
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let config = Arc::new(config);

        let listener = TcpListener::bind(&config.http_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: config.http_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: config.http_addr.clone(),
            source,
        })?;
        let advertise_addr = advertise_address(&config, local_addr);

        // Raft RPC carries its own per-request deadlines.
        let raft_client = reqwest::Client::builder().build().map_err(NodeError::Client)?;
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(NodeError::Client)?;

        let handler = MemoryHandler::new(Authenticator::new(&config.signing_key));
        let raft = RaftNode::new(
            &config.node_name,
            &config.raft,
            config.data_dir.as_deref(),
            Box::new(handler),
            raft_client,
        )
        .await?;

        let engine: Arc<dyn ConsensusEngine> = raft.engine.clone();
        let transport: Arc<dyn ClusterTransport> = Arc::new(HttpTransport::new(http_client));
        let bus = LocalBus::new();
        let shared_bus: Arc<dyn MessageBus> = Arc::new(bus.clone());
        let coordinator = Arc::new(Coordinator::new(
            engine.clone(),
            transport.clone(),
            shared_bus.clone(),
            config.apply_timeout,
            config.publish_timeout,
        ));

        if config.bootstrap {
            engine
                .bootstrap(vec![ClusterMember::voter(config.node_name.as_str(), advertise_addr.as_str())])
                .await?;
        }

        let api_state = ApiState {
            config: config.clone(),
            advertise_addr: advertise_addr.clone(),
            coordinator: coordinator.clone(),
            raft: Some(raft.engine.clone()),
        };
        let app = Router::new()
            .merge(api::router(api_state))
            .merge(rpc::router(raft.raft.clone()))
            .merge(gateway::router(shared_bus))
            .layer(TraceLayer::new_for_http());

        let mut tasks = vec![tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server stopped");
            }
        })];
        info!(node = %config.node_name, listen = %local_addr, advertise = %advertise_addr, "HTTP server listening");

        if !config.bootstrap && !config.join.is_empty() {
            tasks.push(tokio::spawn(join_seeds(
                transport.clone(),
                config.join.clone(),
                config.node_name.clone(),
                advertise_addr.clone(),
                config.join_retry_interval,
            )));
        }

        let filters = INBOUND_TOPICS.iter().map(|topic| topic.to_string()).collect();
        tasks.push(coordinator.clone().serve_bus(filters).await?);

        let discovery = if config.discovery.enabled {
            let admission = Arc::new(Admission::new(engine.clone(), transport.clone(), config.membership_timeout));
            let service = Arc::new(DiscoveryService::new(
                config.discovery.clone(),
                advertise_addr.clone(),
                admission,
                transport,
            ));
            Some(service.start().await?)
        } else {
            None
        };

        info!(
            node = %config.node_name,
            raft_id = raft.node_id,
            bootstrap = config.bootstrap,
            discovery = config.discovery.enabled,
            "node started"
        );

        Ok(Self {
            config,
            local_addr,
            advertise_addr,
            raft,
            bus,
            coordinator,
            discovery,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn raft_id(&self) -> NodeId {
        self.raft.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn engine(&self) -> Arc<dyn ConsensusEngine> {
        self.raft.engine.clone()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The in-process bus; commands published here reach the coordinator.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn state_machine(&self) -> &Arc<StateMachineStore> {
        &self.raft.state_machine
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub async fn shutdown(self) {
        info!(node = %self.config.node_name, "shutting down");
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        for task in &self.tasks {
            task.abort();
        }
        self.raft.shutdown().await;
    }
}

/// Address other nodes use for us. A wildcard bind is replaced by loopback,
/// which config validation only allows with discovery off.
fn advertise_address(config: &NodeConfig, local_addr: SocketAddr) -> String {
    if let Some(addr) = &config.advertise_addr {
        return addr.clone();
    }
    if local_addr.ip().is_unspecified() {
        warn!(%local_addr, "bound to a wildcard address without --advertise-addr, advertising loopback");
        return format!("127.0.0.1:{}", local_addr.port());
    }
    local_addr.to_string()
}

/// Ask the seeds in turn to admit us until one accepts.
async fn join_seeds(
    transport: Arc<dyn ClusterTransport>,
    seeds: Vec<String>,
    node_name: String,
    advertise_addr: String,
    retry_interval: Duration,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        for seed in &seeds {
            match transport.join_cluster(seed, &node_name, &advertise_addr).await {
                Ok(()) => {
                    info!(%seed, attempt, "joined cluster");
                    return;
                }
                Err(e) => warn!(%seed, attempt, error = %e, "join request failed"),
            }
        }
        tokio::time::sleep(retry_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::MockTransport;

    #[test]
    fn test_advertise_address() {
        let bound: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(advertise_address(&NodeConfig::default(), bound), "127.0.0.1:8080");

        let bound: SocketAddr = "10.0.0.4:8080".parse().unwrap();
        assert_eq!(advertise_address(&NodeConfig::default(), bound), "10.0.0.4:8080");

        let config = NodeConfig {
            advertise_addr: Some("node-4.internal:8080".into()),
            ..NodeConfig::default()
        };
        assert_eq!(advertise_address(&config, bound), "node-4.internal:8080");
    }

    #[tokio::test]
    async fn test_join_seeds_stops_after_success() {
        let transport = Arc::new(MockTransport::new());
        join_seeds(
            transport.clone(),
            vec!["10.0.0.1:8080".into(), "10.0.0.2:8080".into()],
            "node-3".into(),
            "10.0.0.3:8080".into(),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(
            transport.joins(),
            vec![("10.0.0.1:8080".to_string(), "node-3".to_string(), "10.0.0.3:8080".to_string())]
        );
    }
}
