pub mod engine;
pub mod network;
pub mod rpc;
pub mod state_machine;
pub mod storage;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use openraft::{Config, Raft, SnapshotPolicy};
use tracing::{info, warn};

use crate::config::RaftTimings;
use crate::error::NodeError;
use crate::handler::GameHandler;
use engine::OpenRaftEngine;
use network::HttpNetworkFactory;
use state_machine::StateMachineStore;
use storage::LogStore;

pub use types::{member_id, ApplyResult, GameRaft, LogCommand, MemberNode, NodeId, TypeConfig};

/// Raft instance together with the pieces the rest of the node needs.
pub struct RaftNode {
    pub node_id: NodeId,
    pub raft: Arc<GameRaft>,
    pub state_machine: Arc<StateMachineStore>,
    pub engine: Arc<OpenRaftEngine>,
}

impl RaftNode {
    /// Create a raft node named `name`, applying committed entries to `handler`.
    /// With a `data_dir` the log, vote and latest snapshot are kept there and
    /// reloaded on the next start.
    pub async fn new(
        name: &str,
        timings: &RaftTimings,
        data_dir: Option<&Path>,
        handler: Box<dyn GameHandler>,
        client: reqwest::Client,
    ) -> Result<Self, NodeError> {
        let node_id = member_id(name);

        let config = Config {
            cluster_name: "cod-server".to_string(),
            heartbeat_interval: timings.heartbeat_ms,
            election_timeout_min: timings.election_min_ms,
            election_timeout_max: timings.election_max_ms,
            install_snapshot_timeout: 10_000,
            max_in_snapshot_log_to_keep: 1000,
            max_payload_entries: 300,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(timings.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(|e| NodeError::Raft(e.to_string()))?;

        let (log_store, state_machine) = match data_dir {
            Some(dir) => {
                let storage_error = |message: String| NodeError::Storage {
                    dir: dir.display().to_string(),
                    message,
                };
                let log_store = LogStore::open(dir).map_err(|e| storage_error(e.to_string()))?;
                let state_machine =
                    StateMachineStore::open(handler, dir).map_err(|e| storage_error(e.to_string()))?;
                (log_store, state_machine)
            }
            None => {
                warn!(node = %name, "no data directory, raft state will not survive a restart");
                (LogStore::new(), StateMachineStore::new(handler))
            }
        };
        let network = HttpNetworkFactory::new(client);

        let raft = Raft::new(node_id, Arc::new(config), network, log_store, state_machine.clone())
            .await
            .map_err(|e| NodeError::Raft(e.to_string()))?;
        let raft = Arc::new(raft);

        info!(node = %name, raft_id = node_id, "raft node created");

        Ok(Self {
            node_id,
            engine: Arc::new(OpenRaftEngine::new(node_id, raft.clone())),
            raft,
            state_machine,
        })
    }

    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader == Some(self.node_id)
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "raft shutdown failed");
        }
    }
}
