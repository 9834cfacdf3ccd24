//! Inbound side of the inter-node HTTP protocol.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::transport::{ErrorBody, JoinRequest, PeerInfo, StatusBody};
use super::{ClusterMember, ConsensusEngine, Coordinator, NodeRole};
use crate::config::NodeConfig;
use crate::error::{ConsensusError, CoordinatorError};
use crate::raft::engine::OpenRaftEngine;

/// State shared by the cluster endpoints.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<NodeConfig>,
    /// Address this node is reachable on by other nodes.
    pub advertise_addr: String,
    pub coordinator: Arc<Coordinator>,
    /// Raft internals for `/status`; absent when running on another engine.
    pub raft: Option<Arc<OpenRaftEngine>>,
}

impl ApiState {
    fn engine(&self) -> &Arc<dyn ConsensusEngine> {
        self.coordinator.engine()
    }
}

/// Response of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub address: String,
    pub role: NodeRole,
    pub leader: Option<ClusterMember>,
    pub members: Vec<ClusterMember>,
    pub term: Option<u64>,
    pub last_applied: Option<u64>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/raft/join", post(join))
        .route("/raft/command", post(command))
        .route("/raft/discovery", get(discovery))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

fn not_leader(engine: &dyn ConsensusEngine) -> Response {
    let message = match engine.leader() {
        Some(leader) => format!("not leader, current leader is {}", leader.address),
        None => "not leader, leader unknown".to_string(),
    };
    error(StatusCode::SERVICE_UNAVAILABLE, message)
}

/// Admit the caller as a voter.
async fn join(State(state): State<ApiState>, body: Result<Json<JoinRequest>, JsonRejection>) -> Response {
    let engine = state.engine();
    if engine.state() != NodeRole::Leader {
        return not_leader(engine.as_ref());
    }

    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if request.node_id.is_empty() || request.node_address.is_empty() {
        return error(StatusCode::BAD_REQUEST, "node_id and node_address are required");
    }

    match engine
        .add_voter(&request.node_id, &request.node_address, state.config.membership_timeout)
        .await
    {
        Ok(()) => {
            info!(node = %request.node_id, address = %request.node_address, "node joined cluster");
            (StatusCode::OK, Json(StatusBody { status: "ok".into() })).into_response()
        }
        Err(ConsensusError::NotLeader { .. }) => not_leader(engine.as_ref()),
        Err(e) => {
            warn!(node = %request.node_id, error = %e, "failed to add voter");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Apply a command forwarded by another node. The forwarding node publishes
/// the reply, so nothing is published here.
async fn command(State(state): State<ApiState>, body: Bytes) -> Response {
    let engine = state.engine();
    if engine.state() != NodeRole::Leader {
        return not_leader(engine.as_ref());
    }

    match state.coordinator.commit(body.to_vec()).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(CoordinatorError::Consensus(ConsensusError::NotLeader { .. })) => not_leader(engine.as_ref()),
        Err(e) => {
            warn!(error = %e, "forwarded command failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn discovery(State(state): State<ApiState>) -> Json<PeerInfo> {
    Json(PeerInfo {
        name: state.config.node_name.clone(),
        address: state.advertise_addr.clone(),
        role: state.engine().state(),
    })
}

async fn status(State(state): State<ApiState>) -> Response {
    let engine = state.engine();
    let members = match engine.configuration().await {
        Ok(members) => members,
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let metrics = state.raft.as_ref().map(|raft| raft.metrics());

    Json(StatusResponse {
        node_id: state.config.node_name.clone(),
        address: state.advertise_addr.clone(),
        role: engine.state(),
        leader: engine.leader(),
        members,
        term: metrics.as_ref().map(|m| m.current_term),
        last_applied: metrics.and_then(|m| m.last_applied.map(|id| id.index)),
    })
    .into_response()
}
