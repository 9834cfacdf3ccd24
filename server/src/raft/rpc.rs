//! Inbound raft RPC routes, the server side of [`HttpNetwork`](super::network::HttpNetwork).
//!
//! Each route answers with the JSON encoded `Result` returned by the local
//! raft instance so the caller can tell remote raft errors from transport
//! failures.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

use super::types::{GameRaft, NodeId, TypeConfig};

pub fn router(raft: Arc<GameRaft>) -> Router {
    Router::new()
        .route("/raft/append", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/snapshot", post(install_snapshot))
        .with_state(raft)
}

/// Log replication and heartbeats.
async fn append_entries(
    State(raft): State<Arc<GameRaft>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.append_entries(req).await)
}

async fn vote(
    State(raft): State<Arc<GameRaft>>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.vote(req).await)
}

async fn install_snapshot(
    State(raft): State<Arc<GameRaft>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(raft.install_snapshot(req).await)
}
