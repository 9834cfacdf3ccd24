//! Outbound side of the inter-node HTTP protocol.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::NodeRole;
use crate::error::TransportError;
use crate::raft::ApplyResult;

/// Body of `POST /raft/join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: String,
    pub node_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Answer of `GET /raft/discovery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub address: String,
    pub role: NodeRole,
}

/// Calls other nodes make on each other. No call retries internally.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Ask `target` (expected to be the leader) to admit this node as a voter.
    async fn join_cluster(&self, target: &str, node_id: &str, node_address: &str) -> Result<(), TransportError>;

    /// Hand a serialized event to the leader and return what applying it produced.
    async fn forward_command(&self, leader: &str, entry: Vec<u8>) -> Result<ApplyResult, TransportError>;

    /// Identity and role of the node serving at `address`.
    async fn describe_peer(&self, address: &str) -> Result<PeerInfo, TransportError>;
}

/// [`ClusterTransport`] over `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// The client's timeout bounds every call.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn url(address: &str, path: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{}{}", address.trim_end_matches('/'), path)
    } else {
        format!("http://{address}{path}")
    }
}

fn request_error(address: &str) -> impl FnOnce(reqwest::Error) -> TransportError + '_ {
    move |source| TransportError::Request {
        address: address.to_string(),
        source,
    }
}

/// Map non-2xx answers to errors, using the `{error}` body when present.
async fn check(address: &str, response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(TransportError::NotLeader {
            address: address.to_string(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(TransportError::Rejected {
        address: address.to_string(),
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ClusterTransport for HttpTransport {
    async fn join_cluster(&self, target: &str, node_id: &str, node_address: &str) -> Result<(), TransportError> {
        let request = JoinRequest {
            node_id: node_id.to_string(),
            node_address: node_address.to_string(),
        };
        let response = self
            .client
            .post(url(target, "/raft/join"))
            .json(&request)
            .send()
            .await
            .map_err(request_error(target))?;
        check(target, response).await?;
        debug!(%target, %node_id, "join accepted");
        Ok(())
    }

    async fn forward_command(&self, leader: &str, entry: Vec<u8>) -> Result<ApplyResult, TransportError> {
        let response = self
            .client
            .post(url(leader, "/raft/command"))
            .header(CONTENT_TYPE, "application/json")
            .body(entry)
            .send()
            .await
            .map_err(request_error(leader))?;
        let response = check(leader, response).await?;
        response
            .json::<ApplyResult>()
            .await
            .map_err(|e| TransportError::InvalidResponse {
                address: leader.to_string(),
                message: e.to_string(),
            })
    }

    async fn describe_peer(&self, address: &str) -> Result<PeerInfo, TransportError> {
        let response = self
            .client
            .get(url(address, "/raft/discovery"))
            .send()
            .await
            .map_err(request_error(address))?;
        let response = check(address, response).await?;
        response
            .json::<PeerInfo>()
            .await
            .map_err(|e| TransportError::InvalidResponse {
                address: address.to_string(),
                message: e.to_string(),
            })
    }
}
