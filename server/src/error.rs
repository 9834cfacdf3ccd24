//! Error types for the coordination core.

use std::time::Duration;

use thiserror::Error;

/// Failures turning bytes into an [`Event`](crate::protocol::Event) or a
/// payload into a typed command.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Errors reported by the consensus engine adapter.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// This node cannot commit; `leader` is the known leader address, if any.
    #[error("not leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("membership change rejected: {0}")]
    Membership(String),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}

/// Errors from outbound inter-node HTTP calls.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {address} failed: {source}")]
    Request {
        address: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{address} is not the leader")]
    NotLeader { address: String },

    #[error("{address} rejected request with status {status}: {message}")]
    Rejected {
        address: String,
        status: u16,
        message: String,
    },

    #[error("invalid response from {address}: {message}")]
    InvalidResponse { address: String, message: String },
}

/// Errors surfaced by the command coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("leader unknown")]
    LeaderUnknown,

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("forward failed: {0}")]
    Forward(#[from] TransportError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// The command committed but the state machine returned an error result.
    #[error("apply failed: {0}")]
    Apply(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("bus closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid broadcast address {0}")]
    BroadcastAddr(String),

    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the business handler's snapshot/restore hooks.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to serialize handler state: {0}")]
    Snapshot(#[source] serde_json::Error),

    #[error("failed to restore handler state: {0}")]
    Restore(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("election timeout min ({min}ms) must be below max ({max}ms) and above heartbeat ({heartbeat}ms)")]
    ElectionTimeout { heartbeat: u64, min: u64, max: u64 },

    #[error("inter-node HTTP timeout ({http:?}) must exceed the apply and membership timeouts ({remote:?})")]
    ForwardTimeout { http: Duration, remote: Duration },

    #[error("--advertise-addr is required when binding {0} with discovery enabled")]
    AdvertiseAddrRequired(String),
}

/// Fatal node startup errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to start raft: {0}")]
    Raft(String),

    #[error("failed to open raft storage in {dir}: {message}")]
    Storage { dir: String, message: String },

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Bus(#[from] BusError),
}
