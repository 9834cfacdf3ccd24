//! Replicated coordination core of a multiplayer card game server.
//!
//! Client commands arrive over a publish/subscribe bus, are committed through
//! raft and applied by a deterministic game handler on every node; replies go
//! back out on the bus.

pub mod bus;
pub mod cluster;
pub mod config;
pub mod error;
pub mod handler;
pub mod node;
pub mod protocol;
pub mod raft;

pub use bus::{LocalBus, MessageBus};
pub use cluster::{ClusterMember, ConsensusEngine, Coordinator, NodeRole};
pub use config::{Args, NodeConfig};
pub use handler::{GameHandler, MemoryHandler};
pub use node::ClusterNode;
pub use protocol::{Command, Event};
pub use raft::{ApplyResult, RaftNode};
