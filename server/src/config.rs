//! Node configuration, built once at startup and shared by `Arc`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
pub const DISCOVERY_MAGIC: &str = "COD_SERVER_DISCOVERY";

/// Slack inter-node calls get on top of the slowest remote commit.
const FORWARD_MARGIN: Duration = Duration::from_secs(5);

/// Command line arguments. Every flag can also come from a `COD_*`
/// environment variable.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Replicated card game server node", long_about = None)]
pub struct Args {
    /// Unique node name
    #[arg(long = "node-id", env = "COD_NODE_ID", default_value = "node-1")]
    pub node_id: String,

    /// HTTP bind address for cluster endpoints, raft RPC and the bus gateway
    #[arg(long = "http-addr", env = "COD_HTTP_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub http_addr: String,

    /// Address other nodes reach this node on. Defaults to the bound address;
    /// required with a wildcard bind while discovery is on.
    #[arg(long = "advertise-addr", env = "COD_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Directory for the raft log, vote and snapshots. Without it raft state
    /// is lost on restart.
    #[arg(long = "data-dir", env = "COD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Bootstrap a new cluster with this node as the only voter
    #[arg(long = "bootstrap", env = "COD_IS_FIRST_NODE", default_value_t = false)]
    pub bootstrap: bool,

    /// Existing nodes to send a join request to (comma separated)
    #[arg(long = "join", env = "COD_JOIN", value_delimiter = ',')]
    pub join: Vec<String>,

    /// Key used to sign session tokens
    #[arg(long = "signing-key", env = "COD_SIGNING_KEY", default_value = "cod-server-dev-key")]
    pub signing_key: String,

    /// Commit timeout in milliseconds
    #[arg(long = "apply-timeout-ms", env = "COD_APPLY_TIMEOUT_MS", default_value_t = 10_000)]
    pub apply_timeout_ms: u64,

    /// Bus publish timeout in milliseconds
    #[arg(long = "publish-timeout-ms", env = "COD_PUBLISH_TIMEOUT_MS", default_value_t = 10_000)]
    pub publish_timeout_ms: u64,

    /// Enable UDP peer discovery
    #[arg(long = "discovery", env = "COD_DISCOVERY_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub discovery: bool,

    /// UDP discovery port
    #[arg(long = "discovery-port", env = "COD_DISCOVERY_PORT", default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Log level used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

/// Raft timer settings in milliseconds.
#[derive(Debug, Clone)]
pub struct RaftTimings {
    pub heartbeat_ms: u64,
    pub election_min_ms: u64,
    pub election_max_ms: u64,
    pub snapshot_threshold: u64,
}

impl Default for RaftTimings {
    fn default() -> Self {
        Self {
            heartbeat_ms: 500,
            election_min_ms: 1500,
            election_max_ms: 3000,
            snapshot_threshold: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub port: u16,
    /// Destination of announcements; the broadcast address in production.
    pub broadcast_addr: String,
    pub magic: String,
    pub interval: Duration,
    pub probe_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: "255.255.255.255".to_string(),
            magic: DISCOVERY_MAGIC.to_string(),
            interval: Duration::from_secs(5),
            probe_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: String,
    pub http_addr: String,
    pub advertise_addr: Option<String>,
    pub bootstrap: bool,
    pub join: Vec<String>,
    pub signing_key: String,
    pub data_dir: Option<PathBuf>,
    pub apply_timeout: Duration,
    pub publish_timeout: Duration,
    /// Timeout for inter-node HTTP calls (forward, join, probes). Must
    /// outlast the commit the remote leader runs for us.
    pub http_timeout: Duration,
    pub join_retry_interval: Duration,
    /// Timeout for adding a discovered or joining node as a voter.
    pub membership_timeout: Duration,
    pub raft: RaftTimings,
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            http_addr: "127.0.0.1:8080".to_string(),
            advertise_addr: None,
            bootstrap: false,
            join: Vec::new(),
            signing_key: "cod-server-dev-key".to_string(),
            data_dir: None,
            apply_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            http_timeout: forward_timeout(Duration::from_secs(10), Duration::from_secs(10)),
            join_retry_interval: Duration::from_secs(3),
            membership_timeout: Duration::from_secs(10),
            raft: RaftTimings::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Client timeout for forwards and joins: a forwarded command may take the
/// leader a full `apply` and a join a full `membership` change.
pub fn forward_timeout(apply: Duration, membership: Duration) -> Duration {
    apply.max(membership) + FORWARD_MARGIN
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Empty("node id"));
        }
        if self.http_addr.trim().is_empty() {
            return Err(ConfigError::Empty("http address"));
        }
        if self.signing_key.is_empty() {
            return Err(ConfigError::Empty("signing key"));
        }
        if self.apply_timeout.is_zero() {
            return Err(ConfigError::Zero("apply timeout"));
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::Zero("publish timeout"));
        }
        let remote = self.apply_timeout.max(self.membership_timeout);
        if self.http_timeout <= remote {
            return Err(ConfigError::ForwardTimeout {
                http: self.http_timeout,
                remote,
            });
        }
        let raft = &self.raft;
        if raft.heartbeat_ms >= raft.election_min_ms || raft.election_min_ms >= raft.election_max_ms {
            return Err(ConfigError::ElectionTimeout {
                heartbeat: raft.heartbeat_ms,
                min: raft.election_min_ms,
                max: raft.election_max_ms,
            });
        }
        if self.discovery.enabled && self.discovery.magic.is_empty() {
            return Err(ConfigError::Empty("discovery magic"));
        }
        // Peers would be told a loopback address and drop it as their own.
        if self.discovery.enabled && self.advertise_addr.is_none() {
            if let Ok(addr) = self.http_addr.parse::<SocketAddr>() {
                if addr.ip().is_unspecified() {
                    return Err(ConfigError::AdvertiseAddrRequired(self.http_addr.clone()));
                }
            }
        }
        Ok(())
    }
}

impl TryFrom<Args> for NodeConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let apply_timeout = Duration::from_millis(args.apply_timeout_ms);
        let defaults = NodeConfig::default();
        let config = NodeConfig {
            node_name: args.node_id,
            http_addr: args.http_addr,
            advertise_addr: args.advertise_addr.filter(|a| !a.is_empty()),
            bootstrap: args.bootstrap,
            join: args.join.into_iter().filter(|a| !a.is_empty()).collect(),
            signing_key: args.signing_key,
            data_dir: args.data_dir.filter(|d| !d.as_os_str().is_empty()),
            apply_timeout,
            publish_timeout: Duration::from_millis(args.publish_timeout_ms),
            http_timeout: forward_timeout(apply_timeout, defaults.membership_timeout),
            discovery: DiscoveryConfig {
                enabled: args.discovery,
                port: args.discovery_port,
                ..DiscoveryConfig::default()
            },
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "cod-server",
            "--node-id",
            "node-2",
            "--http-addr",
            "127.0.0.1:8081",
            "--join",
            "10.0.0.1:8080,10.0.0.2:8080",
            "--discovery",
            "false",
            "--apply-timeout-ms",
            "2500",
        ]);
        let config = NodeConfig::try_from(args).unwrap();

        assert_eq!(config.node_name, "node-2");
        assert_eq!(config.join, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
        assert!(!config.discovery.enabled);
        assert_eq!(config.apply_timeout, Duration::from_millis(2500));
        assert_eq!(config.publish_timeout, Duration::from_secs(10));
        assert!(!config.bootstrap);
    }

    #[test]
    fn test_forward_timeout_outlasts_apply_timeout() {
        let args = Args::parse_from(["cod-server", "--apply-timeout-ms", "30000", "--data-dir", "/var/lib/cod"]);
        let config = NodeConfig::try_from(args).unwrap();

        assert_eq!(config.apply_timeout, Duration::from_secs(30));
        assert_eq!(config.http_timeout, Duration::from_secs(35));
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/cod")));

        // Short commits are still bounded by the membership change a join waits on.
        let args = Args::parse_from(["cod-server", "--apply-timeout-ms", "1000"]);
        let config = NodeConfig::try_from(args).unwrap();
        assert!(config.http_timeout > config.membership_timeout);
    }

    #[test]
    fn test_rejects_forward_timeout_not_above_apply_timeout() {
        let config = NodeConfig {
            apply_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ForwardTimeout { http, remote }) if http == remote
        ));
    }

    #[test]
    fn test_wildcard_bind_with_discovery_needs_advertise_addr() {
        let args = Args::parse_from(["cod-server", "--http-addr", "0.0.0.0:8080"]);
        assert!(matches!(
            NodeConfig::try_from(args),
            Err(ConfigError::AdvertiseAddrRequired(addr)) if addr == "0.0.0.0:8080"
        ));

        let args = Args::parse_from([
            "cod-server",
            "--http-addr",
            "0.0.0.0:8080",
            "--advertise-addr",
            "10.0.0.4:8080",
        ]);
        assert!(NodeConfig::try_from(args).is_ok());

        // Without discovery the loopback fallback is allowed.
        let args = Args::parse_from(["cod-server", "--http-addr", "[::]:8080", "--discovery", "false"]);
        assert!(NodeConfig::try_from(args).is_ok());
    }

    #[test]
    fn test_rejects_bad_election_timeouts() {
        let config = NodeConfig {
            raft: RaftTimings {
                heartbeat_ms: 2000,
                ..RaftTimings::default()
            },
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ElectionTimeout { .. })));
    }

    #[test]
    fn test_rejects_empty_node_id() {
        let args = Args::parse_from(["cod-server", "--node-id", " "]);
        assert!(matches!(NodeConfig::try_from(args), Err(ConfigError::Empty("node id"))));
    }
}
