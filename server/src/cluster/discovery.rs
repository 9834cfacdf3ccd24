//! UDP broadcast peer discovery with HTTP liveness probing.
//!
//! Every node periodically broadcasts `magic + advertise address` and listens
//! for the same from others. Newly seen peers are handed to a
//! [`PeerObserver`]; known peers are probed over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::peers::AdmissionState;
use super::{ClusterTransport, PeerRegistry};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;

const MAX_DATAGRAM: usize = 1024;

/// Outcome of offering a discovered peer for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDecision {
    Admitted,
    AlreadyMember,
    /// Not possible right now; offer again on a later announcement.
    Deferred,
}

#[async_trait]
pub trait PeerObserver: Send + Sync {
    async fn on_peer_discovered(&self, address: &str) -> PeerDecision;
}

pub struct DiscoveryService {
    settings: DiscoveryConfig,
    advertise_addr: String,
    registry: PeerRegistry,
    observer: Arc<dyn PeerObserver>,
    transport: Arc<dyn ClusterTransport>,
}

/// Running discovery tasks. Dropping the handle leaves them running.
pub struct DiscoveryHandle {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl DiscoveryService {
    pub fn new(
        settings: DiscoveryConfig,
        advertise_addr: impl Into<String>,
        observer: Arc<dyn PeerObserver>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            settings,
            advertise_addr: advertise_addr.into(),
            registry: PeerRegistry::new(),
            observer,
            transport,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Bind the sockets and spawn the listen, broadcast and probe loops.
    pub async fn start(self: Arc<Self>) -> Result<DiscoveryHandle, DiscoveryError> {
        let listen_addr = format!("0.0.0.0:{}", self.settings.port);
        let listener = UdpSocket::bind(&listen_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let sender = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: "0.0.0.0:0".to_string(),
                source,
            })?;
        sender.set_broadcast(true)?;
        let target = format!("{}:{}", self.settings.broadcast_addr, local_addr.port());
        let target: SocketAddr = target
            .parse()
            .map_err(|_| DiscoveryError::BroadcastAddr(target.clone()))?;

        info!(listen = %local_addr, broadcast = %target, advertise = %self.advertise_addr, "discovery started");

        let tasks = vec![
            tokio::spawn(self.clone().listen(listener)),
            tokio::spawn(self.clone().broadcast(sender, target)),
            tokio::spawn(self.clone().probe()),
        ];
        Ok(DiscoveryHandle { local_addr, tasks })
    }

    pub fn announcement(&self) -> Vec<u8> {
        let mut datagram = self.settings.magic.as_bytes().to_vec();
        datagram.extend_from_slice(self.advertise_addr.as_bytes());
        datagram
    }

    /// Address carried by a datagram, or `None` for foreign traffic and our
    /// own announcements.
    pub fn parse_announcement(&self, datagram: &[u8]) -> Option<String> {
        let rest = datagram.strip_prefix(self.settings.magic.as_bytes())?;
        let address = std::str::from_utf8(rest).ok()?.trim();
        if address.is_empty() || address == self.advertise_addr {
            return None;
        }
        Some(address.to_string())
    }

    /// Record an announcement and, for a peer not yet settled, run admission
    /// in the background. Returns the announced address when it was offered.
    pub async fn handle_datagram(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) -> Option<String> {
        let address = self.parse_announcement(datagram)?;
        if !self.registry.observe(&address).await {
            trace!(%address, %from, "known peer announced");
            return None;
        }

        debug!(%address, %from, "offering discovered peer");
        let service = self.clone();
        let peer = address.clone();
        tokio::spawn(async move {
            let decision = service.observer.on_peer_discovered(&peer).await;
            let state = match decision {
                PeerDecision::Admitted | PeerDecision::AlreadyMember => AdmissionState::Settled,
                PeerDecision::Deferred => AdmissionState::Deferred,
            };
            service.registry.set_admission(&peer, state).await;
            debug!(address = %peer, ?decision, "peer admission finished");
        });
        Some(address)
    }

    async fn listen(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    self.handle_datagram(&buf[..len], from).await;
                }
                Err(e) => warn!(error = %e, "discovery receive failed"),
            }
        }
    }

    async fn broadcast(self: Arc<Self>, socket: UdpSocket, target: SocketAddr) {
        let datagram = self.announcement();
        let mut ticker = tokio::time::interval(self.settings.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&datagram, target).await {
                warn!(%target, error = %e, "discovery broadcast failed");
            }
        }
    }

    async fn probe(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.probe_interval);
        loop {
            ticker.tick().await;
            self.probe_peers().await;
        }
    }

    /// Check every known peer once.
    pub async fn probe_peers(&self) {
        for address in self.registry.addresses().await {
            match self.transport.describe_peer(&address).await {
                Ok(info) => {
                    trace!(%address, name = %info.name, role = %info.role, "peer alive");
                    self.registry.record_probe_success(&address, info.name).await;
                }
                Err(e) => {
                    let failures = self.registry.record_probe_failure(&address).await;
                    warn!(%address, failures, error = %e, "peer probe failed");
                }
            }
        }
    }
}
