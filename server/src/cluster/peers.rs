use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

/// Where a discovered peer stands with respect to cluster admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// Seen but not yet offered to the admission callback.
    New,
    /// Admission callback running.
    Pending,
    /// Callback could not admit it yet (e.g. we were not leader); retried on
    /// the next announcement.
    Deferred,
    /// In the cluster, nothing left to do.
    Settled,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: String,
    /// Node name, learned from a successful probe.
    pub name: Option<String>,
    pub admission: AdmissionState,
    pub last_seen: Instant,
    pub failed_probes: u32,
}

/// Registry of peers seen through discovery, keyed by HTTP address.
/// Thread-safe for concurrent access from the listener and probe loops.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announcement from `address`. Returns true when the peer
    /// should be offered to the admission callback now; in that case it is
    /// marked pending so concurrent announcements do not offer it twice.
    pub async fn observe(&self, address: &str) -> bool {
        let mut peers = self.peers.write().await;
        let record = peers.entry(address.to_string()).or_insert_with(|| PeerRecord {
            address: address.to_string(),
            name: None,
            admission: AdmissionState::New,
            last_seen: Instant::now(),
            failed_probes: 0,
        });
        record.last_seen = Instant::now();
        match record.admission {
            AdmissionState::New | AdmissionState::Deferred => {
                record.admission = AdmissionState::Pending;
                true
            }
            AdmissionState::Pending | AdmissionState::Settled => false,
        }
    }

    pub async fn set_admission(&self, address: &str, state: AdmissionState) {
        if let Some(record) = self.peers.write().await.get_mut(address) {
            record.admission = state;
        }
    }

    pub async fn record_probe_success(&self, address: &str, name: String) {
        if let Some(record) = self.peers.write().await.get_mut(address) {
            record.name = Some(name);
            record.failed_probes = 0;
            record.last_seen = Instant::now();
        }
    }

    /// Count a failed probe; returns the number of consecutive failures.
    pub async fn record_probe_failure(&self, address: &str) -> u32 {
        match self.peers.write().await.get_mut(address) {
            Some(record) => {
                record.failed_probes += 1;
                record.failed_probes
            }
            None => 0,
        }
    }

    pub async fn get(&self, address: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(address).cloned()
    }

    pub async fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.peers.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
