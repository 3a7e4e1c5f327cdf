//! Peer table: known peers, their status, RTT samples, and the reconnect
//! scheduler's bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_RTT_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Stale,
}

/// One entry returned by the rendezvous server's DISCOVER response.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub port: u16,
}

impl DiscoveredPeer {
    pub fn peer_id(&self) -> String {
        format!("{}@{}", self.name, self.namespace)
    }
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
    pub namespace: String,
    pub name: String,
    pub status: PeerStatus,
    pub last_seen: Option<Instant>,
    pub reconnect_attempts: u32,
    pub rtt_samples: VecDeque<f64>,
    last_attempt: Option<Instant>,
}

impl PeerInfo {
    fn new(peer_id: String, ip: String, port: u16, namespace: String, name: String) -> Self {
        PeerInfo {
            peer_id,
            ip,
            port,
            namespace,
            name,
            status: PeerStatus::Disconnected,
            last_seen: None,
            reconnect_attempts: 0,
            rtt_samples: VecDeque::with_capacity(MAX_RTT_SAMPLES),
            last_attempt: None,
        }
    }

    pub fn avg_rtt(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64)
    }

    pub fn add_rtt_sample(&mut self, rtt_ms: f64) {
        self.rtt_samples.push_back(rtt_ms);
        if self.rtt_samples.len() > MAX_RTT_SAMPLES {
            self.rtt_samples.pop_front();
        }
    }
}

pub struct PeerTable {
    peers: Mutex<HashMap<String, PeerInfo>>,
    max_reconnect_attempts: u32,
    backoff_base: u64,
    backoff_max: u64,
    stale_notifications: Mutex<Vec<String>>,
}

impl PeerTable {
    pub fn new(max_reconnect_attempts: u32, backoff_base: u64, backoff_max: u64) -> Self {
        PeerTable {
            peers: Mutex::new(HashMap::new()),
            max_reconnect_attempts,
            backoff_base,
            backoff_max,
            stale_notifications: Mutex::new(Vec::new()),
        }
    }

    /// Drains the peer IDs that transitioned to STALE since the last call,
    /// for the caller to surface as events.
    pub fn drain_stale_notifications(&self) -> Vec<String> {
        std::mem::take(&mut *self.stale_notifications.lock())
    }

    /// Updates the table with a fresh discovery batch: refreshes known
    /// peers' addresses, adds new ones, and marks any peer missing from
    /// this batch (and not currently connected) as stale.
    pub fn update_peers(&self, discovered: &[DiscoveredPeer], my_peer_id: &str) {
        let mut peers = self.peers.lock();
        let mut discovered_ids = std::collections::HashSet::new();

        for d in discovered {
            let peer_id = d.peer_id();
            if peer_id == my_peer_id {
                continue;
            }
            discovered_ids.insert(peer_id.clone());

            match peers.get_mut(&peer_id) {
                Some(existing) => {
                    existing.ip = d.ip.clone();
                    existing.port = d.port;
                    if existing.status == PeerStatus::Stale {
                        existing.status = PeerStatus::Disconnected;
                        existing.reconnect_attempts = 0;
                    }
                }
                None => {
                    let info = PeerInfo::new(
                        peer_id.clone(),
                        d.ip.clone(),
                        d.port,
                        d.namespace.clone(),
                        d.name.clone(),
                    );
                    tracing::info!(peer = %peer_id, "new peer discovered");
                    peers.insert(peer_id, info);
                }
            }
        }

        for (peer_id, info) in peers.iter_mut() {
            if !discovered_ids.contains(peer_id) && info.status != PeerStatus::Connected {
                if info.status != PeerStatus::Stale {
                    tracing::info!(peer = %peer_id, "peer marked as stale (dropped from discovery)");
                    self.stale_notifications.lock().push(peer_id.clone());
                }
                info.status = PeerStatus::Stale;
            }
        }
    }

    pub fn mark_connected(&self, peer_id: &str) {
        let mut peers = self.peers.lock();
        if let Some(info) = peers.get_mut(peer_id) {
            info.status = PeerStatus::Connected;
            info.reconnect_attempts = 0;
        }
    }

    pub fn mark_disconnected(&self, peer_id: &str) {
        let mut peers = self.peers.lock();
        if let Some(info) = peers.get_mut(peer_id) {
            info.status = PeerStatus::Disconnected;
        }
    }

    /// A dial attempt scheduled by the reconnect loop failed; revert to
    /// DISCONNECTED without touching `reconnect_attempts` (already bumped).
    pub fn mark_reconnect_failed(&self, peer_id: &str) {
        self.mark_disconnected(peer_id);
    }

    /// Inserts a PeerInfo for an inbound connection from a peer not yet
    /// seen in discovery, directly as CONNECTED.
    pub fn insert_unknown_connected(&self, peer_id: &str) {
        let mut peers = self.peers.lock();
        if let Some(existing) = peers.get_mut(peer_id) {
            existing.status = PeerStatus::Connected;
            existing.reconnect_attempts = 0;
            return;
        }
        let (name, namespace) = match peer_id.split_once('@') {
            Some((n, ns)) => (n.to_string(), ns.to_string()),
            None => (peer_id.to_string(), String::new()),
        };
        let mut info = PeerInfo::new(peer_id.to_string(), "unknown".to_string(), 0, namespace, name);
        info.status = PeerStatus::Connected;
        peers.insert(peer_id.to_string(), info);
    }

    pub fn add_rtt_sample(&self, peer_id: &str, rtt_ms: f64) {
        let mut peers = self.peers.lock();
        if let Some(info) = peers.get_mut(peer_id) {
            info.add_rtt_sample(rtt_ms);
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.lock().get(peer_id).cloned()
    }

    pub fn all(&self) -> HashMap<String, PeerInfo> {
        self.peers.lock().clone()
    }

    pub fn force_reconnect(&self) {
        let mut peers = self.peers.lock();
        for info in peers.values_mut() {
            if info.status == PeerStatus::Disconnected {
                info.reconnect_attempts = 0;
            }
        }
        tracing::info!("forced reconnection for all disconnected peers");
    }

    /// Computes which DISCONNECTED peers are due for a dial attempt at `now`,
    /// transitioning them to CONNECTING (or STALE if exhausted) as it goes.
    /// A peer is only dialed once `now - last_attempt >= backoff`; unlike
    /// a fixed-interval retry, this actually gates on elapsed time.
    pub fn due_for_reconnect(&self, now: Instant) -> Vec<PeerInfo> {
        let mut peers = self.peers.lock();
        let mut due = Vec::new();

        for info in peers.values_mut() {
            if info.status != PeerStatus::Disconnected {
                continue;
            }

            if info.reconnect_attempts >= self.max_reconnect_attempts {
                info.status = PeerStatus::Stale;
                tracing::warn!(
                    peer = %info.peer_id,
                    attempts = info.reconnect_attempts,
                    max = self.max_reconnect_attempts,
                    "giving up on peer, marking stale"
                );
                self.stale_notifications.lock().push(info.peer_id.clone());
                continue;
            }

            let backoff = Duration::from_secs(
                self.backoff_base
                    .saturating_pow(info.reconnect_attempts)
                    .min(self.backoff_max),
            );

            let ready = match info.last_attempt {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= backoff,
            };
            if !ready {
                continue;
            }

            info.status = PeerStatus::Connecting;
            info.reconnect_attempts += 1;
            info.last_attempt = Some(now);
            due.push(info.clone());
        }

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(name: &str, namespace: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 7000,
        }
    }

    #[test]
    fn new_peer_starts_disconnected() {
        let table = PeerTable::new(5, 2, 60);
        table.update_peers(&[discovered("b", "ns")], "a@ns");
        let peer = table.get("b@ns").unwrap();
        assert_eq!(peer.status, PeerStatus::Disconnected);
        assert_eq!(peer.reconnect_attempts, 0);
    }

    #[test]
    fn self_is_skipped_in_discovery() {
        let table = PeerTable::new(5, 2, 60);
        table.update_peers(&[discovered("a", "ns")], "a@ns");
        assert!(table.get("a@ns").is_none());
    }

    #[test]
    fn disappearing_peer_becomes_stale_unless_connected() {
        let table = PeerTable::new(5, 2, 60);
        table.update_peers(&[discovered("b", "ns")], "a@ns");
        table.mark_connected("b@ns");
        table.update_peers(&[], "a@ns");
        assert_eq!(table.get("b@ns").unwrap().status, PeerStatus::Connected);

        table.update_peers(&[discovered("c", "ns")], "a@ns");
        table.update_peers(&[], "a@ns");
        assert_eq!(table.get("c@ns").unwrap().status, PeerStatus::Stale);
    }

    #[test]
    fn stale_peer_reappearing_resets_to_disconnected() {
        let table = PeerTable::new(5, 2, 60);
        table.update_peers(&[discovered("b", "ns")], "a@ns");
        table.update_peers(&[], "a@ns");
        assert_eq!(table.get("b@ns").unwrap().status, PeerStatus::Stale);

        table.update_peers(&[discovered("b", "ns")], "a@ns");
        let peer = table.get("b@ns").unwrap();
        assert_eq!(peer.status, PeerStatus::Disconnected);
        assert_eq!(peer.reconnect_attempts, 0);
    }

    #[test]
    fn rtt_samples_bounded_to_ten_most_recent() {
        let mut info = PeerInfo::new("b@ns".into(), "ip".into(), 1, "ns".into(), "b".into());
        for i in 0..15 {
            info.add_rtt_sample(i as f64);
        }
        assert_eq!(info.rtt_samples.len(), 10);
        assert_eq!(info.rtt_samples.front().copied(), Some(5.0));
        assert_eq!(info.rtt_samples.back().copied(), Some(14.0));
    }

    #[test]
    fn reconnect_gated_on_last_attempt_backoff() {
        let table = PeerTable::new(5, 2, 60);
        table.update_peers(&[discovered("b", "ns")], "a@ns");

        let t0 = Instant::now();
        let due = table.due_for_reconnect(t0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reconnect_attempts, 1);

        // peer is now CONNECTING, not DISCONNECTED, so it's not due again.
        let due_again = table.due_for_reconnect(t0);
        assert!(due_again.is_empty());

        // simulate the dial failing, peer reverts to DISCONNECTED.
        table.mark_reconnect_failed("b@ns");

        // backoff for attempt 1 is base^1 = 2s; not yet due.
        let too_soon = table.due_for_reconnect(t0 + Duration::from_millis(500));
        assert!(too_soon.is_empty());

        let due_later = table.due_for_reconnect(t0 + Duration::from_secs(3));
        assert_eq!(due_later.len(), 1);
        assert_eq!(due_later[0].reconnect_attempts, 2);
    }

    #[test]
    fn exhausted_budget_marks_stale() {
        let table = PeerTable::new(1, 2, 60);
        table.update_peers(&[discovered("z", "ns")], "a@ns");

        let t0 = Instant::now();
        let due = table.due_for_reconnect(t0);
        assert_eq!(due.len(), 1);
        table.mark_reconnect_failed("z@ns");

        let due2 = table.due_for_reconnect(t0 + Duration::from_secs(10));
        assert!(due2.is_empty());
        assert_eq!(table.get("z@ns").unwrap().status, PeerStatus::Stale);
    }

    #[test]
    fn force_reconnect_resets_attempts_on_disconnected_only() {
        let table = PeerTable::new(5, 2, 60);
        table.update_peers(&[discovered("b", "ns")], "a@ns");
        table.due_for_reconnect(Instant::now());
        table.mark_reconnect_failed("b@ns");
        assert_eq!(table.get("b@ns").unwrap().reconnect_attempts, 1);

        table.force_reconnect();
        assert_eq!(table.get("b@ns").unwrap().reconnect_attempts, 0);
    }
}
