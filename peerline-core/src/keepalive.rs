//! Periodic PING/PONG keep-alive and RTT measurement.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Tracks in-flight PINGs per peer: `msg_id -> send_time`.
pub struct KeepAlive {
    pending: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepAlive {
    pub fn new() -> Self {
        KeepAlive {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Records that a PING with `msg_id` was just sent to `peer_id`.
    pub fn record_ping_sent(&self, peer_id: &str, msg_id: &str) {
        let mut pending = self.pending.lock();
        pending
            .entry(peer_id.to_string())
            .or_default()
            .insert(msg_id.to_string(), Instant::now());
    }

    /// A PING send failed; roll back the pending entry.
    pub fn rollback_ping(&self, peer_id: &str, msg_id: &str) {
        let mut pending = self.pending.lock();
        if let Some(table) = pending.get_mut(peer_id) {
            table.remove(msg_id);
        }
    }

    /// Handles a PONG, returning the measured RTT in milliseconds if the
    /// `msg_id` matched a pending PING.
    pub fn handle_pong(&self, peer_id: &str, msg_id: &str) -> Option<f64> {
        let mut pending = self.pending.lock();
        let table = pending.get_mut(peer_id)?;
        let sent_at = table.remove(msg_id)?;
        Some(sent_at.elapsed().as_secs_f64() * 1000.0)
    }

    /// Drops all pending PINGs for a peer, e.g. on disconnect.
    pub fn clear_peer(&self, peer_id: &str) {
        self.pending.lock().remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn pong_matching_pending_ping_yields_rtt() {
        let ka = KeepAlive::new();
        ka.record_ping_sent("b@ns", "p1");
        sleep(Duration::from_millis(5));
        let rtt = ka.handle_pong("b@ns", "p1");
        assert!(rtt.is_some());
        assert!(rtt.unwrap() >= 5.0);
    }

    #[test]
    fn pong_for_unknown_msg_id_is_ignored() {
        let ka = KeepAlive::new();
        ka.record_ping_sent("b@ns", "p1");
        assert!(ka.handle_pong("b@ns", "other").is_none());
    }

    #[test]
    fn clear_peer_drops_all_pending() {
        let ka = KeepAlive::new();
        ka.record_ping_sent("b@ns", "p1");
        ka.record_ping_sent("b@ns", "p2");
        ka.clear_peer("b@ns");
        assert!(ka.handle_pong("b@ns", "p1").is_none());
        assert!(ka.handle_pong("b@ns", "p2").is_none());
    }

    #[test]
    fn rollback_removes_only_named_entry() {
        let ka = KeepAlive::new();
        ka.record_ping_sent("b@ns", "p1");
        ka.record_ping_sent("b@ns", "p2");
        ka.rollback_ping("b@ns", "p1");
        assert!(ka.handle_pong("b@ns", "p1").is_none());
        assert!(ka.handle_pong("b@ns", "p2").is_some());
    }
}
