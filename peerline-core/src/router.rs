//! Direct send with ACK tracking, publish fan-out, and single-hop relay.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::msgid;
use crate::wire::Message;

/// Default number of hops a relayed message may still travel.
pub const RELAY_TTL: i64 = 3;

pub struct Router {
    my_peer_id: String,
    ack_timeout: Duration,
    pending_acks: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

/// What the caller should do with an inbound RELAY message.
#[derive(Debug, Clone)]
pub enum RelayDecision {
    /// We are the destination; surface `payload` as coming from `src`.
    DeliverLocally { src: String, payload: String },
    /// Forward `msg` (already TTL-decremented) to `to`.
    Forward { to: String, msg: Message },
    /// No route; drop.
    Drop,
}

impl Router {
    pub fn new(my_peer_id: impl Into<String>, ack_timeout_secs: u64) -> Self {
        Router {
            my_peer_id: my_peer_id.into(),
            ack_timeout: Duration::from_secs(ack_timeout_secs),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a SEND message for `dst`, recording a pending-ACK entry if
    /// `require_ack`. Call `rollback_pending_ack` if dispatch fails.
    pub fn build_direct(&self, dst: &str, payload: impl Into<String>, require_ack: bool) -> Message {
        let msg = Message::send(self.my_peer_id.clone(), dst, payload, require_ack);
        if require_ack {
            self.record_pending_ack(dst, &msg.msg_id);
        }
        msg
    }

    /// Builds one PUB message, sharing `msg_id` across the whole fan-out.
    pub fn build_publish(&self, scope: &str, payload: impl Into<String>) -> Message {
        Message::publish(msgid::generate(), self.my_peer_id.clone(), scope, payload)
    }

    /// Builds a RELAY message with the default hop budget.
    pub fn build_relay(&self, dst: &str, payload: impl Into<String>) -> Message {
        Message::relay(self.my_peer_id.clone(), dst, payload, RELAY_TTL)
    }

    pub fn record_pending_ack(&self, dst: &str, msg_id: &str) {
        let mut pending = self.pending_acks.lock();
        pending
            .entry(dst.to_string())
            .or_default()
            .insert(msg_id.to_string(), Instant::now());
    }

    pub fn rollback_pending_ack(&self, dst: &str, msg_id: &str) {
        let mut pending = self.pending_acks.lock();
        if let Some(table) = pending.get_mut(dst) {
            table.remove(msg_id);
        }
    }

    /// Removes the pending-ACK entry for `(peer_id, msg_id)` if present.
    pub fn handle_ack(&self, peer_id: &str, msg_id: &str) {
        let mut pending = self.pending_acks.lock();
        if let Some(table) = pending.get_mut(peer_id) {
            if let Some(sent_at) = table.remove(msg_id) {
                tracing::debug!(
                    peer = peer_id,
                    msg_id,
                    rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0,
                    "ack received"
                );
            }
        }
    }

    pub fn clear_peer(&self, peer_id: &str) {
        self.pending_acks.lock().remove(peer_id);
    }

    /// Drops pending-ACK entries older than `ack_timeout`, logging a
    /// warning for each. Returns the `(peer_id, msg_id)` pairs dropped.
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<(String, String)> {
        let mut pending = self.pending_acks.lock();
        let mut timed_out = Vec::new();

        pending.retain(|peer_id, table| {
            table.retain(|msg_id, sent_at| {
                let elapsed = now.saturating_duration_since(*sent_at);
                if elapsed > self.ack_timeout {
                    tracing::warn!(peer = peer_id, msg_id, "ack timeout");
                    timed_out.push((peer_id.clone(), msg_id.clone()));
                    false
                } else {
                    true
                }
            });
            !table.is_empty()
        });

        timed_out
    }

    #[cfg(test)]
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().values().map(|t| t.len()).sum()
    }

    /// Handles an inbound RELAY message: deliver locally, forward one hop,
    /// or drop if the TTL is exhausted or no route exists.
    pub fn handle_relay(&self, from_peer: &str, msg: &Message, connected: &[String]) -> RelayDecision {
        let (src, dst, payload) = match &msg.body {
            crate::wire::MessageBody::RELAY { src, dst, payload } => (src.clone(), dst.clone(), payload.clone()),
            _ => return RelayDecision::Drop,
        };

        if msg.ttl <= 0 {
            tracing::warn!(from = src, to = dst, "dropping relay message, ttl expired");
            return RelayDecision::Drop;
        }

        let decremented = Message::relay(src.clone(), dst.clone(), payload.clone(), msg.ttl - 1);
        let mut decremented = decremented;
        decremented.msg_id = msg.msg_id.clone();

        if dst == self.my_peer_id {
            tracing::info!(from = src, via = from_peer, "relay received, delivering locally");
            return RelayDecision::DeliverLocally { src, payload };
        }

        if connected.iter().any(|p| p == &dst) {
            return RelayDecision::Forward { to: dst, msg: decremented };
        }

        match find_relay_peer(connected, &[from_peer, &dst]) {
            Some(next_hop) => RelayDecision::Forward { to: next_hop, msg: decremented },
            None => {
                tracing::warn!(to = dst, "cannot relay, no route available");
                RelayDecision::Drop
            }
        }
    }
}

/// Picks the first connected peer not in `exclude`.
pub fn find_relay_peer(connected: &[String], exclude: &[&str]) -> Option<String> {
    connected
        .iter()
        .find(|p| !exclude.contains(&p.as_str()))
        .cloned()
}
