//! Events the client core emits to an external observer (CLI, test harness).

/// Events delivered over the client's outbound event channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// Successfully registered with the rendezvous server.
    Registered { public_ip: String },

    /// A peer connection was established, inbound or outbound.
    PeerConnected { peer_id: String, direction: Direction },

    /// A peer connection was lost.
    PeerDisconnected { peer_id: String },

    /// A peer's reconnect budget was exhausted, or it dropped out of discovery.
    PeerStale { peer_id: String },

    /// A direct SEND was delivered to us.
    Message { from: String, payload: String },

    /// A PUB was delivered to us.
    Published {
        from: String,
        scope: String,
        payload: String,
    },

    /// A RELAY addressed to us arrived (possibly via an intermediate peer).
    Relayed { from: String, payload: String },

    /// An RTT sample was recorded for a peer.
    RttUpdated { peer_id: String, rtt_ms: f64 },

    /// A recoverable error worth surfacing to the operator.
    Error { message: String },
}

/// Direction of an established peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}
