//! Error taxonomy for the peer-networking core.

use std::io;

/// Configuration errors are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("could not read config file {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors talking to the rendezvous directory.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("timed out contacting rendezvous server")]
    Timeout,
    #[error("connection to rendezvous server failed: {0}")]
    Connect(#[source] io::Error),
    #[error("i/o error talking to rendezvous server: {0}")]
    Io(#[from] io::Error),
    #[error("malformed response from rendezvous server: {0}")]
    Malformed(String),
    #[error("rendezvous server returned an error status: {0}")]
    ErrorStatus(String),
}

/// Errors establishing an outbound peer connection.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connect to {peer_id} at {addr} failed: {source}")]
    Connect {
        peer_id: String,
        addr: String,
        source: io::Error,
    },
    #[error("timed out dialing {0}")]
    Timeout(String),
    #[error("handshake with {peer_id} failed: {reason}")]
    Handshake { peer_id: String, reason: String },
    #[error("already connected or connecting to {0}")]
    AlreadyInProgress(String),
}

/// Wire-level decode/encode errors. Never fatal to a connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("line exceeds maximum size of {max} bytes ({actual} bytes)")]
    OversizeLine { max: usize, actual: usize },
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown or missing message type")]
    UnknownType,
}
