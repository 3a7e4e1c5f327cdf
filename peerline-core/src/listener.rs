//! Accepts inbound TCP connections and performs the server-side half of
//! the HELLO/HELLO_OK handshake; also provides the symmetric dialer-side
//! handshake used by the client core when connecting out.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::DialError;
use crate::wire::{self, Message, MessageBody};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PeerListener {
    listener: TcpListener,
}

impl PeerListener {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(PeerListener { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one inbound socket and runs the server-side handshake.
    /// A handshake failure is logged and `None` is returned so the accept
    /// loop can continue without tearing down the listener.
    pub async fn accept_and_handshake(
        &self,
        my_peer_id: &str,
    ) -> std::io::Result<Option<(String, TcpStream)>> {
        let (stream, addr) = self.listener.accept().await?;
        match handshake_as_acceptor(stream, my_peer_id).await {
            Ok((peer_id, stream)) => Ok(Some((peer_id, stream))),
            Err(err) => {
                tracing::warn!(%addr, error = %err, "inbound handshake failed");
                Ok(None)
            }
        }
    }
}

/// Server-side half of the handshake: read HELLO, reply HELLO_OK.
async fn handshake_as_acceptor(
    stream: TcpStream,
    my_peer_id: &str,
) -> Result<(String, TcpStream), DialError> {
    let fut = async {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| handshake_err("?", e.to_string()))?;
        if n == 0 {
            return Err(handshake_err("?", "connection closed before HELLO"));
        }

        let msg = wire::decode(line.trim_end()).map_err(|e| handshake_err("?", e.to_string()))?;
        let remote_peer_id = match &msg.body {
            MessageBody::HELLO { src, .. } => src.clone(),
            other => return Err(handshake_err("?", format!("expected HELLO, got {other:?}"))),
        };

        let mut stream = reader.into_inner();
        let hello_ok = Message::hello_ok(my_peer_id);
        let out_line = wire::encode(&hello_ok).map_err(|e| handshake_err(&remote_peer_id, e.to_string()))?;
        stream
            .write_all(format!("{out_line}\n").as_bytes())
            .await
            .map_err(|e| handshake_err(&remote_peer_id, e.to_string()))?;

        Ok((remote_peer_id, stream))
    };

    timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| DialError::Timeout("inbound handshake".to_string()))?
}

/// Dialer-side half of the handshake: send HELLO, await HELLO_OK.
pub async fn handshake_as_dialer(
    stream: TcpStream,
    my_peer_id: &str,
    remote_peer_id: &str,
) -> Result<TcpStream, DialError> {
    let fut = async {
        let mut stream = stream;
        let hello = Message::hello(my_peer_id);
        let line = wire::encode(&hello).map_err(|e| handshake_err(remote_peer_id, e.to_string()))?;
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| handshake_err(remote_peer_id, e.to_string()))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let n = reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| handshake_err(remote_peer_id, e.to_string()))?;
        if n == 0 {
            return Err(handshake_err(
                remote_peer_id,
                "connection closed before HELLO_OK",
            ));
        }

        let msg = wire::decode(response_line.trim_end())
            .map_err(|e| handshake_err(remote_peer_id, e.to_string()))?;
        match &msg.body {
            MessageBody::HELLO_OK { .. } => Ok(reader.into_inner()),
            other => Err(handshake_err(remote_peer_id, format!("expected HELLO_OK, got {other:?}"))),
        }
    };

    timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| DialError::Timeout(remote_peer_id.to_string()))?
}

fn handshake_err(peer_id: &str, reason: impl Into<String>) -> DialError {
    DialError::Handshake {
        peer_id: peer_id.to_string(),
        reason: reason.into(),
    }
}
