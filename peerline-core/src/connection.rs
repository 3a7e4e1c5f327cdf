//! One established TCP peer session: a reader task that decodes and
//! dispatches messages synchronously, and a writer task that owns the
//! write half and serializes sends via its inbound channel.

use std::future::Future;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event::Direction;
use crate::wire::{self, Message};

const SEND_CHANNEL_CAPACITY: usize = 64;

/// A live peer connection: a writer-task handle plus bookkeeping.
///
/// Serialization of outbound writes comes from the single writer task
/// owning the socket's write half, not from a held mutex — the mpsc
/// channel itself is the send lock.
pub struct PeerConnection {
    pub peer_id: String,
    pub direction: Direction,
    pub connected_at: std::time::Instant,
    write_tx: mpsc::Sender<Message>,
    stop_tx: watch::Sender<bool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl PeerConnection {
    /// Splits `stream` and spawns its reader/writer tasks. `on_message` is
    /// invoked synchronously, in line-arrival order, from the reader task;
    /// `on_disconnect` fires exactly once, whether the peer closed the
    /// socket or `stop()` was called.
    pub fn spawn<M, Fut, D>(
        peer_id: String,
        direction: Direction,
        stream: TcpStream,
        on_message: M,
        on_disconnect: D,
    ) -> Self
    where
        M: Fn(String, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        D: FnOnce(String) + Send + 'static,
    {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel::<Message>(SEND_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let writer_handle = tokio::spawn(writer_loop(write_half, write_rx, stop_rx.clone(), peer_id.clone()));
        let reader_handle = tokio::spawn(reader_loop(read_half, stop_rx, peer_id.clone(), on_message, on_disconnect));

        PeerConnection {
            peer_id,
            direction,
            connected_at: std::time::Instant::now(),
            write_tx,
            stop_tx,
            reader_handle,
            writer_handle,
        }
    }

    /// Enqueues `msg` for the writer task. Returns `false` if the
    /// connection is gone; the caller does not retry.
    pub async fn send(&self, msg: Message) -> bool {
        self.write_tx.send(msg).await.is_ok()
    }

    /// Signals both tasks to stop. `on_disconnect` still fires once, from
    /// the reader task noticing the stop signal.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn writer_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Message>,
    mut stop_rx: watch::Receiver<bool>,
    peer_id: String,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                break;
            }
            maybe_msg = write_rx.recv() => {
                let Some(msg) = maybe_msg else { break };
                let line = match wire::encode(&msg) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::error!(peer = %peer_id, error = %err, "failed to encode outgoing message");
                        continue;
                    }
                };
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    tracing::warn!(peer = %peer_id, error = %err, "write failed, closing connection");
                    break;
                }
                if let Err(err) = write_half.write_all(b"\n").await {
                    tracing::warn!(peer = %peer_id, error = %err, "write failed, closing connection");
                    break;
                }
                if let Err(err) = write_half.flush().await {
                    tracing::warn!(peer = %peer_id, error = %err, "flush failed, closing connection");
                    break;
                }
            }
        }
    }
}

async fn reader_loop<M, Fut, D>(
    read_half: tokio::net::tcp::OwnedReadHalf,
    mut stop_rx: watch::Receiver<bool>,
    peer_id: String,
    on_message: M,
    on_disconnect: D,
) where
    M: Fn(String, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    D: FnOnce(String) + Send + 'static,
{
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                break;
            }
            line_result = lines.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        if line.len() > wire::MAX_LINE_BYTES {
                            tracing::error!(peer = %peer_id, "line too long, dropping");
                            continue;
                        }
                        match wire::decode(&line) {
                            Ok(msg) => on_message(peer_id.clone(), msg).await,
                            Err(err) => {
                                tracing::error!(peer = %peer_id, error = %err, "invalid message, skipping line");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!(peer = %peer_id, "connection closed by peer");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer_id, error = %err, "read error, closing connection");
                        break;
                    }
                }
            }
        }
    }

    on_disconnect(peer_id);
}
