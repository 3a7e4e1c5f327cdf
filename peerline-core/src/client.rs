//! Orchestrates connection lifecycle, discovery, keep-alive, and message
//! dispatch. `ClientCore` owns the connection map and the peer table;
//! every other component is driven through it.
//!
//! Functions that need to hand a copy of the client to a spawned task or
//! to a [`PeerConnection`] callback take an explicit `core: &Arc<ClientCore>`
//! parameter rather than an `Arc<Self>` receiver, so the task or callback
//! gets its own owned handle instead of borrowing one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::Config;
use crate::connection::PeerConnection;
use crate::error::DialError;
use crate::event::{Direction, Event};
use crate::keepalive::KeepAlive;
use crate::listener::{self, PeerListener};
use crate::rendezvous::RendezvousClient;
use crate::router::{RelayDecision, Router};
use crate::table::{PeerInfo, PeerStatus, PeerTable};
use crate::wire::{Message, MessageBody};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_TICK: Duration = Duration::from_secs(5);
const ACK_TIMEOUT_TICK: Duration = Duration::from_secs(1);
const BACKGROUND_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

struct CoreState {
    connections: HashMap<String, Arc<PeerConnection>>,
    connecting: HashSet<String>,
}

/// A snapshot of one active connection, for the `/conn` command.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub peer_id: String,
    pub direction: Direction,
    pub connected_secs: f64,
}

pub struct ClientCore {
    peer_id: String,
    config: Config,
    state: Mutex<CoreState>,
    table: PeerTable,
    router: Router,
    keepalive: KeepAlive,
    rendezvous: RendezvousClient,
    public_ip: Mutex<Option<String>>,
    event_tx: mpsc::Sender<Event>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientCore {
    pub fn new(config: Config) -> (Arc<ClientCore>, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer_id = config.peer_id();

        let rendezvous = RendezvousClient::new(config.rendezvous.host.clone(), config.rendezvous.port);
        let table = PeerTable::new(
            config.connection.max_reconnect_attempts,
            config.connection.reconnect_backoff_base,
            config.connection.reconnect_backoff_max,
        );
        let router = Router::new(peer_id.clone(), config.connection.ack_timeout);

        let core = Arc::new(ClientCore {
            peer_id,
            config,
            state: Mutex::new(CoreState {
                connections: HashMap::new(),
                connecting: HashSet::new(),
            }),
            table,
            router,
            keepalive: KeepAlive::new(),
            rendezvous,
            public_ip: Mutex::new(None),
            event_tx,
            shutdown_tx,
            shutdown_rx,
            background: Mutex::new(Vec::new()),
        });

        (core, event_rx)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.state.lock().connections.contains_key(peer_id)
    }

    fn connected_peer_ids(&self) -> Vec<String> {
        self.state.lock().connections.keys().cloned().collect()
    }

    async fn send_to(&self, peer_id: &str, msg: Message) -> bool {
        let conn = self.state.lock().connections.get(peer_id).cloned();
        match conn {
            Some(conn) => conn.send(msg).await,
            None => {
                tracing::warn!(peer = %peer_id, "no connection to peer");
                false
            }
        }
    }

    fn close_connection(&self, peer_id: &str) {
        if let Some(conn) = self.state.lock().connections.get(peer_id) {
            conn.stop();
        }
    }

    fn handle_disconnect(&self, peer_id: String) {
        tracing::info!(peer = %peer_id, "peer disconnected");
        self.state.lock().connections.remove(&peer_id);
        self.table.mark_disconnected(&peer_id);
        self.keepalive.clear_peer(&peer_id);
        self.router.clear_peer(&peer_id);
        let _ = self.event_tx.try_send(Event::PeerDisconnected { peer_id });
    }

    /// Seven-step shutdown: stop background loops, say BYE to every peer,
    /// give them a moment to reply BYE_OK, close sockets, unregister.
    pub async fn stop(&self) {
        tracing::info!("stopping client core");
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if tokio::time::timeout(BACKGROUND_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("background task did not stop within timeout");
            }
        }

        let peer_ids: Vec<String> = self.state.lock().connections.keys().cloned().collect();
        for peer_id in &peer_ids {
            let bye = Message::bye(self.peer_id.clone(), peer_id.clone(), "client shutting down");
            self.send_to(peer_id, bye).await;
        }
        if !peer_ids.is_empty() {
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        }

        let connections: Vec<Arc<PeerConnection>> = {
            let mut state = self.state.lock();
            state.connecting.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.stop();
        }

        if let Err(err) = self
            .rendezvous
            .unregister(&self.config.peer.namespace, &self.config.peer.name, self.config.peer.port)
            .await
        {
            tracing::warn!(error = %err, "failed to unregister from rendezvous server");
        }

        tracing::info!("client core stopped");
    }

    // ---- command surface, used by the CLI front end ----

    pub async fn cmd_peers(&self, scope: &str) -> Result<Vec<crate::table::DiscoveredPeer>, crate::error::RendezvousError> {
        if scope == "*" {
            self.rendezvous.discover(None).await
        } else if let Some(namespace) = scope.strip_prefix('#') {
            self.rendezvous.discover(Some(namespace)).await
        } else {
            Ok(Vec::new())
        }
    }

    pub async fn cmd_msg(&self, peer_id: &str, payload: &str) -> bool {
        if !self.is_connected(peer_id) {
            return false;
        }
        let msg = self.router.build_direct(peer_id, payload, true);
        let sent = self.send_to(peer_id, msg.clone()).await;
        if !sent {
            self.router.rollback_pending_ack(peer_id, &msg.msg_id);
        }
        sent
    }

    /// Publishes to `*` (all connected peers) or `#namespace`. Returns the
    /// number of peers it was actually sent to.
    pub async fn cmd_pub(&self, scope: &str, payload: &str) -> usize {
        let targets: Vec<String> = if scope == "*" {
            self.connected_peer_ids()
        } else if let Some(namespace) = scope.strip_prefix('#') {
            self.connected_peer_ids()
                .into_iter()
                .filter(|p| p.ends_with(&format!("@{namespace}")))
                .collect()
        } else {
            Vec::new()
        };

        let msg = self.router.build_publish(scope, payload);
        let mut sent = 0;
        for peer_id in targets {
            if self.send_to(&peer_id, msg.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    pub async fn cmd_relay(&self, dst_peer_id: &str, payload: &str) -> bool {
        let connected = self.connected_peer_ids();
        let Some(relay_peer) = crate::router::find_relay_peer(&connected, &[dst_peer_id]) else {
            tracing::warn!(dst = %dst_peer_id, "no relay peer available");
            return false;
        };
        let msg = self.router.build_relay(dst_peer_id, payload);
        self.send_to(&relay_peer, msg).await
    }

    pub fn cmd_conn(&self) -> Vec<ConnectionSummary> {
        self.state
            .lock()
            .connections
            .values()
            .map(|conn| ConnectionSummary {
                peer_id: conn.peer_id.clone(),
                direction: conn.direction,
                connected_secs: conn.connected_at.elapsed().as_secs_f64(),
            })
            .collect()
    }

    pub fn cmd_rtt(&self) -> HashMap<String, PeerInfo> {
        self.table.all()
    }

    pub fn cmd_reconnect(&self) {
        self.table.force_reconnect();
    }
}

/// Registers with the rendezvous server, binds the peer listener, and
/// spawns the accept/discovery/ping/reconnect/ack-timeout background
/// loops. Registration failure is fatal; nothing else has started yet.
pub async fn start(core: &Arc<ClientCore>) -> anyhow::Result<()> {
    tracing::info!(peer_id = %core.peer_id, "starting client core");

    let result = core
        .rendezvous
        .register(&core.config.peer.namespace, &core.config.peer.name, core.config.peer.port)
        .await?;
    tracing::info!(public_ip = %result.public_ip, "registered with rendezvous server");
    *core.public_ip.lock() = Some(result.public_ip.clone());
    let _ = core.event_tx.send(Event::Registered { public_ip: result.public_ip }).await;

    let listener = PeerListener::bind(core.config.peer.port).await?;
    tracing::info!(addr = ?listener.local_addr()?, "peer listener bound");

    let handles = vec![
        spawn_accept_loop(Arc::clone(core), listener),
        spawn_discovery_loop(Arc::clone(core)),
        spawn_ping_loop(Arc::clone(core)),
        spawn_reconnect_loop(Arc::clone(core)),
        spawn_ack_timeout_loop(Arc::clone(core)),
    ];
    *core.background.lock() = handles;

    tracing::info!("client core started");
    Ok(())
}

fn spawn_accept_loop(core: Arc<ClientCore>, listener: PeerListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept_and_handshake(&core.peer_id) => {
                    match accepted {
                        Ok(Some((peer_id, stream))) => register_inbound(&core, peer_id, stream),
                        Ok(None) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "accept loop stopping");
                            break;
                        }
                    }
                }
            }
        }
    })
}

fn spawn_discovery_loop(core: Arc<ClientCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_rx.clone();
        discover_peers(&core).await;

        let mut tick = interval(Duration::from_secs(core.config.connection.discovery_interval.max(1)));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => discover_peers(&core).await,
            }
        }
    })
}

fn spawn_ping_loop(core: Arc<ClientCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_rx.clone();
        let mut tick = interval(Duration::from_secs(core.config.connection.ping_interval.max(1)));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => send_pings(&core).await,
            }
        }
    })
}

fn spawn_reconnect_loop(core: Arc<ClientCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_rx.clone();
        let mut tick = interval(RECONNECT_TICK);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => run_reconnects(&core).await,
            }
        }
    })
}

fn spawn_ack_timeout_loop(core: Arc<ClientCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_rx.clone();
        let mut tick = interval(ACK_TIMEOUT_TICK);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => { core.router.sweep_timeouts(Instant::now()); }
            }
        }
    })
}

async fn discover_peers(core: &Arc<ClientCore>) {
    tracing::info!("discovering peers");
    match core.rendezvous.discover(None).await {
        Ok(peers) => {
            if peers.is_empty() {
                return;
            }
            tracing::info!(count = peers.len(), "discovered peers");
            core.table.update_peers(&peers, &core.peer_id);
            emit_stale_notifications(core).await;

            for d in &peers {
                let peer_id = d.peer_id();
                if peer_id == core.peer_id {
                    continue;
                }
                if let Some(info) = core.table.get(&peer_id) {
                    if info.status == PeerStatus::Disconnected {
                        try_connect(core, &info).await;
                    }
                }
            }
        }
        Err(err) => tracing::error!(error = %err, "discovery failed, will retry next tick"),
    }
}

async fn send_pings(core: &Arc<ClientCore>) {
    for peer_id in core.connected_peer_ids() {
        let ping = Message::ping(now_iso());
        core.keepalive.record_ping_sent(&peer_id, &ping.msg_id);
        if !core.send_to(&peer_id, ping.clone()).await {
            core.keepalive.rollback_ping(&peer_id, &ping.msg_id);
        }
    }
}

async fn run_reconnects(core: &Arc<ClientCore>) {
    let due = core.table.due_for_reconnect(Instant::now());
    emit_stale_notifications(core).await;
    for peer in due {
        try_connect(core, &peer).await;
    }
}

async fn emit_stale_notifications(core: &Arc<ClientCore>) {
    for peer_id in core.table.drain_stale_notifications() {
        let _ = core.event_tx.send(Event::PeerStale { peer_id }).await;
    }
}

async fn try_connect(core: &Arc<ClientCore>, peer: &PeerInfo) {
    match connect_to_peer(core, peer).await {
        Ok(()) => {}
        Err(DialError::AlreadyInProgress(_)) => {}
        Err(err) => {
            tracing::warn!(peer = %peer.peer_id, error = %err, "connect attempt failed");
            core.table.mark_reconnect_failed(&peer.peer_id);
        }
    }
}

/// Dials `peer`, guarded against a concurrent or already-live attempt to
/// the same peer id. Already being connected is success, not failure: a
/// connection can complete (e.g. an inbound handshake) between the caller
/// picking this peer and this function taking the lock.
pub async fn connect_to_peer(core: &Arc<ClientCore>, peer: &PeerInfo) -> Result<(), DialError> {
    {
        let mut state = core.state.lock();
        if state.connections.contains_key(&peer.peer_id) {
            return Ok(());
        }
        if !state.connecting.insert(peer.peer_id.clone()) {
            return Err(DialError::AlreadyInProgress(peer.peer_id.clone()));
        }
    }

    let result = dial(core, peer).await;
    core.state.lock().connecting.remove(&peer.peer_id);
    result
}

async fn dial(core: &Arc<ClientCore>, peer: &PeerInfo) -> Result<(), DialError> {
    let target_ip = match core.public_ip.lock().as_deref() {
        Some(ip) if ip == peer.ip => "127.0.0.1".to_string(),
        _ => peer.ip.clone(),
    };
    let addr = format!("{target_ip}:{}", peer.port);

    tracing::info!(peer = %peer.peer_id, %addr, "connecting to peer");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| DialError::Timeout(peer.peer_id.clone()))?
        .map_err(|source| DialError::Connect {
            peer_id: peer.peer_id.clone(),
            addr: addr.clone(),
            source,
        })?;

    let stream = listener::handshake_as_dialer(stream, &core.peer_id, &peer.peer_id).await?;

    tracing::info!(peer = %peer.peer_id, "connected (outbound)");
    spawn_connection(core, peer.peer_id.clone(), Direction::Outbound, stream);
    core.table.mark_connected(&peer.peer_id);
    Ok(())
}

fn register_inbound(core: &Arc<ClientCore>, peer_id: String, stream: TcpStream) {
    if core.state.lock().connections.contains_key(&peer_id) {
        tracing::warn!(peer = %peer_id, "already connected, closing new inbound");
        return;
    }

    tracing::info!(peer = %peer_id, "connected (inbound)");
    core.table.insert_unknown_connected(&peer_id);
    spawn_connection(core, peer_id, Direction::Inbound, stream);
}

fn spawn_connection(core: &Arc<ClientCore>, peer_id: String, direction: Direction, stream: TcpStream) {
    let dispatch_core = Arc::clone(core);
    let disconnect_core = Arc::clone(core);

    let conn = PeerConnection::spawn(
        peer_id.clone(),
        direction,
        stream,
        move |from, msg| {
            let core = Arc::clone(&dispatch_core);
            async move { dispatch(&core, from, msg).await }
        },
        move |from| disconnect_core.handle_disconnect(from),
    );

    core.state.lock().connections.insert(peer_id.clone(), Arc::new(conn));
    let _ = core.event_tx.try_send(Event::PeerConnected { peer_id, direction });
}

/// Dispatches one inbound message, invoked in line order from the
/// connection's reader task.
async fn dispatch(core: &Arc<ClientCore>, from_peer: String, msg: Message) {
    match msg.body {
        MessageBody::PING { .. } => {
            let pong = Message::pong(msg.msg_id, now_iso());
            core.send_to(&from_peer, pong).await;
        }
        MessageBody::PONG { .. } => {
            if let Some(rtt_ms) = core.keepalive.handle_pong(&from_peer, &msg.msg_id) {
                core.table.add_rtt_sample(&from_peer, rtt_ms);
                let _ = core
                    .event_tx
                    .send(Event::RttUpdated { peer_id: from_peer, rtt_ms })
                    .await;
            }
        }
        MessageBody::SEND { payload, require_ack, .. } => {
            let _ = core
                .event_tx
                .send(Event::Message { from: from_peer.clone(), payload })
                .await;
            if require_ack {
                core.send_to(&from_peer, Message::ack(msg.msg_id)).await;
            }
        }
        MessageBody::PUB { dst, payload, .. } => {
            let _ = core
                .event_tx
                .send(Event::Published { from: from_peer, scope: dst, payload })
                .await;
        }
        MessageBody::ACK => {
            core.router.handle_ack(&from_peer, &msg.msg_id);
        }
        MessageBody::BYE { reason, .. } => {
            tracing::info!(peer = %from_peer, %reason, "received bye");
            let bye_ok = Message::bye_ok(msg.msg_id, core.peer_id.clone(), from_peer.clone());
            core.send_to(&from_peer, bye_ok).await;
            core.close_connection(&from_peer);
        }
        MessageBody::BYE_OK { .. } => {
            tracing::info!(peer = %from_peer, "received bye_ok");
        }
        MessageBody::RELAY { .. } => {
            let connected = core.connected_peer_ids();
            match core.router.handle_relay(&from_peer, &msg, &connected) {
                RelayDecision::DeliverLocally { src, payload } => {
                    let _ = core.event_tx.send(Event::Relayed { from: src, payload }).await;
                }
                RelayDecision::Forward { to, msg } => {
                    core.send_to(&to, msg).await;
                }
                RelayDecision::Drop => {}
            }
        }
        MessageBody::HELLO { .. } | MessageBody::HELLO_OK { .. } => {
            tracing::warn!(peer = %from_peer, "unexpected handshake message on an established connection");
        }
    }
}

fn now_iso() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:09}", now.as_secs(), now.subsec_nanos())
}
