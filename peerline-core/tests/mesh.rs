//! End-to-end tests driving real [`ClientCore`] instances over real TCP
//! sockets, backed by an in-process stub rendezvous server. No external
//! services are required.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peerline_core::config::{Config, ConnectionConfig, LoggingConfig, PeerConfig, RendezvousConfig};
use peerline_core::{ClientCore, Event};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Registry(Arc<Mutex<Vec<Value>>>);

/// Minimal stand-in for the rendezvous directory: one TCP accept loop,
/// one JSON line in, one JSON line out, same contract as the real thing.
async fn spawn_stub_rendezvous() -> (u16, Registry) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let registry = Registry::default();

    let reg = registry.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let reg = reg.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let request: Value = match serde_json::from_str(line.trim()) {
                    Ok(v) => v,
                    Err(_) => return,
                };

                let response = handle_request(&reg, &request);
                let mut stream = reader.into_inner();
                let out = format!("{}\n", serde_json::to_string(&response).unwrap());
                let _ = stream.write_all(out.as_bytes()).await;
            });
        }
    });

    (port, registry)
}

fn handle_request(reg: &Registry, request: &Value) -> Value {
    match request.get("type").and_then(|v| v.as_str()) {
        Some("REGISTER") => {
            let mut entries = reg.0.lock();
            entries.retain(|e| {
                !(e["name"] == request["name"] && e["namespace"] == request["namespace"])
            });
            entries.push(json!({
                "name": request["name"],
                "namespace": request["namespace"],
                "ip": "127.0.0.1",
                "port": request["port"],
            }));
            json!({"status": "OK", "ip": "127.0.0.1"})
        }
        Some("DISCOVER") => {
            let entries = reg.0.lock();
            let namespace = request.get("namespace").and_then(|v| v.as_str());
            let peers: Vec<Value> = entries
                .iter()
                .filter(|e| namespace.is_none_or(|ns| e["namespace"] == ns))
                .cloned()
                .collect();
            json!({"status": "OK", "peers": peers})
        }
        Some("UNREGISTER") => {
            let mut entries = reg.0.lock();
            entries.retain(|e| {
                !(e["name"] == request["name"] && e["namespace"] == request["namespace"])
            });
            json!({"status": "OK"})
        }
        _ => json!({"status": "ERROR", "reason": "unknown request type"}),
    }
}

fn test_config(namespace: &str, name: &str, port: u16, rendezvous_port: u16) -> Config {
    Config {
        peer: PeerConfig { namespace: namespace.to_string(), name: name.to_string(), port },
        rendezvous: RendezvousConfig { host: "127.0.0.1".to_string(), port: rendezvous_port },
        connection: ConnectionConfig {
            ping_interval: 1,
            ack_timeout: 2,
            discovery_interval: 1,
            max_reconnect_attempts: 3,
            reconnect_backoff_base: 1,
            reconnect_backoff_max: 2,
        },
        logging: None::<LoggingConfig>,
    }
}

async fn wait_for<F: Fn(&Event) -> bool>(rx: &mut mpsc::Receiver<Event>, predicate: F, desc: &str) -> Event {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(evt) if predicate(&evt) => return evt,
                Some(_) => continue,
                None => panic!("event channel closed while waiting for: {desc}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for: {desc}"))
}

#[tokio::test]
async fn handshake_discovery_and_direct_message() {
    let (rendezvous_port, _registry) = spawn_stub_rendezvous().await;

    let (a, mut a_events) = ClientCore::new(test_config("room1", "alice", 18801, rendezvous_port));
    peerline_core::client::start(&a).await.unwrap();

    let (b, mut b_events) = ClientCore::new(test_config("room1", "bob", 18802, rendezvous_port));
    peerline_core::client::start(&b).await.unwrap();

    wait_for(&mut a_events, |e| matches!(e, Event::PeerConnected { .. }), "alice connects to bob").await;
    wait_for(&mut b_events, |e| matches!(e, Event::PeerConnected { .. }), "bob connects to alice").await;

    assert!(a.cmd_msg("bob@room1", "hello bob").await);

    let event = wait_for(&mut b_events, |e| matches!(e, Event::Message { .. }), "bob receives message").await;
    match event {
        Event::Message { from, payload } => {
            assert_eq!(from, "alice@room1");
            assert_eq!(payload, "hello bob");
        }
        _ => unreachable!(),
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn ping_pong_measures_rtt() {
    let (rendezvous_port, _registry) = spawn_stub_rendezvous().await;

    let (a, mut a_events) = ClientCore::new(test_config("room1", "alice", 18811, rendezvous_port));
    peerline_core::client::start(&a).await.unwrap();
    let (b, mut b_events) = ClientCore::new(test_config("room1", "bob", 18812, rendezvous_port));
    peerline_core::client::start(&b).await.unwrap();

    wait_for(&mut a_events, |e| matches!(e, Event::PeerConnected { .. }), "alice connects").await;
    wait_for(&mut b_events, |e| matches!(e, Event::PeerConnected { .. }), "bob connects").await;

    let event = wait_for(&mut a_events, |e| matches!(e, Event::RttUpdated { .. }), "alice gets an rtt sample").await;
    match event {
        Event::RttUpdated { peer_id, rtt_ms } => {
            assert_eq!(peer_id, "bob@room1");
            assert!(rtt_ms >= 0.0);
        }
        _ => unreachable!(),
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn publish_reaches_every_connected_peer() {
    let (rendezvous_port, _registry) = spawn_stub_rendezvous().await;

    let (a, mut a_events) = ClientCore::new(test_config("room1", "alice", 18821, rendezvous_port));
    peerline_core::client::start(&a).await.unwrap();
    let (b, mut b_events) = ClientCore::new(test_config("room1", "bob", 18822, rendezvous_port));
    peerline_core::client::start(&b).await.unwrap();
    let (c, mut c_events) = ClientCore::new(test_config("room1", "carol", 18823, rendezvous_port));
    peerline_core::client::start(&c).await.unwrap();

    for rx in [&mut a_events, &mut b_events, &mut c_events] {
        wait_for(rx, |e| matches!(e, Event::PeerConnected { .. }), "peer connects").await;
    }
    // each node connects to the other two.
    wait_for(&mut a_events, |e| matches!(e, Event::PeerConnected { .. }), "alice's second peer").await;
    wait_for(&mut b_events, |e| matches!(e, Event::PeerConnected { .. }), "bob's second peer").await;
    wait_for(&mut c_events, |e| matches!(e, Event::PeerConnected { .. }), "carol's second peer").await;

    let sent = a.cmd_pub("*", "hello everyone").await;
    assert_eq!(sent, 2);

    for rx in [&mut b_events, &mut c_events] {
        let event = wait_for(rx, |e| matches!(e, Event::Published { .. }), "peer receives publish").await;
        match event {
            Event::Published { from, scope, payload } => {
                assert_eq!(from, "alice@room1");
                assert_eq!(scope, "*");
                assert_eq!(payload, "hello everyone");
            }
            _ => unreachable!(),
        }
    }

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn relay_message_addressed_to_us_is_delivered_locally() {
    let (rendezvous_port, _registry) = spawn_stub_rendezvous().await;

    let (b, mut b_events) = ClientCore::new(test_config("room1", "bob", 18831, rendezvous_port));
    peerline_core::client::start(&b).await.unwrap();
    wait_for(&mut b_events, |e| matches!(e, Event::Registered { .. }), "bob registers").await;

    // Discover bob's listening port the same way a real peer would: ask
    // the stub rendezvous server directly.
    let bob_port = {
        let mut stream = TcpStream::connect(("127.0.0.1", rendezvous_port)).await.unwrap();
        stream.write_all(b"{\"type\":\"DISCOVER\",\"namespace\":\"room1\"}\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let resp: Value = serde_json::from_str(line.trim()).unwrap();
        resp["peers"][0]["port"].as_u64().unwrap() as u16
    };

    // Connect as a third peer that bob has never discovered, and hand off
    // a RELAY message addressed to bob, as if forwarded by an intermediate.
    let stream = TcpStream::connect(("127.0.0.1", bob_port)).await.unwrap();
    let mut stream = peerline_core::listener::handshake_as_dialer(stream, "ghost@room1", "bob@room1")
        .await
        .unwrap();

    let relay = peerline_core::Message::relay("carol@room1", "bob@room1", "relayed hello", 2);
    let line = format!("{}\n", peerline_core::wire::encode(&relay).unwrap());
    stream.write_all(line.as_bytes()).await.unwrap();

    let event = wait_for(&mut b_events, |e| matches!(e, Event::Relayed { .. }), "bob delivers the relay locally").await;
    match event {
        Event::Relayed { from, payload } => {
            assert_eq!(from, "carol@room1");
            assert_eq!(payload, "relayed hello");
        }
        _ => unreachable!(),
    }

    b.stop().await;
}

#[tokio::test]
async fn exhausted_reconnect_budget_surfaces_stale_event() {
    let (rendezvous_port, registry) = spawn_stub_rendezvous().await;

    // Register a peer entry that points at a port nothing is listening on,
    // so every dial attempt fails and the budget exhausts quickly.
    registry.0.lock().push(json!({
        "name": "ghost",
        "namespace": "room1",
        "ip": "127.0.0.1",
        "port": 1u16,
    }));

    let mut config = test_config("room1", "alice", 18841, rendezvous_port);
    config.connection.max_reconnect_attempts = 1;
    config.connection.reconnect_backoff_base = 1;
    config.connection.reconnect_backoff_max = 1;

    let (a, mut a_events) = ClientCore::new(config);
    peerline_core::client::start(&a).await.unwrap();

    let event = timeout(Duration::from_secs(15), async {
        loop {
            match a_events.recv().await {
                Some(e @ Event::PeerStale { .. }) => return e,
                Some(_) => continue,
                None => panic!("event channel closed before stale event"),
            }
        }
    })
    .await
    .expect("timed out waiting for a stale event");

    match event {
        Event::PeerStale { peer_id } => assert_eq!(peer_id, "ghost@room1"),
        _ => unreachable!(),
    }

    a.stop().await;
}
