//! Line-oriented command REPL driving a [`peerline_core::ClientCore`].

use anyhow::Result;
use peerline_core::{ClientCore, Config, Event};
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(config: Config) -> Result<()> {
    let (core, mut event_rx) = ClientCore::new(config);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(event);
        }
    });

    peerline_core::client::start(&core).await?;
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "error reading stdin");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('/') {
            println!("Commands must start with '/'. Type /help for available commands.");
            continue;
        }

        if process_command(&core, line).await {
            break;
        }
    }

    core.stop().await;
    Ok(())
}

/// Returns `true` if the REPL should exit (`/quit`).
async fn process_command(core: &std::sync::Arc<ClientCore>, line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_ascii_lowercase();
    let args = parts.next().unwrap_or("").trim();

    match cmd.as_str() {
        "/help" => print_help(),

        "/peers" => {
            let scope = if args.is_empty() { "*" } else { args };
            match core.cmd_peers(scope).await {
                Ok(peers) => {
                    println!("{} peer(s):", peers.len());
                    for p in peers {
                        println!("  {} ({}:{})", p.peer_id(), p.ip, p.port);
                    }
                }
                Err(err) => println!("Error: {err}"),
            }
        }

        "/msg" => match split_two(args) {
            Some((peer_id, message)) => {
                if !core.cmd_msg(peer_id, message).await {
                    println!("Failed to send to {peer_id} (not connected or send error)");
                }
            }
            None => println!("Usage: /msg <peer_id> <message>"),
        },

        "/relay" => match split_two(args) {
            Some((peer_id, message)) => {
                if !core.cmd_relay(peer_id, message).await {
                    println!("Relay to {peer_id} failed (no route available)");
                }
            }
            None => println!("Usage: /relay <peer_id> <message>"),
        },

        "/pub" => match split_two(args) {
            Some((scope, message)) => {
                if scope != "*" && !scope.starts_with('#') {
                    println!("Scope must be '*' or '#namespace'");
                } else {
                    let sent = core.cmd_pub(scope, message).await;
                    println!("Published to {sent} peer(s)");
                }
            }
            None => println!("Usage: /pub <* | #namespace> <message>"),
        },

        "/conn" => {
            let conns = core.cmd_conn();
            println!("{} active connection(s):", conns.len());
            for c in conns {
                println!("  {} ({}, {:.1}s)", c.peer_id, c.direction, c.connected_secs);
            }
        }

        "/rtt" => {
            let table = core.cmd_rtt();
            for (peer_id, info) in table {
                match info.avg_rtt() {
                    Some(rtt) => println!("  {peer_id}: {rtt:.1} ms avg"),
                    None => println!("  {peer_id}: no samples"),
                }
            }
        }

        "/reconnect" => {
            core.cmd_reconnect();
            println!("Forced reconnection for disconnected peers");
        }

        "/log" => {
            if args.is_empty() {
                println!("Usage: /log <LEVEL> (DEBUG, INFO, WARNING, ERROR)");
            } else {
                println!("Log level changes require restarting with RUST_LOG={}", args.to_ascii_lowercase());
            }
        }

        "/quit" => {
            println!("Shutting down...");
            return true;
        }

        other => println!("Unknown command: {other}. Type /help for available commands."),
    }

    false
}

fn split_two(args: &str) -> Option<(&str, &str)> {
    if args.is_empty() {
        return None;
    }
    let mut parts = args.splitn(2, char::is_whitespace);
    let first = parts.next()?;
    let rest = parts.next()?.trim();
    if rest.is_empty() {
        return None;
    }
    Some((first, rest))
}

fn print_event(event: Event) {
    match event {
        Event::Registered { public_ip } => println!("* registered with rendezvous server, public ip: {public_ip}"),
        Event::PeerConnected { peer_id, direction } => println!("* {peer_id} connected ({direction})"),
        Event::PeerDisconnected { peer_id } => println!("* {peer_id} disconnected"),
        Event::PeerStale { peer_id } => println!("* {peer_id} marked stale"),
        Event::Message { from, payload } => println!("<{from}> {payload}"),
        Event::Published { from, scope, payload } => println!("[{scope}] <{from}> {payload}"),
        Event::Relayed { from, payload } => println!("<{from} via relay> {payload}"),
        Event::RttUpdated { peer_id, rtt_ms } => tracing::debug!(peer = %peer_id, rtt_ms, "rtt updated"),
        Event::Error { message } => println!("! error: {message}"),
    }
}

fn print_help() {
    println!();
    println!("{}", "=".repeat(60));
    println!("Peerline - Available Commands:");
    println!("{}", "=".repeat(60));
    println!("/peers [* | #namespace]  - Discover and list peers");
    println!("/msg <peer_id> <message> - Send a direct message");
    println!("/relay <peer_id> <msg>   - Force send via relay");
    println!("/pub * <message>         - Broadcast to all peers");
    println!("/pub #<namespace> <msg>  - Send to a namespace");
    println!("/conn                    - Show active connections");
    println!("/rtt                     - Show RTT statistics");
    println!("/reconnect               - Force reconnection");
    println!("/log <LEVEL>             - Show how to change the log level");
    println!("/quit                    - Exit the application");
    println!("/help                    - Show this help");
    println!("{}", "=".repeat(60));
    println!();
}
