//! Line-based chat over a nostrtc room
//!
//! Every stdin line is sent to all connected peers; events from the
//! coordinator are printed as they arrive.

use anyhow::Result;
use nostrtc::{short_id, Coordinator, PeerInfo, RtcEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Name a peer advertised, or its short id
pub fn display_name(peer: &PeerInfo) -> String {
    match peer.metadata.get("name") {
        Some(name) if !name.is_empty() => format!("{} ({})", name, peer.short()),
        _ => peer.short().to_string(),
    }
}

/// Line to print for an event, `None` for events not worth showing
pub fn describe_event(event: &RtcEvent) -> Option<String> {
    let line = match event {
        RtcEvent::Discovered(peer) => format!("* discovered {}", display_name(peer)),
        RtcEvent::Expired(peer) => format!("* {} went away", display_name(peer)),
        RtcEvent::Connected(peer) => format!("* connected to {}", display_name(peer)),
        RtcEvent::FallbackEngaged(peer) => {
            format!("* {} reachable only through relays", display_name(peer))
        }
        RtcEvent::Closed { peer, reason } => match reason {
            Some(reason) => format!("* disconnected from {}: {}", display_name(peer), reason),
            None => format!("* disconnected from {}", display_name(peer)),
        },
        RtcEvent::Error { peer, error } => format!("! {}: {}", display_name(peer), error),
        RtcEvent::Data { peer, data } => {
            format!("<{}> {}", display_name(peer), String::from_utf8_lossy(data))
        }
        RtcEvent::Refreshed(_) | RtcEvent::Connecting(_) | RtcEvent::Candidates { .. } => {
            return None
        }
    };
    Some(line)
}

/// A parsed input line
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Say(&'a str),
    Peers,
    Quit,
    Unknown(&'a str),
    Empty,
}

pub fn parse_line(line: &str) -> Command<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.trim() {
        "" => Command::Empty,
        "/peers" => Command::Peers,
        "/quit" => Command::Quit,
        cmd if cmd.starts_with('/') => Command::Unknown(cmd),
        _ => Command::Say(line),
    }
}

async fn print_events(mut events: broadcast::Receiver<RtcEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = describe_event(&event) {
                    println!("{}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn broadcast_line(coordinator: &Coordinator, text: &str) {
    let connections = coordinator.connections().await;
    if connections.is_empty() {
        println!("* nobody is connected yet");
        return;
    }
    for conn in connections {
        if let Err(e) = conn.write(text.as_bytes()).await {
            debug!("Send to {} failed: {}", short_id(conn.peer_id()), e);
        }
    }
}

async fn print_peers(coordinator: &Coordinator) {
    let peers = coordinator.list_peers().await;
    if peers.is_empty() {
        println!("* no peers discovered");
    }
    for id in peers {
        let Some(peer) = coordinator.peer_info(&id).await else {
            continue;
        };
        let status = match coordinator.connection(&id).await {
            Some(conn) => conn.status().await.to_string(),
            None => "not connected".to_string(),
        };
        println!("* {} [{}]", display_name(&peer), status);
    }
}

/// Run until input ends, `/quit`, or ctrl-c
pub async fn run(coordinator: Coordinator, input: impl AsyncBufRead + Unpin) -> Result<()> {
    let printer = tokio::spawn(print_events(coordinator.subscribe()));
    coordinator.start().await?;
    println!(
        "* joined room {} as {}",
        short_id(coordinator.channel_public_key()),
        short_id(coordinator.local_public_key())
    );

    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match parse_line(&line) {
            Command::Say(text) => broadcast_line(&coordinator, text).await,
            Command::Peers => print_peers(&coordinator).await,
            Command::Quit => break,
            Command::Unknown(cmd) => println!("* unknown command {}", cmd),
            Command::Empty => {}
        }
    }

    coordinator.stop().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostrtc::{Announce, CloseReason};

    fn peer(name: Option<&str>) -> PeerInfo {
        let mut announce = Announce::default();
        if let Some(name) = name {
            announce.metadata.insert("name".to_string(), name.to_string());
        }
        PeerInfo::new("0123456789abcdef", announce, 0)
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(&peer(Some("alice"))), "alice (01234567)");
        assert_eq!(display_name(&peer(None)), "01234567");
        assert_eq!(display_name(&peer(Some(""))), "01234567");
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("hello there\n"), Command::Say("hello there"));
        assert_eq!(parse_line("/peers"), Command::Peers);
        assert_eq!(parse_line(" /quit "), Command::Quit);
        assert_eq!(parse_line("/dance"), Command::Unknown("/dance"));
        assert_eq!(parse_line("   "), Command::Empty);
    }

    #[tokio::test]
    async fn test_describe_event() {
        let data = RtcEvent::Data {
            peer: peer(Some("bob")),
            data: b"hi".to_vec(),
        };
        assert_eq!(describe_event(&data).as_deref(), Some("<bob (01234567)> hi"));

        let closed = RtcEvent::Closed {
            peer: peer(None),
            reason: Some(CloseReason::error("Peer expired")),
        };
        assert_eq!(
            describe_event(&closed).as_deref(),
            Some("* disconnected from 01234567: error: Peer expired")
        );
        assert!(describe_event(&RtcEvent::Refreshed(peer(None))).is_none());
    }
}
