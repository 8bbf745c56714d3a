//! Shared types for signaling, peers and connection state
//!
//! Defines the signaling payload exchanged through the relays (before
//! encryption), the peer directory entry and the events the coordinator
//! publishes to the application.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Label prefix for the direct data channel, followed by the connection id
pub const DATA_CHANNEL_PREFIX: &str = "nostrtc:";

/// Application metadata advertised in announcements
pub type Metadata = BTreeMap<String, String>;

/// A discovered remote identity
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Public key (hex), the peer's identity
    pub pubkey: String,
    /// Metadata from the latest announcement, replaced wholesale on refresh
    pub metadata: Metadata,
    /// Relays the peer listens on for fallback traffic
    pub relay_hints: Vec<String>,
    /// Signed timestamp (unix seconds) of the latest announcement
    pub announced_at: u64,
    /// When we received the latest valid announcement
    pub last_seen: Instant,
}

impl PeerInfo {
    pub fn new(pubkey: impl Into<String>, announce: Announce, announced_at: u64) -> Self {
        Self {
            pubkey: pubkey.into(),
            metadata: announce.metadata,
            relay_hints: announce.relay_hints,
            announced_at,
            last_seen: Instant::now(),
        }
    }

    /// Apply a newer announcement: metadata is replaced, not merged
    pub fn refresh(&mut self, announce: Announce, announced_at: u64) {
        self.metadata = announce.metadata;
        self.relay_hints = announce.relay_hints;
        self.announced_at = announced_at;
        self.last_seen = Instant::now();
    }

    pub fn is_expired(&self, now: Instant, expiration: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > expiration
    }

    /// First 8 characters of the pubkey, for logs
    pub fn short(&self) -> &str {
        short_id(&self.pubkey)
    }
}

/// First 8 characters of `id`, cut on a char boundary
pub fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(i, _)| &id[..i])
}

/// The identity that sorts first initiates the connection
pub fn is_initiator(local: &str, remote: &str) -> bool {
    local < remote
}

/// Connection state of a [`crate::PeerConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Status as observed at `now`.
///
/// A connection that stays `Connecting` for longer than `attempt_timeout`
/// since its last status update reads as `Disconnected`.
pub fn effective_status(
    status: ConnectionStatus,
    last_update: Instant,
    now: Instant,
    attempt_timeout: Duration,
) -> ConnectionStatus {
    if status == ConnectionStatus::Connecting
        && now.saturating_duration_since(last_update) > attempt_timeout
    {
        return ConnectionStatus::Disconnected;
    }
    status
}

/// Why a connection or channel was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close with a human readable message
    Message(String),
    /// Close caused by a failure
    Error(String),
}

impl CloseReason {
    pub fn message(msg: impl Into<String>) -> Self {
        CloseReason::Message(msg.into())
    }

    pub fn error(err: impl fmt::Display) -> Self {
        CloseReason::Error(err.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::Error(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Message(msg) => write!(f, "{}", msg),
            CloseReason::Error(err) => write!(f, "error: {}", err),
        }
    }
}

/// Session description (SDP offer or answer) in its JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for direct connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Presence announcement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(rename = "relayHints", alias = "turnRelays", default)]
    pub relay_hints: Vec<String>,
}

/// Connection request sent by the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    /// Local offer, absent when the initiator has no direct transport
    #[serde(default)]
    pub description: Option<SessionDescription>,
}

/// Answer to a [`ConnectRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAck {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decrypted body of a signaling event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<Announce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,
    #[serde(rename = "connectAck", default, skip_serializing_if = "Option::is_none")]
    pub connect_ack: Option<ConnectAck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<IceCandidate>>,
}

impl SignalingPayload {
    pub fn announce(announce: Announce) -> Self {
        Self {
            announce: Some(announce),
            ..Default::default()
        }
    }

    pub fn candidates(candidates: Vec<IceCandidate>) -> Self {
        Self {
            candidates: Some(candidates),
            ..Default::default()
        }
    }

    /// A payload must carry something, and never both halves of a handshake
    pub fn is_valid(&self) -> bool {
        let any = self.announce.is_some()
            || self.connect.is_some()
            || self.connect_ack.is_some()
            || self.candidates.is_some();
        any && !(self.connect.is_some() && self.connect_ack.is_some())
    }

    /// Short description of the payload's parts, for logs
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.announce.is_some() {
            parts.push("announce");
        }
        if self.connect.is_some() {
            parts.push("connect");
        }
        if self.connect_ack.is_some() {
            parts.push("connectAck");
        }
        if self.candidates.is_some() {
            parts.push("candidates");
        }
        parts.join("+")
    }
}

/// Events published by the [`crate::Coordinator`]
#[derive(Debug, Clone)]
pub enum RtcEvent {
    /// First valid announcement from a peer
    Discovered(PeerInfo),
    /// A known peer announced again
    Refreshed(PeerInfo),
    /// A peer stopped announcing and was removed
    Expired(PeerInfo),
    /// A connection attempt started (either direction)
    Connecting(PeerInfo),
    /// The logical channel to the peer is usable
    Connected(PeerInfo),
    /// The connection to the peer was closed
    Closed {
        peer: PeerInfo,
        reason: Option<CloseReason>,
    },
    /// A connection reported an error
    Error { peer: PeerInfo, error: String },
    /// Remote candidates were applied to the peer's connection
    Candidates {
        peer: PeerInfo,
        candidates: Vec<IceCandidate>,
    },
    /// The connection switched to the relay fallback path
    FallbackEngaged(PeerInfo),
    /// Bytes received from the peer
    Data { peer: PeerInfo, data: Vec<u8> },
}

impl RtcEvent {
    pub fn peer(&self) -> &PeerInfo {
        match self {
            RtcEvent::Discovered(peer)
            | RtcEvent::Refreshed(peer)
            | RtcEvent::Expired(peer)
            | RtcEvent::Connecting(peer)
            | RtcEvent::Connected(peer)
            | RtcEvent::FallbackEngaged(peer) => peer,
            RtcEvent::Closed { peer, .. }
            | RtcEvent::Error { peer, .. }
            | RtcEvent::Candidates { peer, .. }
            | RtcEvent::Data { peer, .. } => peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_is_smaller_identity() {
        assert!(is_initiator("aaa", "bbb"));
        assert!(!is_initiator("bbb", "aaa"));
        assert!(!is_initiator("aaa", "aaa"));
    }

    #[test]
    fn test_short_id_cuts_on_char_boundary() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
        assert_eq!(short_id("aaaaaaaé"), "aaaaaaaé");
        assert_eq!(short_id("ééééééééé"), "éééééééé");
    }

    #[tokio::test(start_paused = true)]
    async fn test_effective_status_soft_timeout() {
        let start = Instant::now();
        let timeout = Duration::from_secs(120);
        let later = start + Duration::from_secs(121);

        assert_eq!(
            effective_status(ConnectionStatus::Connecting, start, start, timeout),
            ConnectionStatus::Connecting
        );
        assert_eq!(
            effective_status(ConnectionStatus::Connecting, start, later, timeout),
            ConnectionStatus::Disconnected
        );
        // Only `connecting` goes stale
        assert_eq!(
            effective_status(ConnectionStatus::Connected, start, later, timeout),
            ConnectionStatus::Connected
        );
    }

    #[test]
    fn test_payload_validation() {
        assert!(!SignalingPayload::default().is_valid());
        assert!(SignalingPayload::candidates(vec![]).is_valid());

        let both = SignalingPayload {
            connect: Some(ConnectRequest {
                connection_id: "c".into(),
                description: None,
            }),
            connect_ack: Some(ConnectAck {
                connection_id: "c".into(),
                description: None,
                error: None,
            }),
            ..Default::default()
        };
        assert!(!both.is_valid());
    }

    #[test]
    fn test_announce_accepts_legacy_field_name() {
        let json = r#"{"announce":{"metadata":{"name":"a"},"turnRelays":["wss://r"]}}"#;
        let payload: SignalingPayload = serde_json::from_str(json).unwrap();
        let announce = payload.announce.unwrap();
        assert_eq!(announce.relay_hints, vec!["wss://r"]);
        assert_eq!(announce.metadata.get("name").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_connect_ack_wire_names() {
        let payload = SignalingPayload {
            connect_ack: Some(ConnectAck {
                connection_id: "abc".into(),
                description: None,
                error: Some("nope".into()),
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"connectAck":{"connectionId":"abc","error":"nope"}}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_replaces_metadata() {
        let mut first = Metadata::new();
        first.insert("a".into(), "1".into());
        first.insert("b".into(), "2".into());
        let mut peer = PeerInfo::new(
            "pk",
            Announce {
                metadata: first,
                relay_hints: vec![],
            },
            10,
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        let mut second = Metadata::new();
        second.insert("c".into(), "3".into());
        let before = peer.last_seen;
        peer.refresh(
            Announce {
                metadata: second.clone(),
                relay_hints: vec!["wss://x".into()],
            },
            15,
        );

        assert_eq!(peer.metadata, second);
        assert_eq!(peer.relay_hints, vec!["wss://x"]);
        assert_eq!(peer.announced_at, 15);
        assert!(peer.last_seen > before);
    }
}
