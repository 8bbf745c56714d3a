//! Peer-to-peer data channels signaled over Nostr relays
//!
//! Peers sharing a channel key discover each other through encrypted
//! announcements on a signed pub/sub bus, negotiate a direct WebRTC data
//! channel, and fall back to a reliable chunked channel tunneled over the
//! relays when the direct path is unavailable or fails.
//!
//! # Overview
//!
//! - **Discovery**: periodic announces on the channel's public address
//! - **Connections**: one [`PeerConnection`] per remote peer, direct first
//! - **Fallback**: [`ChunkedChannel`], a stop-and-wait ARQ over relay events
//!
//! # Example
//!
//! ```rust,no_run
//! use nostrtc::{Coordinator, CoordinatorOptions, NostrBus, RtcEvent};
//! use nostr_sdk::Keys;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(NostrBus::new());
//!     let channel = Keys::parse("nsec1...")?;
//!     let coordinator = Coordinator::new(bus, Keys::generate(), channel, CoordinatorOptions::default());
//!
//!     let mut events = coordinator.subscribe();
//!     coordinator.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let RtcEvent::Data { peer, data } = event {
//!             println!("{:?}: {} bytes", peer, data.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod chunked;
pub mod connection;
pub mod coordinator;
pub mod direct;
pub mod mock;
pub mod nostr;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod signaling;
pub mod types;

pub use bus::{
    unix_now, BusError, EventFilter, EventTemplate, MessageBus, RelayInfo, SignedEvent,
    Subscription,
};
pub use chunked::{
    decode_payload, encode_payload, ChannelError, ChannelEvent, ChunkAck, ChunkMessage,
    ChunkPacket, ChunkedChannel, ChunkedChannelConfig, ChunkedState, ProtocolError,
};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEventKind, PeerConnection,
};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorOptions};
pub use direct::{
    DirectConfig, DirectEvent, DirectState, DirectTransport, DirectTransportFactory,
    TransportError,
};
pub use mock::{
    DirectMode, Faults, MockBus, MockDirectFactory, MockDirectNetwork, MockDirectTransport,
    MockNetwork, WireRecord,
};
pub use nostr::NostrBus;
#[cfg(feature = "webrtc")]
pub use rtc::{WebRtcTransport, WebRtcTransportFactory};
pub use signaling::{
    private_address, public_address, turn_address, Incoming, Signaler, SignalingError,
};
pub use types::{
    effective_status, is_initiator, short_id, Announce, CloseReason, ConnectAck,
    ConnectRequest, ConnectionStatus, IceCandidate, Metadata, PeerInfo, RtcEvent,
    SessionDescription, SignalingPayload, DATA_CHANNEL_PREFIX,
};
