//! Direct peer-to-peer transport abstraction
//!
//! A host may or may not offer a direct transport. When it does, the
//! [`DirectTransportFactory`] creates one [`DirectTransport`] per connection
//! attempt; the transport reports progress through [`DirectEvent`]s.
//! Implemented by the webrtc crate ([`crate::WebRtcTransportFactory`]) and
//! by [`crate::MockDirectNetwork`] in tests.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{IceCandidate, SessionDescription};

/// Errors from direct transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected")]
    NotConnected,
}

/// ICE connectivity state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from a direct transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// ICE connectivity changed
    StateChange(DirectState),
    /// The data channel is open and usable
    ChannelOpen,
    /// Bytes received on the data channel
    Message(Vec<u8>),
    /// The data channel closed
    ChannelClosed,
}

/// Parameters for one transport instance
#[derive(Debug, Clone, Default)]
pub struct DirectConfig {
    /// Data channel label
    pub label: String,
    /// STUN server URLs
    pub ice_servers: Vec<String>,
}

/// One direct connection attempt
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Create the data channel and a local offer (initiator side)
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer and create the local answer (acceptor side)
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Apply the remote answer (initiator side)
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Send on the open data channel
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Host capability for creating direct transports
#[async_trait]
pub trait DirectTransportFactory: Send + Sync {
    async fn create(
        &self,
        config: DirectConfig,
    ) -> Result<(Arc<dyn DirectTransport>, mpsc::UnboundedReceiver<DirectEvent>), TransportError>;
}
