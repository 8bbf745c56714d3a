//! Signaling envelope: addressing, encryption and parsing
//!
//! Every signaling event carries a `d` tag naming its destination:
//! `<recipient>@<channel>` for private messages and `@@<channel>` for
//! broadcasts, where `<channel>` is the public key of the shared room key.
//! Private payloads are encrypted to the recipient, broadcasts to the room key.

use nostr_sdk::Keys;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::bus::{unix_now, BusError, EventFilter, EventTemplate, MessageBus, SignedEvent};
use crate::types::{short_id, SignalingPayload};

/// Errors while sending or opening signaling events
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Malformed payload")]
    Malformed,
    #[error("Event not addressed to us: {0:?}")]
    Unaddressed(Option<String>),
}

/// Destination tag for a private message
pub fn private_address(recipient: &str, channel: &str) -> String {
    format!("{}@{}", recipient, channel)
}

/// Destination tag for a room broadcast
pub fn public_address(channel: &str) -> String {
    format!("@@{}", channel)
}

/// Destination tag for fallback channel traffic of one connection
pub fn turn_address(connection_id: &str) -> String {
    format!("turn-{}", connection_id)
}

/// A decrypted, validated signaling message
#[derive(Debug, Clone)]
pub struct Incoming {
    /// Author (hex pubkey)
    pub sender: String,
    /// Signed event timestamp (unix seconds)
    pub created_at: u64,
    /// Whether it came through the room broadcast address
    pub broadcast: bool,
    pub payload: SignalingPayload,
}

/// Publishes and opens signaling events for one identity in one room
pub struct Signaler {
    bus: Arc<dyn MessageBus>,
    keys: Keys,
    channel_keys: Keys,
    relays: Vec<String>,
    kind: u16,
    expiration: Duration,
    local_id: String,
    channel_id: String,
}

impl Signaler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        keys: Keys,
        channel_keys: Keys,
        relays: Vec<String>,
        kind: u16,
        expiration: Duration,
    ) -> Self {
        let local_id = keys.public_key().to_hex();
        let channel_id = channel_keys.public_key().to_hex();
        Self {
            bus,
            keys,
            channel_keys,
            relays,
            kind,
            expiration,
            local_id,
            channel_id,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn kind(&self) -> u16 {
        self.kind
    }

    pub fn private_address(&self) -> String {
        private_address(&self.local_id, &self.channel_id)
    }

    pub fn public_address(&self) -> String {
        public_address(&self.channel_id)
    }

    /// Filters covering our private and the room's public address
    pub fn filters(&self, since: u64) -> Vec<EventFilter> {
        vec![EventFilter::new()
            .kind(self.kind)
            .d_tag(self.private_address())
            .d_tag(self.public_address())
            .since(since)]
    }

    /// Send a payload to one peer
    pub async fn send_private(
        &self,
        recipient: &str,
        payload: &SignalingPayload,
    ) -> Result<(), SignalingError> {
        let plaintext = encode(payload)?;
        let content = self.bus.encrypt(recipient, &plaintext, &self.keys).await?;
        let address = private_address(recipient, &self.channel_id);
        debug!(
            "Sending {} to {}",
            payload.describe(),
            short_id(recipient)
        );
        self.publish(address, content).await
    }

    /// Broadcast a payload to the room
    pub async fn send_public(&self, payload: &SignalingPayload) -> Result<(), SignalingError> {
        let plaintext = encode(payload)?;
        let content = self
            .bus
            .encrypt(&self.channel_id, &plaintext, &self.keys)
            .await?;
        trace!("Broadcasting {}", payload.describe());
        self.publish(self.public_address(), content).await
    }

    async fn publish(&self, address: String, content: String) -> Result<(), SignalingError> {
        let template = EventTemplate::new(self.kind, content)
            .d_tag(address)
            .expiration(unix_now() + self.expiration.as_secs());
        self.bus.publish(&self.relays, template, &self.keys).await?;
        Ok(())
    }

    /// Decrypt and parse an event. Returns `None` for our own events.
    pub async fn open(&self, event: &SignedEvent) -> Result<Option<Incoming>, SignalingError> {
        if event.pubkey == self.local_id {
            return Ok(None);
        }
        let d = event.d_tag();
        let broadcast = if d == Some(self.private_address().as_str()) {
            false
        } else if d == Some(self.public_address().as_str()) {
            true
        } else {
            return Err(SignalingError::Unaddressed(d.map(str::to_string)));
        };

        let keys = if broadcast { &self.channel_keys } else { &self.keys };
        let plaintext = self.bus.decrypt(&event.pubkey, &event.content, keys).await?;
        let payload: SignalingPayload =
            serde_json::from_str(&plaintext).map_err(|e| SignalingError::Decode(e.to_string()))?;
        if !payload.is_valid() {
            return Err(SignalingError::Malformed);
        }

        Ok(Some(Incoming {
            sender: event.pubkey.clone(),
            created_at: event.created_at,
            broadcast,
            payload,
        }))
    }
}

fn encode(payload: &SignalingPayload) -> Result<String, SignalingError> {
    serde_json::to_string(payload).map_err(|e| SignalingError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;
    use crate::types::{Announce, ConnectRequest};

    fn signaler(network: &MockNetwork, keys: Keys, room: &Keys) -> Signaler {
        Signaler::new(
            Arc::new(network.bus()),
            keys,
            room.clone(),
            vec!["wss://relay.test".into()],
            29999,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_addresses() {
        assert_eq!(private_address("bob", "room"), "bob@room");
        assert_eq!(public_address("room"), "@@room");
        assert_eq!(turn_address("abc"), "turn-abc");
    }

    #[tokio::test]
    async fn test_private_message_roundtrip() {
        let network = MockNetwork::new();
        let room = Keys::generate();
        let alice = signaler(&network, Keys::generate(), &room);
        let bob = signaler(&network, Keys::generate(), &room);

        let mut sub = network
            .bus()
            .subscribe(&[], bob.filters(0))
            .await
            .unwrap();

        let payload = SignalingPayload {
            connect: Some(ConnectRequest {
                connection_id: "c1".into(),
                description: None,
            }),
            ..Default::default()
        };
        alice.send_private(bob.local_id(), &payload).await.unwrap();

        let event = sub.events.recv().await.unwrap();
        assert_eq!(event.d_tag(), Some(bob.private_address().as_str()));
        assert!(event.expiration().is_some());

        let incoming = bob.open(&event).await.unwrap().unwrap();
        assert_eq!(incoming.sender, alice.local_id());
        assert!(!incoming.broadcast);
        assert_eq!(incoming.payload, payload);
    }

    #[tokio::test]
    async fn test_broadcast_and_own_events() {
        let network = MockNetwork::new();
        let room = Keys::generate();
        let alice = signaler(&network, Keys::generate(), &room);
        let bob = signaler(&network, Keys::generate(), &room);

        let mut sub = network.bus().subscribe(&[], bob.filters(0)).await.unwrap();
        alice
            .send_public(&SignalingPayload::announce(Announce::default()))
            .await
            .unwrap();

        let event = sub.events.recv().await.unwrap();
        let incoming = bob.open(&event).await.unwrap().unwrap();
        assert!(incoming.broadcast);
        assert!(incoming.payload.announce.is_some());

        // Alice ignores her own broadcast
        assert!(alice.open(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_room_is_unaddressed() {
        let network = MockNetwork::new();
        let alice = signaler(&network, Keys::generate(), &Keys::generate());
        let bob = signaler(&network, Keys::generate(), &Keys::generate());

        let mut sub = network.bus().subscribe(&[], vec![EventFilter::new()]).await.unwrap();
        alice
            .send_public(&SignalingPayload::announce(Announce::default()))
            .await
            .unwrap();
        let event = sub.events.recv().await.unwrap();
        assert!(matches!(
            bob.open(&event).await,
            Err(SignalingError::Unaddressed(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected() {
        let network = MockNetwork::new();
        let room = Keys::generate();
        let alice_keys = Keys::generate();
        let bob = signaler(&network, Keys::generate(), &room);
        let bus = network.bus();

        let content = bus
            .encrypt(bob.local_id(), "{}", &alice_keys)
            .await
            .unwrap();
        let event = bus
            .publish(
                &[],
                EventTemplate::new(29999, content).d_tag(bob.private_address()),
                &alice_keys,
            )
            .await
            .unwrap();
        assert!(matches!(bob.open(&event).await, Err(SignalingError::Malformed)));
    }
}
