//! Message bus abstraction
//!
//! The relay network is reached through the [`MessageBus`] trait so the
//! coordinator and the chunked channel can run against real Nostr relays
//! ([`crate::NostrBus`]) or the in-memory [`crate::MockBus`].

use async_trait::async_trait;
use nostr_sdk::Keys;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from message bus operations
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Relay info unavailable: {0}")]
    RelayInfo(String),
    #[error("Bus closed")]
    Closed,
}

/// Event to be signed and published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    /// Unix seconds, `None` means now
    pub created_at: Option<u64>,
}

impl EventTemplate {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    /// Add the addressing tag
    pub fn d_tag(self, value: impl Into<String>) -> Self {
        self.tag(vec!["d".to_string(), value.into()])
    }

    /// Add an expiration tag (unix seconds)
    pub fn expiration(self, at: u64) -> Self {
        self.tag(vec!["expiration".to_string(), at.to_string()])
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }
}

/// A signed event as delivered by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEvent {
    pub id: String,
    /// Author public key (hex)
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl SignedEvent {
    /// First value of the first tag with this name
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag.as_slice() {
            [n, value, ..] if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn d_tag(&self) -> Option<&str> {
        self.tag("d")
    }

    pub fn expiration(&self) -> Option<u64> {
        self.tag("expiration").and_then(|v| v.parse().ok())
    }
}

/// Subscription filter. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<u16>,
    pub authors: Vec<String>,
    pub d_tags: Vec<String>,
    pub since: Option<u64>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.push(pubkey.into());
        self
    }

    pub fn d_tag(mut self, value: impl Into<String>) -> Self {
        self.d_tags.push(value.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &SignedEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| *a == event.pubkey) {
            return false;
        }
        if !self.d_tags.is_empty() {
            match event.d_tag() {
                Some(d) if self.d_tags.iter().any(|t| t == d) => {}
                _ => return false,
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

/// Live subscription; events arrive on `events` until it is closed
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub events: mpsc::Receiver<SignedEvent>,
}

/// Capabilities a relay advertises beyond plain event transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayInfo {
    pub stun: Vec<String>,
    pub turn: Vec<String>,
}

/// Signed pub/sub transport used for signaling and fallback traffic
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Sign `event` with `keys` and publish it to `relays`
    async fn publish(
        &self,
        relays: &[String],
        event: EventTemplate,
        keys: &Keys,
    ) -> Result<SignedEvent, BusError>;

    /// Subscribe to events matching any of `filters` on `relays`
    async fn subscribe(
        &self,
        relays: &[String],
        filters: Vec<EventFilter>,
    ) -> Result<Subscription, BusError>;

    /// Close a subscription
    async fn unsubscribe(&self, id: &str);

    /// Encrypt `plaintext` from `keys` to `recipient` (hex pubkey)
    async fn encrypt(&self, recipient: &str, plaintext: &str, keys: &Keys)
        -> Result<String, BusError>;

    /// Decrypt `ciphertext` sent by `sender` (hex pubkey) to `keys`
    async fn decrypt(&self, sender: &str, ciphertext: &str, keys: &Keys)
        -> Result<String, BusError>;

    /// Parse a secret key (hex or bech32), or generate a fresh identity
    fn new_key_pair(&self, secret: Option<&str>) -> Result<Keys, BusError> {
        match secret {
            Some(secret) => {
                Keys::parse(secret).map_err(|e| BusError::InvalidKey(e.to_string()))
            }
            None => Ok(Keys::generate()),
        }
    }

    /// Capability info advertised by a relay
    async fn relay_info(&self, relay: &str) -> Result<RelayInfo, BusError>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for Arc<T> {
    async fn publish(
        &self,
        relays: &[String],
        event: EventTemplate,
        keys: &Keys,
    ) -> Result<SignedEvent, BusError> {
        (**self).publish(relays, event, keys).await
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filters: Vec<EventFilter>,
    ) -> Result<Subscription, BusError> {
        (**self).subscribe(relays, filters).await
    }

    async fn unsubscribe(&self, id: &str) {
        (**self).unsubscribe(id).await
    }

    async fn encrypt(
        &self,
        recipient: &str,
        plaintext: &str,
        keys: &Keys,
    ) -> Result<String, BusError> {
        (**self).encrypt(recipient, plaintext, keys).await
    }

    async fn decrypt(
        &self,
        sender: &str,
        ciphertext: &str,
        keys: &Keys,
    ) -> Result<String, BusError> {
        (**self).decrypt(sender, ciphertext, keys).await
    }

    fn new_key_pair(&self, secret: Option<&str>) -> Result<Keys, BusError> {
        (**self).new_key_pair(secret)
    }

    async fn relay_info(&self, relay: &str) -> Result<RelayInfo, BusError> {
        (**self).relay_info(relay).await
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
