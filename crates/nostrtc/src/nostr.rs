//! Nostr relay message bus
//!
//! Wraps a nostr-sdk [`Client`] to implement [`MessageBus`]. Events are
//! signed locally with whichever keys the caller passes, so one client serves
//! both the local identity and the shared channel identity. Relays are added
//! to the pool on first use.

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{
    BusError, EventFilter, EventTemplate, MessageBus, RelayInfo, SignedEvent, Subscription,
};

/// Capacity of each subscription's event queue
const SUBSCRIPTION_BUFFER: usize = 1024;

/// [`MessageBus`] over real Nostr relays
pub struct NostrBus {
    client: Client,
    known_relays: Mutex<HashSet<String>>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    http: reqwest::Client,
}

impl NostrBus {
    pub fn new() -> Self {
        let client = ClientBuilder::new()
            .database(nostr_sdk::database::MemoryDatabase::new())
            .build();
        Self::with_client(client)
    }

    /// Share an existing client and its relay pool
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            known_relays: Mutex::new(HashSet::new()),
            pumps: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Add any relays the pool has not seen yet and connect them
    async fn ensure_relays(&self, relays: &[String]) -> Result<(), BusError> {
        let mut known = self.known_relays.lock().await;
        let mut added = false;
        for relay in relays {
            if known.contains(relay) {
                continue;
            }
            match self.client.add_relay(relay.as_str()).await {
                Ok(_) => {
                    known.insert(relay.clone());
                    added = true;
                }
                Err(e) => warn!("Cannot add relay {}: {}", relay, e),
            }
        }
        if added {
            self.client.connect().await;
        }
        Ok(())
    }

    /// Close every subscription and disconnect from all relays
    pub async fn shutdown(&self) {
        for (_, pump) in self.pumps.lock().await.drain() {
            pump.abort();
        }
        let _ = self.client.disconnect().await;
    }
}

impl Default for NostrBus {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_pubkey(hex: &str) -> Result<PublicKey, BusError> {
    PublicKey::from_hex(hex).map_err(|e| BusError::InvalidKey(e.to_string()))
}

fn to_filter(filter: &EventFilter) -> Result<Filter, BusError> {
    let mut out = Filter::new();
    if !filter.kinds.is_empty() {
        out = out.kinds(filter.kinds.iter().map(|k| Kind::from(*k)));
    }
    if !filter.authors.is_empty() {
        let authors = filter
            .authors
            .iter()
            .map(|a| parse_pubkey(a))
            .collect::<Result<Vec<_>, _>>()?;
        out = out.authors(authors);
    }
    if !filter.d_tags.is_empty() {
        out = out.identifiers(filter.d_tags.clone());
    }
    if let Some(since) = filter.since {
        out = out.since(Timestamp::from(since));
    }
    Ok(out)
}

fn to_signed(event: &Event) -> SignedEvent {
    SignedEvent {
        id: event.id.to_hex(),
        pubkey: event.pubkey.to_hex(),
        created_at: event.created_at.as_u64(),
        kind: event.kind.as_u16(),
        tags: event.tags.iter().map(|t| t.as_slice().to_vec()).collect(),
        content: event.content.clone(),
    }
}

/// http(s) URL serving the relay's NIP-11 document
fn info_url(relay: &str) -> String {
    if let Some(rest) = relay.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = relay.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        relay.to_string()
    }
}

fn string_list(doc: &serde_json::Value, field: &str) -> Vec<String> {
    doc.get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl MessageBus for NostrBus {
    async fn publish(
        &self,
        relays: &[String],
        event: EventTemplate,
        keys: &Keys,
    ) -> Result<SignedEvent, BusError> {
        self.ensure_relays(relays).await?;

        let tags = event
            .tags
            .iter()
            .map(|t| Tag::parse(t))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BusError::PublishFailed(e.to_string()))?;

        let mut builder = EventBuilder::new(Kind::from(event.kind), event.content, tags);
        if let Some(at) = event.created_at {
            builder = builder.custom_created_at(Timestamp::from(at));
        }
        let signed = builder
            .to_event(keys)
            .map_err(|e| BusError::PublishFailed(e.to_string()))?;

        let result = if relays.is_empty() {
            self.client.send_event(signed.clone()).await
        } else {
            self.client
                .send_event_to(relays.iter().map(String::as_str), signed.clone())
                .await
        };
        result.map_err(|e| BusError::PublishFailed(e.to_string()))?;

        Ok(to_signed(&signed))
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filters: Vec<EventFilter>,
    ) -> Result<Subscription, BusError> {
        self.ensure_relays(relays).await?;

        let nostr_filters = filters
            .iter()
            .map(to_filter)
            .collect::<Result<Vec<_>, _>>()?;

        // Listen before subscribing so stored events are not missed
        let mut notifications = self.client.notifications();

        let output = if relays.is_empty() {
            self.client.subscribe(nostr_filters, None).await
        } else {
            self.client
                .subscribe_to(relays.iter().map(String::as_str), nostr_filters, None)
                .await
        }
        .map_err(|e| BusError::SubscribeFailed(e.to_string()))?;
        let sub_id = output.val;
        let id = sub_id.to_string();

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pump_id = id.clone();
        let pump = tokio::spawn(async move {
            let mut seen = HashSet::new();
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    }) => {
                        if subscription_id != sub_id || !seen.insert(event.id) {
                            continue;
                        }
                        let signed = to_signed(&event);
                        if !filters.iter().any(|f| f.matches(&signed)) {
                            continue;
                        }
                        if tx.send(signed).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscription {} lagged by {} notifications", pump_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Subscription {} pump finished", pump_id);
        });

        self.pumps.lock().await.insert(id.clone(), pump);
        Ok(Subscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: &str) {
        if let Some(pump) = self.pumps.lock().await.remove(id) {
            pump.abort();
        }
        self.client
            .unsubscribe(SubscriptionId::new(id))
            .await;
    }

    async fn encrypt(
        &self,
        recipient: &str,
        plaintext: &str,
        keys: &Keys,
    ) -> Result<String, BusError> {
        let recipient = parse_pubkey(recipient)?;
        nip44::encrypt(keys.secret_key(), &recipient, plaintext, nip44::Version::V2)
            .map_err(|e| BusError::Encrypt(e.to_string()))
    }

    async fn decrypt(
        &self,
        sender: &str,
        ciphertext: &str,
        keys: &Keys,
    ) -> Result<String, BusError> {
        let sender = parse_pubkey(sender)?;
        nip44::decrypt(keys.secret_key(), &sender, ciphertext)
            .map_err(|e| BusError::Decrypt(e.to_string()))
    }

    async fn relay_info(&self, relay: &str) -> Result<RelayInfo, BusError> {
        let doc: serde_json::Value = self
            .http
            .get(info_url(relay))
            .header("Accept", "application/nostr+json")
            .send()
            .await
            .map_err(|e| BusError::RelayInfo(e.to_string()))?
            .json()
            .await
            .map_err(|e| BusError::RelayInfo(e.to_string()))?;

        Ok(RelayInfo {
            stun: string_list(&doc, "stun"),
            turn: string_list(&doc, "turn"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_url() {
        assert_eq!(info_url("wss://relay.example"), "https://relay.example");
        assert_eq!(info_url("ws://localhost:7777"), "http://localhost:7777");
        assert_eq!(info_url("https://already"), "https://already");
    }

    #[test]
    fn test_string_list_ignores_non_strings() {
        let doc = serde_json::json!({
            "stun": ["stun:a:3478", 5, "stun:b:3478"],
            "name": "relay"
        });
        assert_eq!(string_list(&doc, "stun"), vec!["stun:a:3478", "stun:b:3478"]);
        assert!(string_list(&doc, "turn").is_empty());
    }

    #[test]
    fn test_filter_rejects_bad_author() {
        let filter = EventFilter::new().kind(29999).author("not-hex");
        assert!(matches!(to_filter(&filter), Err(BusError::InvalidKey(_))));
    }

    #[test]
    fn test_signed_event_conversion() {
        let keys = Keys::generate();
        let tags = vec![
            Tag::parse(&["d", "turn-abc"]).unwrap(),
            Tag::parse(&["expiration", "1700000000"]).unwrap(),
        ];
        let event = EventBuilder::new(Kind::from(29999), "hello", tags)
            .to_event(&keys)
            .unwrap();
        let signed = to_signed(&event);
        assert_eq!(signed.kind, 29999);
        assert_eq!(signed.pubkey, keys.public_key().to_hex());
        assert_eq!(signed.d_tag(), Some("turn-abc"));
        assert_eq!(signed.expiration(), Some(1_700_000_000));
        assert_eq!(signed.content, "hello");
    }

    #[tokio::test]
    async fn test_nip44_round_trip() {
        let bus = NostrBus::new();
        let alice = Keys::generate();
        let bob = Keys::generate();
        let sealed = bus
            .encrypt(&bob.public_key().to_hex(), "secret", &alice)
            .await
            .unwrap();
        assert_ne!(sealed, "secret");
        let opened = bus
            .decrypt(&alice.public_key().to_hex(), &sealed, &bob)
            .await
            .unwrap();
        assert_eq!(opened, "secret");
    }
}
