//! Mock implementations for testing and simulation
//!
//! [`MockNetwork`] is an in-memory relay network shared by any number of
//! [`MockBus`] handles. It matches filters like a relay, records every
//! published event and can inject faults. [`MockDirectNetwork`] pairs mock
//! direct transports through their offers and answers.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use nostr_sdk::Keys;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{
    unix_now, BusError, EventFilter, EventTemplate, MessageBus, RelayInfo, SignedEvent,
    Subscription,
};
use crate::direct::{
    DirectConfig, DirectEvent, DirectState, DirectTransport, DirectTransportFactory,
    TransportError,
};
use crate::types::{IceCandidate, SessionDescription};

const SUBSCRIPTION_BUFFER: usize = 4096;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn relays_overlap(a: &[String], b: &[String]) -> bool {
    a.is_empty() || b.is_empty() || a.iter().any(|r| b.contains(r))
}

// ============================================================================
// Mock relay network
// ============================================================================

/// Faults applied to delivery (the wire log still records every publish)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Drop every n-th published event
    pub drop_every: Option<u64>,
    /// Deliver every event twice
    pub duplicate: bool,
}

/// A published event and the relays it was sent to
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub relays: Vec<String>,
    pub event: SignedEvent,
    pub delivered: bool,
}

struct MockSubscription {
    relays: Vec<String>,
    filters: Vec<EventFilter>,
    tx: mpsc::Sender<SignedEvent>,
}

#[derive(Default)]
struct NetworkInner {
    subscriptions: Mutex<HashMap<String, MockSubscription>>,
    wire: Mutex<Vec<WireRecord>>,
    faults: Mutex<Faults>,
    relay_info: Mutex<HashMap<String, RelayInfo>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

/// In-memory relay network
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus handle connected to this network
    pub fn bus(&self) -> MockBus {
        MockBus {
            network: self.clone(),
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        *lock(&self.inner.faults) = faults;
    }

    /// Capability info served for `relay`
    pub fn set_relay_info(&self, relay: impl Into<String>, info: RelayInfo) {
        lock(&self.inner.relay_info).insert(relay.into(), info);
    }

    /// Every event published so far
    pub fn wire(&self) -> Vec<WireRecord> {
        lock(&self.inner.wire).clone()
    }

    /// Published events whose `d` tag equals `d`
    pub fn wire_with_d_tag(&self, d: &str) -> Vec<WireRecord> {
        lock(&self.inner.wire)
            .iter()
            .filter(|r| r.event.d_tag() == Some(d))
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    /// Plaintext of a [`MockBus`] ciphertext, without needing the keys
    pub fn peek(content: &str) -> Option<String> {
        let (_, body) = content.split_once(':')?;
        let bytes = STANDARD.decode(body).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn publish(&self, relays: &[String], event: SignedEvent) {
        let n = self.inner.published.fetch_add(1, Ordering::Relaxed) + 1;
        let faults = *lock(&self.inner.faults);
        let dropped = matches!(faults.drop_every, Some(k) if k > 0 && n % k == 0);

        lock(&self.inner.wire).push(WireRecord {
            relays: relays.to_vec(),
            event: event.clone(),
            delivered: !dropped,
        });
        if dropped {
            debug!("Mock network dropped event #{}", n);
            return;
        }

        let copies = if faults.duplicate { 2 } else { 1 };
        let subscriptions = lock(&self.inner.subscriptions);
        for (id, sub) in subscriptions.iter() {
            if !relays_overlap(&sub.relays, relays) {
                continue;
            }
            if !sub.filters.iter().any(|f| f.matches(&event)) {
                continue;
            }
            for _ in 0..copies {
                if sub.tx.try_send(event.clone()).is_err() {
                    warn!("Mock subscription {} full or closed, dropping event", id);
                }
            }
        }
    }

    fn subscribe(&self, relays: &[String], filters: Vec<EventFilter>) -> Subscription {
        let id = format!("sub-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&self.inner.subscriptions).insert(
            id.clone(),
            MockSubscription {
                relays: relays.to_vec(),
                filters,
                tx,
            },
        );
        Subscription { id, events: rx }
    }

    fn next_event_id(&self) -> String {
        format!("{:064x}", self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// [`MessageBus`] over a [`MockNetwork`]
///
/// Encryption is a reversible envelope `sender>recipient:base64` that only
/// the named recipient accepts, so tests can inspect traffic with
/// [`MockNetwork::peek`].
#[derive(Clone)]
pub struct MockBus {
    network: MockNetwork,
}

impl MockBus {
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(
        &self,
        relays: &[String],
        event: EventTemplate,
        keys: &Keys,
    ) -> Result<SignedEvent, BusError> {
        let signed = SignedEvent {
            id: self.network.next_event_id(),
            pubkey: keys.public_key().to_hex(),
            created_at: event.created_at.unwrap_or_else(unix_now),
            kind: event.kind,
            tags: event.tags,
            content: event.content,
        };
        self.network.publish(relays, signed.clone());
        Ok(signed)
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filters: Vec<EventFilter>,
    ) -> Result<Subscription, BusError> {
        Ok(self.network.subscribe(relays, filters))
    }

    async fn unsubscribe(&self, id: &str) {
        lock(&self.network.inner.subscriptions).remove(id);
    }

    async fn encrypt(
        &self,
        recipient: &str,
        plaintext: &str,
        keys: &Keys,
    ) -> Result<String, BusError> {
        Ok(format!(
            "{}>{}:{}",
            keys.public_key().to_hex(),
            recipient,
            STANDARD.encode(plaintext)
        ))
    }

    async fn decrypt(
        &self,
        sender: &str,
        ciphertext: &str,
        keys: &Keys,
    ) -> Result<String, BusError> {
        let (header, _) = ciphertext
            .split_once(':')
            .ok_or_else(|| BusError::Decrypt("missing header".to_string()))?;
        let (from, to) = header
            .split_once('>')
            .ok_or_else(|| BusError::Decrypt("bad header".to_string()))?;
        if from != sender || to != keys.public_key().to_hex() {
            return Err(BusError::Decrypt("not addressed to this key".to_string()));
        }
        MockNetwork::peek(ciphertext).ok_or_else(|| BusError::Decrypt("bad body".to_string()))
    }

    async fn relay_info(&self, relay: &str) -> Result<RelayInfo, BusError> {
        lock(&self.network.inner.relay_info)
            .get(relay)
            .cloned()
            .ok_or_else(|| BusError::RelayInfo(format!("no info for {}", relay)))
    }
}

// ============================================================================
// Mock direct transport
// ============================================================================

/// How mock direct links behave once both descriptions are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectMode {
    /// ICE connects and the data channel opens
    Healthy,
    /// ICE reports failure
    FailIce,
    /// ICE keeps checking forever
    Silent,
}

impl DirectMode {
    /// The worse of two modes wins
    fn combine(self, other: DirectMode) -> DirectMode {
        use DirectMode::*;
        match (self, other) {
            (FailIce, _) | (_, FailIce) => FailIce,
            (Silent, _) | (_, Silent) => Silent,
            _ => Healthy,
        }
    }
}

#[derive(Default)]
struct DirectNetworkInner {
    transports: Mutex<HashMap<u64, Weak<MockDirectTransport>>>,
    next_id: AtomicU64,
    candidates_applied: AtomicUsize,
    messages_sent: AtomicUsize,
}

/// Registry that links mock direct transports created by its factories
#[derive(Clone, Default)]
pub struct MockDirectNetwork {
    inner: Arc<DirectNetworkInner>,
}

impl MockDirectNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose transports behave according to `mode`
    pub fn factory(&self, mode: DirectMode) -> MockDirectFactory {
        MockDirectFactory {
            network: self.clone(),
            mode,
        }
    }

    /// Remote candidates applied by any transport
    pub fn candidates_applied(&self) -> usize {
        self.inner.candidates_applied.load(Ordering::Relaxed)
    }

    /// Messages carried over open data channels
    pub fn messages_sent(&self) -> usize {
        self.inner.messages_sent.load(Ordering::Relaxed)
    }

    fn get(&self, id: u64) -> Option<Arc<MockDirectTransport>> {
        lock(&self.inner.transports).get(&id).and_then(Weak::upgrade)
    }
}

/// [`DirectTransportFactory`] backed by a [`MockDirectNetwork`]
#[derive(Clone)]
pub struct MockDirectFactory {
    network: MockDirectNetwork,
    mode: DirectMode,
}

#[async_trait]
impl DirectTransportFactory for MockDirectFactory {
    async fn create(
        &self,
        config: DirectConfig,
    ) -> Result<(Arc<dyn DirectTransport>, mpsc::UnboundedReceiver<DirectEvent>), TransportError>
    {
        let id = self.network.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockDirectTransport {
            id,
            label: config.label,
            mode: self.mode,
            network: self.network.clone(),
            events,
            peer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        lock(&self.network.inner.transports).insert(id, Arc::downgrade(&transport));
        Ok((transport, rx))
    }
}

/// One end of a mock direct link
pub struct MockDirectTransport {
    id: u64,
    label: String,
    mode: DirectMode,
    network: MockDirectNetwork,
    events: mpsc::UnboundedSender<DirectEvent>,
    peer: Mutex<Option<Weak<MockDirectTransport>>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl MockDirectTransport {
    fn emit(&self, event: DirectEvent) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.events.send(event);
        }
    }

    fn peer(&self) -> Option<Arc<MockDirectTransport>> {
        lock(&self.peer).as_ref().and_then(Weak::upgrade)
    }

    fn local_candidate(&self) -> IceCandidate {
        let mut candidate = IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host",
            self.id,
            self.id % 250 + 1,
            self.id % 10
        ));
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_m_line_index = Some(0);
        candidate
    }

    fn parse_id(desc: &SessionDescription, kind: &str) -> Result<u64, TransportError> {
        desc.sdp
            .strip_prefix("mock-")
            .and_then(|rest| rest.split_once(' '))
            .filter(|(k, _)| *k == kind && desc.kind == kind)
            .and_then(|(_, id)| id.parse().ok())
            .ok_or_else(|| TransportError::InvalidDescription(desc.sdp.clone()))
    }

    /// Both descriptions are applied: run the connectivity outcome on both ends
    fn establish(&self, peer: &MockDirectTransport) {
        let mode = self.mode.combine(peer.mode);
        for end in [self, peer] {
            end.emit(DirectEvent::StateChange(DirectState::Checking));
        }
        match mode {
            DirectMode::Healthy => {
                for end in [self, peer] {
                    end.open.store(true, Ordering::Release);
                    end.emit(DirectEvent::StateChange(DirectState::Connected));
                    end.emit(DirectEvent::ChannelOpen);
                }
            }
            DirectMode::FailIce => {
                for end in [self, peer] {
                    end.emit(DirectEvent::StateChange(DirectState::Failed));
                }
            }
            DirectMode::Silent => {}
        }
    }
}

#[async_trait]
impl DirectTransport for MockDirectTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.emit(DirectEvent::LocalCandidate(self.local_candidate()));
        Ok(SessionDescription::offer(format!("mock-offer {}", self.id)))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote_id = Self::parse_id(offer, "offer")?;
        let remote = self
            .network
            .get(remote_id)
            .ok_or_else(|| TransportError::ConnectionFailed("offer no longer valid".to_string()))?;
        let me = self
            .network
            .get(self.id)
            .ok_or_else(|| TransportError::ConnectionFailed("transport dropped".to_string()))?;
        *lock(&self.peer) = Some(Arc::downgrade(&remote));
        *lock(&remote.peer) = Some(Arc::downgrade(&me));

        self.emit(DirectEvent::LocalCandidate(self.local_candidate()));
        Ok(SessionDescription::answer(format!("mock-answer {}", self.id)))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        let remote_id = Self::parse_id(answer, "answer")?;
        let peer = self
            .peer()
            .filter(|p| p.id == remote_id)
            .ok_or_else(|| TransportError::InvalidDescription("unexpected answer".to_string()))?;
        debug!("Mock direct link {} <-> {} ({})", self.id, peer.id, self.label);
        self.establish(&peer);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if candidate.candidate.is_empty() {
            return Err(TransportError::InvalidCandidate("empty".to_string()));
        }
        self.network
            .inner
            .candidates_applied
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let peer = self.peer().ok_or(TransportError::NotConnected)?;
        peer.emit(DirectEvent::Message(data.to_vec()));
        self.network
            .inner
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        if let Some(peer) = self.peer() {
            peer.open.store(false, Ordering::Release);
            peer.emit(DirectEvent::ChannelClosed);
            peer.emit(DirectEvent::StateChange(DirectState::Disconnected));
        }
        lock(&self.network.inner.transports).remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_delivery_and_faults() {
        let network = MockNetwork::new();
        let bus = network.bus();
        let keys = Keys::generate();
        let mut sub = bus
            .subscribe(&["wss://a".into()], vec![EventFilter::new().kind(1)])
            .await
            .unwrap();

        bus.publish(&["wss://a".into()], EventTemplate::new(1, "one"), &keys)
            .await
            .unwrap();
        // Other relay, not delivered
        bus.publish(&["wss://b".into()], EventTemplate::new(1, "two"), &keys)
            .await
            .unwrap();
        // Other kind, not delivered
        bus.publish(&[], EventTemplate::new(2, "three"), &keys)
            .await
            .unwrap();

        network.set_faults(Faults {
            drop_every: None,
            duplicate: true,
        });
        bus.publish(&[], EventTemplate::new(1, "four"), &keys)
            .await
            .unwrap();

        assert_eq!(sub.events.recv().await.unwrap().content, "one");
        assert_eq!(sub.events.recv().await.unwrap().content, "four");
        assert_eq!(sub.events.recv().await.unwrap().content, "four");
        assert!(sub.events.try_recv().is_err());
        assert_eq!(network.wire().len(), 4);

        bus.unsubscribe(&sub.id).await;
        assert_eq!(network.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_encryption_is_addressed() {
        let bus = MockNetwork::new().bus();
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let alice_pk = alice.public_key().to_hex();

        let ct = bus
            .encrypt(&bob.public_key().to_hex(), "secret", &alice)
            .await
            .unwrap();
        assert_eq!(bus.decrypt(&alice_pk, &ct, &bob).await.unwrap(), "secret");
        assert!(bus.decrypt(&alice_pk, &ct, &carol).await.is_err());
        assert!(bus
            .decrypt(&carol.public_key().to_hex(), &ct, &bob)
            .await
            .is_err());
        assert_eq!(MockNetwork::peek(&ct).as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_direct_link_healthy() {
        let network = MockDirectNetwork::new();
        let factory = network.factory(DirectMode::Healthy);
        let (a, mut a_events) = factory.create(DirectConfig::default()).await.unwrap();
        let (b, mut b_events) = factory.create(DirectConfig::default()).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.apply_answer(&answer).await.unwrap();

        assert!(matches!(
            a_events.recv().await,
            Some(DirectEvent::LocalCandidate(_))
        ));
        let mut opened = false;
        while let Ok(event) = b_events.try_recv() {
            opened |= event == DirectEvent::ChannelOpen;
        }
        assert!(opened);

        a.send(b"ping").await.unwrap();
        let mut got = None;
        while let Ok(event) = b_events.try_recv() {
            if let DirectEvent::Message(data) = event {
                got = Some(data);
            }
        }
        assert_eq!(got.as_deref(), Some(&b"ping"[..]));
    }

    #[tokio::test]
    async fn test_direct_link_ice_failure() {
        let network = MockDirectNetwork::new();
        let (a, mut a_events) = network
            .factory(DirectMode::Healthy)
            .create(DirectConfig::default())
            .await
            .unwrap();
        let (b, _b_events) = network
            .factory(DirectMode::FailIce)
            .create(DirectConfig::default())
            .await
            .unwrap();

        let answer = b.accept_offer(&a.create_offer().await.unwrap()).await.unwrap();
        a.apply_answer(&answer).await.unwrap();

        let mut failed = false;
        while let Ok(event) = a_events.try_recv() {
            failed |= event == DirectEvent::StateChange(DirectState::Failed);
        }
        assert!(failed);
        assert!(a.send(b"x").await.is_err());
    }
}
