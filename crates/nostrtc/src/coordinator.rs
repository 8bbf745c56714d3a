//! Peer discovery, connection admission and signaling dispatch
//!
//! The [`Coordinator`] owns the directory of discovered peers and the map of
//! active [`PeerConnection`]s. Background tasks announce our presence,
//! expire silent peers, connect to peers we are elected to initiate with,
//! and route incoming signaling payloads to the right connection.
//!
//! Tie-break: for every pair the lexicographically smaller identity
//! initiates, the other side only accepts.

use nostr_sdk::Keys;
use nostrtc_config::{Config, RtcSettings, TurnSettings};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};

use crate::bus::{unix_now, BusError, MessageBus, SignedEvent};
use crate::connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEventKind, PeerConnection,
};
use crate::direct::DirectTransportFactory;
use crate::signaling::{Incoming, Signaler, SignalingError};
use crate::types::{
    is_initiator, short_id, Announce, CloseReason, ConnectAck, ConnectRequest, ConnectionStatus,
    IceCandidate, Metadata, PeerInfo, RtcEvent, SignalingPayload,
};

const EVENT_CAPACITY: usize = 1024;

/// Errors returned to callers of coordinator operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Peer not discovered yet: {0}")]
    PeerNotDiscovered(String),
    #[error("Peer already connected or connecting: {0}")]
    AlreadyConnected(String),
    #[error("No connection to peer: {0}")]
    NotConnected(String),
    #[error("Coordinator already started")]
    AlreadyStarted,
    #[error("Coordinator stopped")]
    Stopped,
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Construction parameters for a [`Coordinator`]
#[derive(Clone)]
pub struct CoordinatorOptions {
    pub signaling_relays: Vec<String>,
    pub stun_servers: Vec<String>,
    /// Relays we advertise for fallback traffic
    pub fallback_relays: Vec<String>,
    /// Merge STUN servers advertised by the signaling relays
    pub use_relay_stun: bool,
    /// Merge fallback relays advertised by the signaling relays
    pub use_relay_fallback: bool,
    pub metadata: Metadata,
    pub rtc: RtcSettings,
    pub turn: TurnSettings,
    /// Host direct transport capability, `None` when unavailable
    pub direct: Option<Arc<dyn DirectTransportFactory>>,
    /// Parent span for every task; defaults to `nostrtc{local=..}`
    pub span: Option<tracing::Span>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            signaling_relays: config.signaling.relays.clone(),
            stun_servers: config.signaling.stun_servers.clone(),
            fallback_relays: config.signaling.fallback_relays.clone(),
            use_relay_stun: config.signaling.use_relay_stun,
            use_relay_fallback: config.signaling.use_relay_fallback,
            metadata: Metadata::new(),
            rtc: config.rtc.clone(),
            turn: config.turn.clone(),
            direct: None,
            span: None,
        }
    }
}

struct ConnEntry {
    conn: PeerConnection,
    /// Peer as known when the connection was created
    peer: PeerInfo,
}

struct CoordInner {
    bus: Arc<dyn MessageBus>,
    keys: Keys,
    local_id: String,
    signaler: Signaler,
    rtc: RtcSettings,
    turn: TurnSettings,
    direct: Option<Arc<dyn DirectTransportFactory>>,
    use_relay_stun: bool,
    use_relay_fallback: bool,
    stun_servers: RwLock<Vec<String>>,
    fallback_relays: RwLock<Vec<String>>,
    metadata: RwLock<Metadata>,
    peers: RwLock<BTreeMap<String, PeerInfo>>,
    banned: RwLock<BTreeSet<String>>,
    connections: RwLock<HashMap<String, ConnEntry>>,
    events: broadcast::Sender<RtcEvent>,
    conn_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    subscription_id: std::sync::Mutex<Option<String>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
}

/// Discovers peers in a room and manages connections to them
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordInner>,
}

impl Coordinator {
    /// `keys` is our identity, `channel_keys` the shared room key
    pub fn new(
        bus: Arc<dyn MessageBus>,
        keys: Keys,
        channel_keys: Keys,
        options: CoordinatorOptions,
    ) -> Self {
        let local_id = keys.public_key().to_hex();
        let span = options
            .span
            .clone()
            .unwrap_or_else(|| tracing::info_span!("nostrtc", local = %short_id(&local_id)));
        let signaler = Signaler::new(
            bus.clone(),
            keys.clone(),
            channel_keys,
            options.signaling_relays.clone(),
            options.rtc.kind,
            options.rtc.signal_expiration(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (conn_events_tx, conn_events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(CoordInner {
                bus,
                keys,
                local_id,
                signaler,
                rtc: options.rtc,
                turn: options.turn,
                direct: options.direct,
                use_relay_stun: options.use_relay_stun,
                use_relay_fallback: options.use_relay_fallback,
                stun_servers: RwLock::new(options.stun_servers),
                fallback_relays: RwLock::new(options.fallback_relays),
                metadata: RwLock::new(options.metadata),
                peers: RwLock::new(BTreeMap::new()),
                banned: RwLock::new(BTreeSet::new()),
                connections: RwLock::new(HashMap::new()),
                events,
                conn_events_tx,
                conn_events_rx: std::sync::Mutex::new(Some(conn_events_rx)),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                subscription_id: std::sync::Mutex::new(None),
                tasks: std::sync::Mutex::new(Vec::new()),
                span,
            }),
        }
    }

    /// Receive coordinator events. Each subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<RtcEvent> {
        self.inner.events.subscribe()
    }

    pub fn local_public_key(&self) -> &str {
        &self.inner.local_id
    }

    pub fn channel_public_key(&self) -> &str {
        self.inner.signaler.channel_id()
    }

    pub fn signaling_relays(&self) -> Vec<String> {
        self.inner.signaler.relays().to_vec()
    }

    pub async fn stun_servers(&self) -> Vec<String> {
        self.inner.stun_servers.read().await.clone()
    }

    pub async fn fallback_relays(&self) -> Vec<String> {
        self.inner.fallback_relays.read().await.clone()
    }

    pub async fn metadata(&self) -> Metadata {
        self.inner.metadata.read().await.clone()
    }

    /// Replace the metadata sent with future announcements
    pub async fn set_metadata(&self, metadata: Metadata) {
        *self.inner.metadata.write().await = metadata;
    }

    pub async fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.inner.peers.read().await.get(peer_id).cloned()
    }

    /// Identities of all discovered peers
    pub async fn list_peers(&self) -> Vec<String> {
        self.inner.peers.read().await.keys().cloned().collect()
    }

    pub async fn connection(&self, peer_id: &str) -> Option<PeerConnection> {
        self.inner
            .connections
            .read()
            .await
            .get(peer_id)
            .map(|e| e.conn.clone())
    }

    pub async fn connections(&self) -> Vec<PeerConnection> {
        self.inner
            .connections
            .read()
            .await
            .values()
            .map(|e| e.conn.clone())
            .collect()
    }

    pub async fn is_banned(&self, peer_id: &str) -> bool {
        self.inner.banned.read().await.contains(peer_id)
    }

    /// Subscribe to signaling and start the background loops
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return Err(CoordinatorError::Stopped);
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(CoordinatorError::AlreadyStarted);
        }

        inner.augment_from_relays().instrument(inner.span.clone()).await;

        let since = unix_now().saturating_sub(inner.rtc.announce_interval().as_secs());
        let subscription = inner
            .bus
            .subscribe(inner.signaler.relays(), inner.signaler.filters(since))
            .await?;
        if let Ok(mut id) = inner.subscription_id.lock() {
            *id = Some(subscription.id.clone());
        }

        let conn_events = inner
            .conn_events_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take());
        if let Some(conn_events) = conn_events {
            inner.spawn(dispatch_loop(Arc::downgrade(inner), conn_events));
        }
        inner.spawn(signaling_loop(Arc::downgrade(inner), subscription.events));
        inner.spawn(announce_loop(Arc::downgrade(inner)));
        inner.spawn(gc_loop(Arc::downgrade(inner)));
        inner.spawn(autoconnect_loop(Arc::downgrade(inner)));

        info!(
            parent: &inner.span,
            "Started in room {} on {} relays",
            short_id(inner.signaler.channel_id()),
            inner.signaler.relays().len()
        );
        Ok(())
    }

    /// Stop all loops, close every connection and forget all peers
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = match inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        let subscription = inner.subscription_id.lock().ok().and_then(|mut id| id.take());
        if let Some(id) = subscription {
            inner.bus.unsubscribe(&id).await;
        }

        let entries: Vec<ConnEntry> = inner
            .connections
            .write()
            .await
            .drain()
            .map(|(_, e)| e)
            .collect();
        for entry in entries {
            let reason = CloseReason::message("Stopped");
            entry.conn.close(reason.clone()).await;
            inner.emit(RtcEvent::Closed {
                peer: entry.peer,
                reason: Some(reason),
            });
        }
        inner.peers.write().await.clear();
        inner.banned.write().await.clear();
        info!(parent: &inner.span, "Stopped");
    }

    /// Initiate a connection to a discovered peer. Unbans the peer first.
    pub async fn connect(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        self.inner.connect(peer_id).await
    }

    /// Ban the peer and close its connection
    pub async fn disconnect(&self, peer_id: &str) {
        let inner = &self.inner;
        inner.ban(peer_id).await;
        if let Some(entry) = inner.take_entry(peer_id, None).await {
            inner
                .retire(entry, CloseReason::message("Disconnected by user"))
                .await;
        }
    }

    /// Forget the peer and ignore it until unbanned
    pub async fn ban(&self, peer_id: &str) {
        self.inner.ban(peer_id).await;
    }

    pub async fn unban(&self, peer_id: &str) {
        self.inner.banned.write().await.remove(peer_id);
    }

    /// Write bytes to a peer's connection
    pub async fn send(&self, peer_id: &str, data: &[u8]) -> Result<(), CoordinatorError> {
        let conn = self
            .connection(peer_id)
            .await
            .ok_or_else(|| CoordinatorError::NotConnected(peer_id.to_string()))?;
        conn.write(data).await?;
        Ok(())
    }

    /// Publish an announcement now instead of waiting for the next tick
    pub async fn announce(&self) -> Result<(), CoordinatorError> {
        let payload = SignalingPayload::announce(self.inner.announcement().await);
        self.inner.signaler.send_public(&payload).await?;
        Ok(())
    }
}

impl CoordInner {
    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut.instrument(self.span.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    fn emit(&self, event: RtcEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn announcement(&self) -> Announce {
        Announce {
            metadata: self.metadata.read().await.clone(),
            relay_hints: self.fallback_relays.read().await.clone(),
        }
    }

    /// Merge STUN and fallback relays advertised by the signaling relays
    async fn augment_from_relays(&self) {
        if !self.use_relay_stun && !self.use_relay_fallback {
            return;
        }
        for relay in self.signaler.relays() {
            let info = match self.bus.relay_info(relay).await {
                Ok(info) => info,
                Err(e) => {
                    debug!("No relay info from {}: {}", relay, e);
                    continue;
                }
            };
            if self.use_relay_stun {
                merge_unique(&mut *self.stun_servers.write().await, info.stun);
            }
            if self.use_relay_fallback {
                merge_unique(&mut *self.fallback_relays.write().await, info.turn);
            }
        }
    }

    async fn ban(&self, peer_id: &str) {
        self.banned.write().await.insert(peer_id.to_string());
        if self.peers.write().await.remove(peer_id).is_some() {
            debug!(parent: &self.span, "Banned {}", short_id(peer_id));
        }
    }

    /// Remove the peer's entry, optionally only if it holds `connection_id`
    async fn take_entry(&self, peer_id: &str, connection_id: Option<&str>) -> Option<ConnEntry> {
        let mut connections = self.connections.write().await;
        match (connections.get(peer_id), connection_id) {
            (Some(entry), Some(id)) if entry.conn.connection_id() != id => None,
            (Some(_), _) => connections.remove(peer_id),
            (None, _) => None,
        }
    }

    /// Close a connection the coordinator removed itself and report it
    async fn retire(&self, entry: ConnEntry, reason: CloseReason) {
        debug!(
            parent: &self.span,
            "Closing connection {} to {}: {}",
            short_id(entry.conn.connection_id()),
            short_id(&entry.peer.pubkey),
            reason
        );
        entry.conn.close(reason.clone()).await;
        let peer = self
            .peers
            .read()
            .await
            .get(&entry.peer.pubkey)
            .cloned()
            .unwrap_or(entry.peer);
        self.emit(RtcEvent::Closed {
            peer,
            reason: Some(reason),
        });
    }

    /// The peer's connection unless it is absent or effectively disconnected
    async fn live_connection(&self, peer_id: &str) -> Option<PeerConnection> {
        let conn = self
            .connections
            .read()
            .await
            .get(peer_id)
            .map(|e| e.conn.clone())?;
        if conn.is_closed() || conn.status().await == ConnectionStatus::Disconnected {
            return None;
        }
        Some(conn)
    }

    async fn connection_config(
        &self,
        peer: &PeerInfo,
        connection_id: String,
        initiator: bool,
    ) -> ConnectionConfig {
        let own_hints = self.fallback_relays.read().await.clone();
        let or_signaling = |relays: Vec<String>| {
            if relays.is_empty() {
                self.signaler.relays().to_vec()
            } else {
                relays
            }
        };
        ConnectionConfig {
            peer_id: peer.pubkey.clone(),
            connection_id,
            initiator,
            stun_servers: self.stun_servers.read().await.clone(),
            listen_relays: or_signaling(own_hints),
            publish_relays: or_signaling(peer.relay_hints.clone()),
            rtc: self.rtc.clone(),
            turn: self.turn.clone(),
        }
    }

    /// Create a connection and register it, unless another one appeared meanwhile
    async fn admit(
        &self,
        peer: &PeerInfo,
        connection_id: String,
        initiator: bool,
    ) -> Result<PeerConnection, CoordinatorError> {
        let config = self.connection_config(peer, connection_id, initiator).await;
        let conn = PeerConnection::new(
            self.bus.clone(),
            self.keys.clone(),
            self.direct.clone(),
            config,
            self.conn_events_tx.clone(),
        )
        .await?;

        let conflict = {
            let mut connections = self.connections.write().await;
            if connections.contains_key(&peer.pubkey) {
                true
            } else {
                connections.insert(
                    peer.pubkey.clone(),
                    ConnEntry {
                        conn: conn.clone(),
                        peer: peer.clone(),
                    },
                );
                false
            }
        };
        if conflict {
            conn.close(CloseReason::message("Connection raced")).await;
            return Err(CoordinatorError::AlreadyConnected(peer.pubkey.clone()));
        }
        self.emit(RtcEvent::Connecting(peer.clone()));
        Ok(conn)
    }

    async fn connect(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        if self.is_stopped() {
            return Err(CoordinatorError::Stopped);
        }
        self.banned.write().await.remove(peer_id);

        let peer = self
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::PeerNotDiscovered(peer_id.to_string()))?;

        let existing = self
            .connections
            .read()
            .await
            .get(peer_id)
            .map(|e| e.conn.clone());
        if let Some(existing) = existing {
            if !existing.is_closed()
                && existing.status().await != ConnectionStatus::Disconnected
            {
                return Err(CoordinatorError::AlreadyConnected(peer_id.to_string()));
            }
            if let Some(entry) = self.take_entry(peer_id, Some(existing.connection_id())).await {
                self.retire(entry, CloseReason::message("Connection attempt timed out"))
                    .await;
            }
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let conn = self.admit(&peer, connection_id.clone(), true).await?;
        info!(
            parent: &self.span,
            "Connecting to {} ({})",
            peer.short(),
            short_id(&connection_id)
        );

        let description = match conn.initiate().await {
            Ok(description) => description,
            Err(e) => {
                if let Some(entry) = self.take_entry(peer_id, Some(&connection_id)).await {
                    self.retire(entry, CloseReason::error(&e)).await;
                }
                return Err(e.into());
            }
        };

        let candidates = conn.local_candidates().await;
        let payload = SignalingPayload {
            announce: Some(self.announcement().await),
            connect: Some(ConnectRequest {
                connection_id,
                description,
            }),
            candidates: (!candidates.is_empty()).then_some(candidates),
            ..Default::default()
        };
        if let Err(e) = self.signaler.send_private(peer_id, &payload).await {
            // The attempt goes stale and is retried
            warn!(parent: &self.span, "Sending connect to {} failed: {}", peer.short(), e);
        }
        Ok(())
    }

    async fn handle_incoming(&self, incoming: Incoming) {
        let sender = incoming.sender;
        if self.banned.read().await.contains(&sender) {
            trace!("Ignoring {} from banned {}", incoming.payload.describe(), short_id(&sender));
            return;
        }
        trace!("Received {} from {}", incoming.payload.describe(), short_id(&sender));

        let payload = incoming.payload;
        if let Some(announce) = payload.announce {
            self.on_announce(&sender, announce, incoming.created_at).await;
        }
        if let Some(request) = payload.connect {
            self.on_connect(&sender, request).await;
        }
        if let Some(ack) = payload.connect_ack {
            self.on_connect_ack(&sender, ack).await;
        }
        if let Some(candidates) = payload.candidates {
            self.on_candidates(&sender, candidates).await;
        }
    }

    async fn on_announce(&self, sender: &str, announce: Announce, created_at: u64) {
        let age = unix_now().saturating_sub(created_at);
        if age > self.rtc.peer_expiration().as_secs() {
            trace!("Ignoring stale announcement from {}", short_id(sender));
            return;
        }

        let event = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(sender) {
                Some(peer) if created_at < peer.announced_at => None,
                Some(peer) => {
                    peer.refresh(announce, created_at);
                    Some(RtcEvent::Refreshed(peer.clone()))
                }
                None => {
                    let peer = PeerInfo::new(sender, announce, created_at);
                    peers.insert(sender.to_string(), peer.clone());
                    Some(RtcEvent::Discovered(peer))
                }
            }
        };
        if let Some(event) = event {
            if let RtcEvent::Discovered(peer) = &event {
                info!(parent: &self.span, "Discovered {}", peer.short());
            }
            self.emit(event);
        }
    }

    async fn on_connect(&self, sender: &str, request: ConnectRequest) {
        let Some(peer) = self.peers.read().await.get(sender).cloned() else {
            debug!("Connect from undiscovered {}", short_id(sender));
            return;
        };

        let existing = self
            .connections
            .read()
            .await
            .get(sender)
            .map(|e| e.conn.clone());
        if let Some(existing) = existing {
            if existing.connection_id() == request.connection_id {
                trace!("Duplicate connect {}", short_id(&request.connection_id));
                return;
            }
            let ours_pending = existing.is_initiator()
                && existing.status().await == ConnectionStatus::Connecting;
            let reason = if ours_pending {
                if is_initiator(&self.local_id, sender) {
                    debug!("Connection collision with {}, keeping ours", peer.short());
                    self.reply_ack(sender, &request.connection_id, None, Some("connection collision"))
                        .await;
                    return;
                }
                debug!("Connection collision with {}, yielding", peer.short());
                CloseReason::message("Connection collision")
            } else {
                CloseReason::message("Superseded by new connection")
            };
            if let Some(entry) = self.take_entry(sender, Some(existing.connection_id())).await {
                self.retire(entry, reason).await;
            }
        }

        let connection_id = request.connection_id;
        let conn = match self.admit(&peer, connection_id.clone(), false).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(parent: &self.span, "Cannot accept connection from {}: {}", peer.short(), e);
                self.reply_ack(sender, &connection_id, None, Some(e.to_string().as_str()))
                    .await;
                return;
            }
        };
        info!(
            parent: &self.span,
            "Accepting connection {} from {}",
            short_id(&connection_id),
            peer.short()
        );

        match conn.accept(request.description).await {
            Ok(answer) => {
                let candidates = conn.local_candidates().await;
                let payload = SignalingPayload {
                    connect_ack: Some(ConnectAck {
                        connection_id,
                        description: answer,
                        error: None,
                    }),
                    candidates: (!candidates.is_empty()).then_some(candidates),
                    ..Default::default()
                };
                if let Err(e) = self.signaler.send_private(sender, &payload).await {
                    warn!(parent: &self.span, "Sending connectAck to {} failed: {}", peer.short(), e);
                }
            }
            Err(e) => {
                warn!(parent: &self.span, "Rejecting connection from {}: {}", peer.short(), e);
                self.reply_ack(sender, &connection_id, None, Some(e.to_string().as_str()))
                    .await;
                if let Some(entry) = self.take_entry(sender, Some(&connection_id)).await {
                    self.retire(entry, CloseReason::error(&e)).await;
                }
            }
        }
    }

    async fn reply_ack(
        &self,
        recipient: &str,
        connection_id: &str,
        description: Option<crate::types::SessionDescription>,
        error: Option<&str>,
    ) {
        let payload = SignalingPayload {
            connect_ack: Some(ConnectAck {
                connection_id: connection_id.to_string(),
                description,
                error: error.map(str::to_string),
            }),
            ..Default::default()
        };
        if let Err(e) = self.signaler.send_private(recipient, &payload).await {
            warn!(parent: &self.span, "Sending connectAck to {} failed: {}", short_id(recipient), e);
        }
    }

    async fn on_connect_ack(&self, sender: &str, ack: ConnectAck) {
        let conn = self
            .connections
            .read()
            .await
            .get(sender)
            .map(|e| e.conn.clone());
        let Some(conn) = conn else {
            debug!("connectAck from {} without connection", short_id(sender));
            return;
        };
        if conn.connection_id() != ack.connection_id {
            debug!(
                "Rejecting connectAck from {}: connection id {} does not match {}",
                short_id(sender),
                short_id(&ack.connection_id),
                short_id(conn.connection_id())
            );
            return;
        }
        if !conn.is_initiator() || conn.status().await != ConnectionStatus::Connecting {
            debug!("Ignoring connectAck from {}: not connecting", short_id(sender));
            return;
        }

        if let Some(error) = ack.error {
            warn!(parent: &self.span, "Connection refused by {}: {}", short_id(sender), error);
            if let Some(entry) = self.take_entry(sender, Some(&ack.connection_id)).await {
                self.retire(entry, CloseReason::Error(error)).await;
            }
            return;
        }

        if let Err(e) = conn.set_remote_description(ack.description).await {
            if let Some(entry) = self.take_entry(sender, Some(&ack.connection_id)).await {
                self.retire(entry, CloseReason::error(e)).await;
            }
            return;
        }

        let candidates = conn.local_candidates().await;
        if !candidates.is_empty() {
            if let Err(e) = self
                .signaler
                .send_private(sender, &SignalingPayload::candidates(candidates))
                .await
            {
                debug!("Sending candidates to {} failed: {}", short_id(sender), e);
            }
        }
    }

    async fn on_candidates(&self, sender: &str, candidates: Vec<IceCandidate>) {
        let Some(peer) = self.peers.read().await.get(sender).cloned() else {
            return;
        };
        let Some(conn) = self.connection_of(sender).await else {
            trace!("Candidates from {} without connection", peer.short());
            return;
        };
        conn.add_remote_candidates(candidates.clone()).await;
        self.emit(RtcEvent::Candidates { peer, candidates });
    }

    async fn connection_of(&self, peer_id: &str) -> Option<PeerConnection> {
        self.connections
            .read()
            .await
            .get(peer_id)
            .map(|e| e.conn.clone())
    }

    /// Route an event from one of our connections; events from replaced
    /// connections are dropped
    async fn on_connection_event(&self, event: ConnectionEvent) {
        let peer = {
            let connections = self.connections.read().await;
            match connections.get(&event.peer_id) {
                Some(entry) if entry.conn.connection_id() == event.connection_id => {
                    entry.peer.clone()
                }
                _ => {
                    trace!(
                        "Dropping event from retired connection {}",
                        short_id(&event.connection_id)
                    );
                    return;
                }
            }
        };
        let peer = self
            .peers
            .read()
            .await
            .get(&event.peer_id)
            .cloned()
            .unwrap_or(peer);

        match event.kind {
            ConnectionEventKind::Connected => {
                info!(parent: &self.span, "Connected to {}", peer.short());
                self.emit(RtcEvent::Connected(peer));
            }
            ConnectionEventKind::FallbackEngaged => {
                self.emit(RtcEvent::FallbackEngaged(peer));
            }
            ConnectionEventKind::Candidates(candidates) => {
                let payload = SignalingPayload::candidates(candidates);
                if let Err(e) = self.signaler.send_private(&peer.pubkey, &payload).await {
                    debug!("Sending candidates to {} failed: {}", peer.short(), e);
                }
            }
            ConnectionEventKind::Data(data) => {
                self.emit(RtcEvent::Data { peer, data });
            }
            ConnectionEventKind::Error(error) => {
                self.emit(RtcEvent::Error { peer, error });
            }
            ConnectionEventKind::Closed(reason) => {
                self.take_entry(&event.peer_id, Some(&event.connection_id))
                    .await;
                info!(parent: &self.span, "Connection to {} closed: {}", peer.short(), reason);
                self.emit(RtcEvent::Closed {
                    peer,
                    reason: Some(reason),
                });
            }
        }
    }

    /// Expire silent peers and prune dead connections
    async fn collect_garbage(&self) {
        let now = Instant::now();
        let expiration = self.rtc.peer_expiration();
        let expired: Vec<PeerInfo> = {
            let mut peers = self.peers.write().await;
            let ids: Vec<String> = peers
                .values()
                .filter(|p| p.is_expired(now, expiration))
                .map(|p| p.pubkey.clone())
                .collect();
            ids.iter().filter_map(|id| peers.remove(id)).collect()
        };

        for peer in expired {
            info!(parent: &self.span, "Peer {} expired", peer.short());
            self.emit(RtcEvent::Expired(peer.clone()));
            if let Some(entry) = self.take_entry(&peer.pubkey, None).await {
                self.retire(entry, CloseReason::error("Peer expired")).await;
            }
        }

        let snapshot: Vec<(String, PeerConnection)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.conn.clone()))
            .collect();
        for (peer_id, conn) in snapshot {
            if conn.is_closed() {
                self.take_entry(&peer_id, Some(conn.connection_id())).await;
            } else if conn.status().await == ConnectionStatus::Disconnected {
                if let Some(entry) = self.take_entry(&peer_id, Some(conn.connection_id())).await {
                    self.retire(entry, CloseReason::message("Connection attempt timed out"))
                        .await;
                }
            }
        }
    }

    /// Connect to every peer we are elected to initiate with
    async fn autoconnect(&self) {
        let candidates: Vec<String> = self
            .peers
            .read()
            .await
            .keys()
            .filter(|id| is_initiator(&self.local_id, id))
            .cloned()
            .collect();
        for peer_id in candidates {
            if self.is_stopped() {
                return;
            }
            if self.live_connection(&peer_id).await.is_some() {
                continue;
            }
            if let Err(e) = self.connect(&peer_id).await {
                debug!("Autoconnect to {} failed: {}", short_id(&peer_id), e);
            }
        }
    }
}

fn merge_unique(target: &mut Vec<String>, extra: Vec<String>) {
    for item in extra {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

async fn signaling_loop(inner: Weak<CoordInner>, mut events: mpsc::Receiver<SignedEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.is_stopped() {
            break;
        }
        match inner.signaler.open(&event).await {
            Ok(Some(incoming)) => inner.handle_incoming(incoming).await,
            Ok(None) => {}
            Err(e) => debug!("Dropping signaling event {}: {}", short_id(&event.id), e),
        }
    }
    debug!("Signaling subscription ended");
}

async fn dispatch_loop(inner: Weak<CoordInner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_connection_event(event).await;
    }
}

async fn announce_loop(inner: Weak<CoordInner>) {
    let Some(period) = inner.upgrade().map(|i| i.rtc.announce_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.is_stopped() {
            break;
        }
        let payload = SignalingPayload::announce(inner.announcement().await);
        if let Err(e) = inner.signaler.send_public(&payload).await {
            warn!("Announce failed: {}", e);
        }
    }
}

async fn gc_loop(inner: Weak<CoordInner>) {
    let Some(period) = inner.upgrade().map(|i| i.rtc.gc_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.is_stopped() {
            break;
        }
        inner.collect_garbage().await;
    }
}

async fn autoconnect_loop(inner: Weak<CoordInner>) {
    let Some(period) = inner.upgrade().map(|i| i.rtc.autoconnect_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.is_stopped() {
            break;
        }
        inner.autoconnect().await;
    }
}
