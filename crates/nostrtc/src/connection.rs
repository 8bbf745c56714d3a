//! Per-peer connection state machine
//!
//! A [`PeerConnection`] negotiates a direct transport when the host has one
//! and keeps a [`ChunkedChannel`] to the same peer as fallback. Whichever
//! path is active, the owner sees one duplex byte channel and a stream of
//! [`ConnectionEvent`]s.
//!
//! The switch to fallback is one-way. It happens when there is no direct
//! capability, when the remote sent no description, when ICE fails, when
//! the direct path has not opened within the p2p attempt timeout after both
//! descriptions were applied, or when the remote already talks to us over
//! the fallback channel.

use nostr_sdk::Keys;
use nostrtc_config::{RtcSettings, TurnSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};

use crate::bus::MessageBus;
use crate::chunked::{ChannelError, ChannelEvent, ChunkedChannel, ChunkedChannelConfig};
use crate::direct::{
    DirectConfig, DirectEvent, DirectState, DirectTransport, DirectTransportFactory,
    TransportError,
};
use crate::types::{
    effective_status, short_id, CloseReason, ConnectionStatus, IceCandidate, SessionDescription,
    DATA_CHANNEL_PREFIX,
};

/// Errors from connection operations
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("Connection not ready")]
    NotReady,
    #[error("Direct transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Fallback channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// What happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// The logical channel became usable
    Connected,
    /// The connection committed to the fallback path
    FallbackEngaged,
    /// Local candidates to forward to the remote
    Candidates(Vec<IceCandidate>),
    Data(Vec<u8>),
    Error(String),
    Closed(CloseReason),
}

/// Event from a [`PeerConnection`] to its owner
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub peer_id: String,
    pub connection_id: String,
    pub kind: ConnectionEventKind,
}

/// Everything a connection needs to know about its peer and policy
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Remote identity (hex pubkey)
    pub peer_id: String,
    pub connection_id: String,
    pub initiator: bool,
    pub stun_servers: Vec<String>,
    /// Relays we listen on for fallback traffic
    pub listen_relays: Vec<String>,
    /// Relays the remote listens on for fallback traffic
    pub publish_relays: Vec<String>,
    pub rtc: RtcSettings,
    pub turn: TurnSettings,
}

struct ConnState {
    status: ConnectionStatus,
    last_update: Instant,
    using_fallback: bool,
    ready: bool,
    direct: Option<Arc<dyn DirectTransport>>,
    direct_open: bool,
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description
    pending_remote: Vec<IceCandidate>,
    local_candidates: Vec<IceCandidate>,
    fallback: Option<ChunkedChannel>,
}

struct ConnInner {
    config: ConnectionConfig,
    factory: Option<Arc<dyn DirectTransportFactory>>,
    state: Mutex<ConnState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
    candidate_wake: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
}

/// Connection to one remote peer
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnInner>,
}

impl PeerConnection {
    /// Create the connection and open its fallback channel
    pub async fn new(
        bus: Arc<dyn MessageBus>,
        keys: Keys,
        factory: Option<Arc<dyn DirectTransportFactory>>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, ConnectionError> {
        let span = tracing::info_span!(
            "conn",
            peer = %short_id(&config.peer_id),
            id = %short_id(&config.connection_id)
        );

        let (fallback, fallback_events) = ChunkedChannel::open(
            bus,
            keys,
            ChunkedChannelConfig {
                connection_id: config.connection_id.clone(),
                remote: config.peer_id.clone(),
                listen_relays: config.listen_relays.clone(),
                publish_relays: config.publish_relays.clone(),
                settings: config.turn.clone(),
            },
        )
        .instrument(span.clone())
        .await?;

        let inner = Arc::new(ConnInner {
            config,
            factory,
            state: Mutex::new(ConnState {
                status: ConnectionStatus::Connecting,
                last_update: Instant::now(),
                using_fallback: false,
                ready: false,
                direct: None,
                direct_open: false,
                remote_description_set: false,
                pending_remote: Vec::new(),
                local_candidates: Vec::new(),
                fallback: Some(fallback),
            }),
            events,
            closed: AtomicBool::new(false),
            candidate_wake: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            span,
        });

        inner.spawn(fallback_loop(Arc::downgrade(&inner), fallback_events));
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.config.connection_id
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.config.initiator
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Status as of now; a stale `connecting` reads as `disconnected`
    pub async fn status(&self) -> ConnectionStatus {
        let state = self.inner.state.lock().await;
        effective_status(
            state.status,
            state.last_update,
            Instant::now(),
            self.inner.config.rtc.connection_attempt_timeout(),
        )
    }

    pub async fn is_using_fallback(&self) -> bool {
        self.inner.state.lock().await.using_fallback
    }

    /// Local candidates gathered so far
    pub async fn local_candidates(&self) -> Vec<IceCandidate> {
        self.inner.state.lock().await.local_candidates.clone()
    }

    /// Start a direct attempt as initiator, returning the offer to send.
    ///
    /// Without a direct capability the connection commits to fallback and
    /// returns `None`; it becomes ready when the remote acknowledges.
    pub async fn initiate(&self) -> Result<Option<SessionDescription>, ConnectionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let Some(transport) = inner.create_direct().await else {
            inner.commit_fallback(false).await;
            return Ok(None);
        };
        match transport.create_offer().await {
            Ok(offer) => Ok(Some(offer)),
            Err(e) => {
                warn!(parent: &inner.span, "Creating offer failed: {}", e);
                inner.commit_fallback(false).await;
                Ok(None)
            }
        }
    }

    /// Accept an incoming attempt, returning the answer to send.
    ///
    /// Without a remote description or a direct capability the connection
    /// goes straight to the fallback path and is ready at once. A remote
    /// description that cannot be applied is an error.
    pub async fn accept(
        &self,
        offer: Option<SessionDescription>,
    ) -> Result<Option<SessionDescription>, ConnectionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let Some(offer) = offer else {
            inner.commit_fallback(true).await;
            return Ok(None);
        };
        let Some(transport) = inner.create_direct().await else {
            inner.commit_fallback(true).await;
            return Ok(None);
        };
        let answer = transport.accept_offer(&offer).await?;
        inner.remote_description_applied().await;
        Ok(Some(answer))
    }

    /// Apply the remote answer (initiator side)
    pub async fn set_remote_description(
        &self,
        answer: Option<SessionDescription>,
    ) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let direct = {
            let state = inner.state.lock().await;
            if state.using_fallback {
                None
            } else {
                state.direct.clone()
            }
        };

        let (Some(direct), Some(answer)) = (direct, answer) else {
            inner.commit_fallback(true).await;
            return Ok(());
        };
        if let Err(e) = direct.apply_answer(&answer).await {
            warn!(parent: &inner.span, "Applying answer failed: {}", e);
            inner.commit_fallback(true).await;
            return Ok(());
        }
        inner.remote_description_applied().await;
        Ok(())
    }

    /// Feed remote candidates to the direct transport
    pub async fn add_remote_candidates(&self, candidates: Vec<IceCandidate>) {
        let inner = &self.inner;
        let direct = {
            let mut state = inner.state.lock().await;
            if state.using_fallback || inner.closed.load(Ordering::Acquire) {
                return;
            }
            if !state.remote_description_set {
                state.pending_remote.extend(candidates);
                return;
            }
            match state.direct.clone() {
                Some(direct) => direct,
                None => return,
            }
        };
        inner.apply_candidates(direct, candidates).await;
    }

    /// Send bytes over the active path
    pub async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let (fallback, direct) = {
            let state = inner.state.lock().await;
            if state.using_fallback {
                (state.fallback.clone(), None)
            } else if state.direct_open {
                (None, state.direct.clone())
            } else {
                (None, None)
            }
        };
        if let Some(fallback) = fallback {
            fallback.write(data).await?;
        } else if let Some(direct) = direct {
            direct.send(data).await?;
        } else {
            return Err(ConnectionError::NotReady);
        }
        Ok(())
    }

    /// Close both paths and report `reason`. Idempotent.
    pub async fn close(&self, reason: CloseReason) {
        self.inner.close(reason).await;
    }
}

impl ConnInner {
    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            peer_id: self.config.peer_id.clone(),
            connection_id: self.config.connection_id.clone(),
            kind,
        };
        // The owner may already be gone
        if let Err(e) = self.events.send(event) {
            trace!("Dropped connection event {:?}", e.0.kind);
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut.instrument(self.span.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Create the direct transport, or `None` when the host has none
    async fn create_direct(self: &Arc<Self>) -> Option<Arc<dyn DirectTransport>> {
        let factory = self.factory.as_ref()?;
        let config = DirectConfig {
            label: format!("{}{}", DATA_CHANNEL_PREFIX, self.config.connection_id),
            ice_servers: self.config.stun_servers.clone(),
        };
        let (transport, events) = match factory.create(config).await {
            Ok(created) => created,
            Err(e) => {
                warn!(parent: &self.span, "Direct transport unavailable: {}", e);
                return None;
            }
        };
        self.state.lock().await.direct = Some(transport.clone());
        self.spawn(direct_loop(Arc::downgrade(self), events));
        self.spawn(candidate_loop(Arc::downgrade(self)));
        Some(transport)
    }

    /// Both descriptions are in place: flush early candidates, start the p2p clock
    async fn remote_description_applied(self: &Arc<Self>) {
        let (direct, pending) = {
            let mut state = self.state.lock().await;
            state.remote_description_set = true;
            (state.direct.clone(), std::mem::take(&mut state.pending_remote))
        };
        if let Some(direct) = direct {
            if !pending.is_empty() {
                self.apply_candidates(direct, pending).await;
            }
        }

        let weak = Arc::downgrade(self);
        let timeout = self.config.rtc.p2p_attempt_timeout();
        self.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let stalled = {
                let state = inner.state.lock().await;
                !state.direct_open && !state.using_fallback
            };
            if stalled {
                info!("Direct path did not open within {:?}", timeout);
                inner.commit_fallback(true).await;
            }
        });
    }

    async fn apply_candidates(&self, direct: Arc<dyn DirectTransport>, candidates: Vec<IceCandidate>) {
        for candidate in &candidates {
            if let Err(e) = direct.add_remote_candidate(candidate).await {
                debug!(parent: &self.span, "Ignoring remote candidate: {}", e);
            }
        }
    }

    /// Switch to the fallback path. Only the first call has effect.
    async fn commit_fallback(&self, ready: bool) {
        let switched = {
            let mut state = self.state.lock().await;
            if state.using_fallback {
                None
            } else {
                state.using_fallback = true;
                state.direct_open = false;
                Some((state.direct.take(), state.fallback.is_some()))
            }
        };

        if let Some((direct, has_fallback)) = switched {
            info!(parent: &self.span, "Using relay fallback");
            self.emit(ConnectionEventKind::FallbackEngaged);
            if let Some(direct) = direct {
                direct.close().await;
            }
            if !has_fallback {
                self.close(CloseReason::error("fallback channel unavailable"))
                    .await;
                return;
            }
        }
        if ready {
            self.mark_ready().await;
        }
    }

    async fn mark_ready(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let first = {
            let mut state = self.state.lock().await;
            if state.ready {
                false
            } else {
                state.ready = true;
                state.status = ConnectionStatus::Connected;
                state.last_update = Instant::now();
                true
            }
        };
        if first {
            info!(parent: &self.span, "Connected");
            self.emit(ConnectionEventKind::Connected);
        }
    }

    async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (direct, fallback) = {
            let mut state = self.state.lock().await;
            state.status = ConnectionStatus::Disconnected;
            state.last_update = Instant::now();
            state.direct_open = false;
            (state.direct.take(), state.fallback.take())
        };
        debug!(parent: &self.span, "Closing: {}", reason);

        if let Some(direct) = direct {
            direct.close().await;
        }
        if let Some(fallback) = fallback {
            fallback.close(CloseReason::message("Connection closed")).await;
        }
        self.candidate_wake.notify_one();
        self.emit(ConnectionEventKind::Closed(reason));

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
    }
}

async fn direct_loop(inner: Weak<ConnInner>, mut events: mpsc::UnboundedReceiver<DirectEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        match event {
            DirectEvent::LocalCandidate(candidate) => {
                inner.state.lock().await.local_candidates.push(candidate);
                inner.candidate_wake.notify_one();
            }
            DirectEvent::StateChange(DirectState::Failed) => {
                warn!("ICE failed");
                inner.commit_fallback(true).await;
            }
            DirectEvent::StateChange(state) => {
                debug!("ICE state {:?}", state);
            }
            DirectEvent::ChannelOpen => {
                let open = {
                    let mut state = inner.state.lock().await;
                    if !state.using_fallback {
                        state.direct_open = true;
                    }
                    state.direct_open
                };
                if open {
                    inner.mark_ready().await;
                }
            }
            DirectEvent::Message(data) => {
                inner.emit(ConnectionEventKind::Data(data));
            }
            DirectEvent::ChannelClosed => {
                let was_open = inner.state.lock().await.direct_open;
                if was_open {
                    warn!("Data channel closed, switching to relay fallback");
                    inner.commit_fallback(true).await;
                }
            }
        }
    }
}

async fn fallback_loop(inner: Weak<ConnInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Data(data) => {
                // The remote gave up on the direct path before we did
                if !inner.state.lock().await.using_fallback {
                    inner.commit_fallback(true).await;
                }
                inner.emit(ConnectionEventKind::Data(data));
            }
            ChannelEvent::Closed(reason) => {
                let using_fallback = {
                    let mut state = inner.state.lock().await;
                    state.fallback = None;
                    state.using_fallback
                };
                if using_fallback {
                    if let CloseReason::Error(e) = &reason {
                        inner.emit(ConnectionEventKind::Error(e.clone()));
                    }
                    inner.close(reason).await;
                } else if !inner.closed.load(Ordering::Acquire) {
                    warn!("Fallback channel lost: {}", reason);
                }
                break;
            }
        }
    }
}

/// Debounced emission of local candidates plus a periodic full re-emission
async fn candidate_loop(inner: Weak<ConnInner>) {
    let (debounce, reemit) = match inner.upgrade() {
        Some(inner) => (
            inner.config.rtc.candidate_debounce(),
            inner.config.rtc.candidate_reemit_interval(),
        ),
        None => return,
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + reemit, reemit);

    loop {
        let Some(this) = inner.upgrade() else {
            break;
        };
        tokio::select! {
            _ = this.candidate_wake.notified() => {
                tokio::time::sleep(debounce).await;
            }
            _ = ticker.tick() => {}
        }
        if this.closed.load(Ordering::Acquire) {
            break;
        }
        let candidates = {
            let state = this.state.lock().await;
            if state.using_fallback {
                break;
            }
            state.local_candidates.clone()
        };
        if !candidates.is_empty() {
            debug!("Emitting {} local candidates", candidates.len());
            this.emit(ConnectionEventKind::Candidates(candidates));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DirectMode, MockDirectNetwork, MockNetwork};
    use std::time::Duration;
    use tracing_subscriber::util::SubscriberInitExt;

    struct Side {
        conn: PeerConnection,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    async fn side(
        network: &MockNetwork,
        factory: Option<Arc<dyn DirectTransportFactory>>,
        keys: &Keys,
        remote: &Keys,
        initiator: bool,
    ) -> Side {
        let (tx, events) = mpsc::unbounded_channel();
        let conn = PeerConnection::new(
            Arc::new(network.bus()),
            keys.clone(),
            factory,
            ConnectionConfig {
                peer_id: remote.public_key().to_hex(),
                connection_id: "conn-1".to_string(),
                initiator,
                stun_servers: vec![],
                listen_relays: vec![],
                publish_relays: vec![],
                rtc: RtcSettings::default(),
                turn: TurnSettings::default(),
            },
            tx,
        )
        .await
        .unwrap();
        Side { conn, events }
    }

    async fn next_kind(side: &mut Side) -> ConnectionEventKind {
        tokio::time::timeout(Duration::from_secs(30), side.events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
            .kind
    }

    async fn wait_for(side: &mut Side, want: impl Fn(&ConnectionEventKind) -> bool) -> ConnectionEventKind {
        loop {
            let kind = next_kind(side).await;
            if want(&kind) {
                return kind;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_gone_still_closes() {
        let _logs = tracing_subscriber::fmt()
            .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
            .with_test_writer()
            .set_default();
        let network = MockNetwork::new();
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let Side { conn, events } = side(&network, None, &ka, &kb, false).await;
        drop(events);

        // Fallback and readiness events have nowhere to go
        assert_eq!(conn.accept(None).await.unwrap(), None);
        assert!(conn.is_using_fallback().await);
        conn.close(CloseReason::message("done")).await;
        assert!(conn.is_closed());
        assert!(matches!(conn.write(b"x").await, Err(ConnectionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_direct_capability_uses_fallback() {
        let network = MockNetwork::new();
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let mut a = side(&network, None, &ka, &kb, true).await;
        let mut b = side(&network, None, &kb, &ka, false).await;

        assert_eq!(a.conn.initiate().await.unwrap(), None);
        assert_eq!(next_kind(&mut a).await, ConnectionEventKind::FallbackEngaged);
        // Initiator waits for the ack
        assert_eq!(a.conn.status().await, ConnectionStatus::Connecting);

        assert_eq!(b.conn.accept(None).await.unwrap(), None);
        assert_eq!(next_kind(&mut b).await, ConnectionEventKind::FallbackEngaged);
        assert_eq!(next_kind(&mut b).await, ConnectionEventKind::Connected);

        a.conn.set_remote_description(None).await.unwrap();
        assert_eq!(next_kind(&mut a).await, ConnectionEventKind::Connected);
        assert_eq!(a.conn.status().await, ConnectionStatus::Connected);

        a.conn.write(b"hello").await.unwrap();
        assert_eq!(
            wait_for(&mut b, |k| matches!(k, ConnectionEventKind::Data(_))).await,
            ConnectionEventKind::Data(b"hello".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_path() {
        let network = MockNetwork::new();
        let direct = MockDirectNetwork::new();
        let factory: Arc<dyn DirectTransportFactory> = Arc::new(direct.factory(DirectMode::Healthy));
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let mut a = side(&network, Some(factory.clone()), &ka, &kb, true).await;
        let mut b = side(&network, Some(factory), &kb, &ka, false).await;

        let offer = a.conn.initiate().await.unwrap();
        assert!(offer.is_some());
        let answer = b.conn.accept(offer).await.unwrap();
        assert!(answer.is_some());
        a.conn.set_remote_description(answer).await.unwrap();

        wait_for(&mut a, |k| *k == ConnectionEventKind::Connected).await;
        wait_for(&mut b, |k| *k == ConnectionEventKind::Connected).await;
        assert!(!a.conn.is_using_fallback().await);

        b.conn.write(b"direct").await.unwrap();
        assert_eq!(
            wait_for(&mut a, |k| matches!(k, ConnectionEventKind::Data(_))).await,
            ConnectionEventKind::Data(b"direct".to_vec())
        );
        assert_eq!(direct.messages_sent(), 1);

        // Local candidates are flushed after the debounce
        let kind = wait_for(&mut a, |k| matches!(k, ConnectionEventKind::Candidates(_))).await;
        assert!(matches!(kind, ConnectionEventKind::Candidates(c) if c.len() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_failure_falls_back() {
        let network = MockNetwork::new();
        let direct = MockDirectNetwork::new();
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let mut a = side(&network, Some(Arc::new(direct.factory(DirectMode::FailIce))), &ka, &kb, true).await;
        let mut b = side(&network, Some(Arc::new(direct.factory(DirectMode::Healthy))), &kb, &ka, false).await;

        let answer = b.conn.accept(a.conn.initiate().await.unwrap()).await.unwrap();
        a.conn.set_remote_description(answer).await.unwrap();

        wait_for(&mut a, |k| *k == ConnectionEventKind::FallbackEngaged).await;
        wait_for(&mut a, |k| *k == ConnectionEventKind::Connected).await;
        wait_for(&mut b, |k| *k == ConnectionEventKind::Connected).await;
        assert!(a.conn.is_using_fallback().await);

        // Remote descriptions are ignored once on fallback
        a.conn.set_remote_description(None).await.unwrap();
        a.conn.write(b"over relay").await.unwrap();
        assert_eq!(
            wait_for(&mut b, |k| matches!(k, ConnectionEventKind::Data(_))).await,
            ConnectionEventKind::Data(b"over relay".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_p2p_timeout_falls_back() {
        let network = MockNetwork::new();
        let direct = MockDirectNetwork::new();
        let factory: Arc<dyn DirectTransportFactory> = Arc::new(direct.factory(DirectMode::Silent));
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let mut a = side(&network, Some(factory.clone()), &ka, &kb, true).await;
        let mut b = side(&network, Some(factory), &kb, &ka, false).await;

        let answer = b.conn.accept(a.conn.initiate().await.unwrap()).await.unwrap();
        let start = Instant::now();
        a.conn.set_remote_description(answer).await.unwrap();

        wait_for(&mut a, |k| *k == ConnectionEventKind::Connected).await;
        assert!(start.elapsed() >= RtcSettings::default().p2p_attempt_timeout());
        wait_for(&mut b, |k| *k == ConnectionEventKind::Connected).await;
        assert!(b.conn.is_using_fallback().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_offer_is_rejected() {
        let network = MockNetwork::new();
        let direct = MockDirectNetwork::new();
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let b = side(&network, Some(Arc::new(direct.factory(DirectMode::Healthy))), &kb, &ka, false).await;

        let result = b.conn.accept(Some(SessionDescription::offer("garbage"))).await;
        assert!(matches!(result, Err(ConnectionError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let network = MockNetwork::new();
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let mut a = side(&network, None, &ka, &kb, true).await;

        a.conn.close(CloseReason::message("bye")).await;
        a.conn.close(CloseReason::message("again")).await;

        assert_eq!(
            wait_for(&mut a, |k| matches!(k, ConnectionEventKind::Closed(_))).await,
            ConnectionEventKind::Closed(CloseReason::message("bye"))
        );
        assert_eq!(a.conn.status().await, ConnectionStatus::Disconnected);
        assert!(matches!(a.conn.write(b"x").await, Err(ConnectionError::Closed)));
        assert!(a.events.try_recv().is_err());
        assert_eq!(network.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connecting_reads_disconnected() {
        let network = MockNetwork::new();
        let (ka, kb) = (Keys::generate(), Keys::generate());
        let a = side(&network, None, &ka, &kb, true).await;
        a.conn.initiate().await.unwrap();

        let timeout = RtcSettings::default().connection_attempt_timeout();
        tokio::time::advance(timeout + Duration::from_secs(1)).await;
        assert_eq!(a.conn.status().await, ConnectionStatus::Disconnected);
    }
}
