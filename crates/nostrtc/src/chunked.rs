//! Reliable chunked channel over the message bus
//!
//! Used when the direct path is unavailable. Each write is zlib-compressed,
//! base64-encoded and split into fixed-size chunks. Exactly one packet is
//! in flight per direction: the sender retransmits unacknowledged chunks of
//! the head packet until every chunk is acked, the receiver reassembles one
//! packet at a time and acks each chunk as it arrives.
//!
//! Wire format (JSON, encrypted to the remote):
//! - `{"packet":{"packetId":0,"chunkId":0,"nChunks":2,"data":"eJz..."}}`
//! - `{"ack":{"packetId":0,"chunkId":0}}`
//!
//! [`ChunkedState`] is the pure protocol state; [`ChunkedChannel`] drives it
//! over a [`MessageBus`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use nostr_sdk::Keys;
use nostrtc_config::TurnSettings;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn, Instrument};

use crate::bus::{unix_now, EventFilter, EventTemplate, MessageBus, SignedEvent};
use crate::signaling::turn_address;
use crate::types::{short_id, CloseReason};

/// Violations of the chunk protocol by the remote side
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Chunk {chunk_id} out of range for packet {packet_id} with {n_chunks} chunks")]
    InvalidChunk {
        packet_id: u64,
        chunk_id: usize,
        n_chunks: usize,
    },
    #[error("Received packet {got} while packet {expected} is in progress")]
    UnexpectedPacket { expected: u64, got: u64 },
    #[error("Packet {packet_id} announced {got} chunks, expected {expected}")]
    ChunkCountMismatch {
        packet_id: u64,
        expected: usize,
        got: usize,
    },
    #[error("Packet {packet_id} announced {n_chunks} chunks, limit is {max}")]
    TooManyChunks {
        packet_id: u64,
        n_chunks: usize,
        max: usize,
    },
    #[error("Conflicting duplicate of chunk {chunk_id} in packet {packet_id}")]
    DuplicateChunk { packet_id: u64, chunk_id: usize },
    #[error("Ack for unknown packet {0}")]
    UnknownPacket(u64),
    #[error("Ack for unknown chunk {chunk_id} of packet {packet_id}")]
    UnknownChunk { packet_id: u64, chunk_id: usize },
    #[error("Cannot decode packet {packet_id}: {reason}")]
    Decode { packet_id: u64, reason: String },
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Errors surfaced by a [`ChunkedChannel`]
#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Timeout on {direction} packet {packet_id}")]
    Timeout {
        packet_id: u64,
        direction: &'static str,
    },
    #[error("Payload encodes to {size} characters, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Bus error: {0}")]
    Bus(#[from] crate::bus::BusError),
    #[error("Channel closed")]
    Closed,
}

/// A chunk on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPacket {
    pub packet_id: u64,
    pub chunk_id: usize,
    pub n_chunks: usize,
    pub data: String,
}

/// Acknowledgement of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub packet_id: u64,
    pub chunk_id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMessage {
    Packet(ChunkPacket),
    Ack(ChunkAck),
}

/// Compress and encode a payload into its chunk text
pub fn encode_payload(data: &[u8]) -> Result<String, ChannelError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ChannelError::Encode(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| ChannelError::Encode(e.to_string()))?;
    Ok(STANDARD.encode(compressed))
}

/// Inverse of [`encode_payload`]
pub fn decode_payload(text: &str) -> Result<Vec<u8>, String> {
    let compressed = STANDARD.decode(text).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    Ok(out)
}

/// Split encoded text into chunks of at most `chunk_length` characters
fn split_chunks(text: &str, chunk_length: usize) -> Vec<String> {
    // base64 output is ASCII, byte offsets are char offsets
    text.as_bytes()
        .chunks(chunk_length.max(1))
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

#[derive(Debug)]
struct OutboundChunk {
    data: String,
    acknowledged: bool,
    last_attempt: Option<Instant>,
}

#[derive(Debug)]
struct OutboundPacket {
    id: u64,
    chunks: Vec<OutboundChunk>,
    sent: usize,
    acked: usize,
    /// Set when the packet reaches the head of the queue
    started: Option<Instant>,
}

#[derive(Debug)]
struct InboundPacket {
    id: u64,
    chunks: Vec<Option<String>>,
    received: usize,
    started: Instant,
}

/// Result of handling an incoming chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Ack to send back
    pub ack: ChunkAck,
    /// Reassembled payload when this chunk completed its packet
    pub payload: Option<Vec<u8>>,
}

/// Protocol state of one channel end, free of I/O
#[derive(Debug)]
pub struct ChunkedState {
    chunk_length: usize,
    max_chunks: usize,
    max_latency: Duration,
    packet_timeout: Duration,
    next_packet_id: u64,
    outbound: VecDeque<OutboundPacket>,
    last_retired: Option<u64>,
    inbound: Option<InboundPacket>,
    last_delivered: Option<u64>,
}

impl ChunkedState {
    pub fn new(settings: &TurnSettings) -> Self {
        Self {
            chunk_length: settings.chunk_length.max(1),
            max_chunks: settings.max_chunks(),
            max_latency: settings.max_latency(),
            packet_timeout: settings.packet_timeout(),
            next_packet_id: 0,
            outbound: VecDeque::new(),
            last_retired: None,
            inbound: None,
            last_delivered: None,
        }
    }

    /// Queue a payload as a new packet, returning its id
    pub fn enqueue(&mut self, data: &[u8]) -> Result<u64, ChannelError> {
        let encoded = encode_payload(data)?;
        let max = self.max_chunks * self.chunk_length;
        if encoded.len() > max {
            return Err(ChannelError::TooLarge {
                size: encoded.len(),
                max,
            });
        }
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        let chunks = split_chunks(&encoded, self.chunk_length)
            .into_iter()
            .map(|data| OutboundChunk {
                data,
                acknowledged: false,
                last_attempt: None,
            })
            .collect();
        self.outbound.push_back(OutboundPacket {
            id,
            chunks,
            sent: 0,
            acked: 0,
            started: None,
        });
        Ok(id)
    }

    /// Chunks of the head packet that are due for (re)transmission
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<ChunkPacket> {
        let max_latency = self.max_latency;
        let Some(packet) = self.outbound.front_mut() else {
            return Vec::new();
        };
        packet.started.get_or_insert(now);

        let n_chunks = packet.chunks.len();
        let mut due = Vec::new();
        for (chunk_id, chunk) in packet.chunks.iter_mut().enumerate() {
            if chunk.acknowledged {
                continue;
            }
            match chunk.last_attempt {
                Some(at) if now.saturating_duration_since(at) < max_latency => continue,
                Some(_) => {}
                None => packet.sent += 1,
            }
            chunk.last_attempt = Some(now);
            due.push(ChunkPacket {
                packet_id: packet.id,
                chunk_id,
                n_chunks,
                data: chunk.data.clone(),
            });
        }
        due
    }

    /// Handle an incoming chunk
    pub fn on_packet(
        &mut self,
        packet: ChunkPacket,
        now: Instant,
    ) -> Result<Received, ProtocolError> {
        let ack = ChunkAck {
            packet_id: packet.packet_id,
            chunk_id: packet.chunk_id,
        };

        // Our ack was lost and the sender retried a finished packet
        if matches!(self.last_delivered, Some(last) if packet.packet_id <= last) {
            return Ok(Received { ack, payload: None });
        }

        if packet.n_chunks == 0 || packet.chunk_id >= packet.n_chunks {
            return Err(ProtocolError::InvalidChunk {
                packet_id: packet.packet_id,
                chunk_id: packet.chunk_id,
                n_chunks: packet.n_chunks,
            });
        }
        if packet.n_chunks > self.max_chunks {
            return Err(ProtocolError::TooManyChunks {
                packet_id: packet.packet_id,
                n_chunks: packet.n_chunks,
                max: self.max_chunks,
            });
        }

        let inbound = self.inbound.get_or_insert_with(|| InboundPacket {
            id: packet.packet_id,
            chunks: vec![None; packet.n_chunks],
            received: 0,
            started: now,
        });
        if inbound.id != packet.packet_id {
            return Err(ProtocolError::UnexpectedPacket {
                expected: inbound.id,
                got: packet.packet_id,
            });
        }
        if inbound.chunks.len() != packet.n_chunks {
            return Err(ProtocolError::ChunkCountMismatch {
                packet_id: packet.packet_id,
                expected: inbound.chunks.len(),
                got: packet.n_chunks,
            });
        }

        match &inbound.chunks[packet.chunk_id] {
            Some(existing) if *existing == packet.data => {
                return Ok(Received { ack, payload: None });
            }
            Some(_) => {
                return Err(ProtocolError::DuplicateChunk {
                    packet_id: packet.packet_id,
                    chunk_id: packet.chunk_id,
                });
            }
            None => {}
        }
        inbound.chunks[packet.chunk_id] = Some(packet.data);
        inbound.received += 1;

        if inbound.received < inbound.chunks.len() {
            return Ok(Received { ack, payload: None });
        }

        let text: String = inbound.chunks.iter().flatten().map(String::as_str).collect();
        let packet_id = inbound.id;
        self.inbound = None;
        self.last_delivered = Some(packet_id);
        let payload = decode_payload(&text)
            .map_err(|reason| ProtocolError::Decode { packet_id, reason })?;
        Ok(Received {
            ack,
            payload: Some(payload),
        })
    }

    /// Handle an incoming ack. Returns true when it retired the head packet.
    pub fn on_ack(&mut self, ack: ChunkAck) -> Result<bool, ProtocolError> {
        let head = match self.outbound.front_mut() {
            Some(head) if head.id == ack.packet_id => head,
            _ => {
                if matches!(self.last_retired, Some(last) if ack.packet_id <= last) {
                    return Ok(false);
                }
                return Err(ProtocolError::UnknownPacket(ack.packet_id));
            }
        };

        let chunk = head
            .chunks
            .get_mut(ack.chunk_id)
            .filter(|c| c.last_attempt.is_some())
            .ok_or(ProtocolError::UnknownChunk {
                packet_id: ack.packet_id,
                chunk_id: ack.chunk_id,
            })?;
        if !chunk.acknowledged {
            chunk.acknowledged = true;
            head.acked += 1;
        }

        if head.acked == head.sent && head.sent == head.chunks.len() {
            self.last_retired = Some(head.id);
            self.outbound.pop_front();
            return Ok(true);
        }
        Ok(false)
    }

    /// Fails when the active packet in either direction is older than the packet timeout
    pub fn check_timeouts(&self, now: Instant) -> Result<(), ChannelError> {
        if let Some(head) = self.outbound.front() {
            if let Some(started) = head.started {
                if now.saturating_duration_since(started) > self.packet_timeout {
                    return Err(ChannelError::Timeout {
                        packet_id: head.id,
                        direction: "outbound",
                    });
                }
            }
        }
        if let Some(inbound) = &self.inbound {
            if now.saturating_duration_since(inbound.started) > self.packet_timeout {
                return Err(ChannelError::Timeout {
                    packet_id: inbound.id,
                    direction: "inbound",
                });
            }
        }
        Ok(())
    }

    /// Earliest instant at which polling can make progress, if anything is pending
    pub fn next_wakeup(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |at: Instant| {
            next = Some(next.map_or(at, |n| n.min(at)));
        };

        if let Some(head) = self.outbound.front() {
            match head.started {
                None => return Some(Instant::now()),
                Some(started) => consider(started + self.packet_timeout),
            }
            for chunk in head.chunks.iter().filter(|c| !c.acknowledged) {
                match chunk.last_attempt {
                    Some(at) => consider(at + self.max_latency),
                    None => return Some(Instant::now()),
                }
            }
        }
        if let Some(inbound) = &self.inbound {
            consider(inbound.started + self.packet_timeout);
        }
        next
    }

    /// Packets waiting or in flight
    pub fn pending_packets(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_receiving(&self) -> bool {
        self.inbound.is_some()
    }
}

/// Events from a [`ChunkedChannel`] to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    Closed(CloseReason),
}

/// Addressing and tuning for one channel end
#[derive(Debug, Clone)]
pub struct ChunkedChannelConfig {
    pub connection_id: String,
    /// Remote identity (hex pubkey)
    pub remote: String,
    /// Relays we listen on
    pub listen_relays: Vec<String>,
    /// Relays the remote listens on
    pub publish_relays: Vec<String>,
    pub settings: TurnSettings,
}

struct ChannelInner {
    bus: Arc<dyn MessageBus>,
    keys: Keys,
    config: ChunkedChannelConfig,
    state: Mutex<ChunkedState>,
    closed: AtomicBool,
    wake: Notify,
    events: mpsc::UnboundedSender<ChannelEvent>,
    subscription_id: String,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Reliable ordered byte channel to one remote identity, tunneled over the bus
#[derive(Clone)]
pub struct ChunkedChannel {
    inner: Arc<ChannelInner>,
}

impl ChunkedChannel {
    /// Subscribe to the remote's chunk traffic and start the transmit loop
    pub async fn open(
        bus: Arc<dyn MessageBus>,
        keys: Keys,
        config: ChunkedChannelConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let filter = EventFilter::new()
            .kind(config.settings.kind)
            .author(config.remote.clone())
            .d_tag(turn_address(&config.connection_id))
            .since(unix_now().saturating_sub(config.settings.packet_timeout().as_secs()));
        let subscription = bus.subscribe(&config.listen_relays, vec![filter]).await?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            bus,
            keys,
            state: Mutex::new(ChunkedState::new(&config.settings)),
            config,
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            events,
            subscription_id: subscription.id.clone(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let span = tracing::debug_span!(
            "chunked",
            conn = %short_id(&inner.config.connection_id),
            remote = %short_id(&inner.config.remote)
        );
        let receiver = tokio::spawn(
            Self::receive_loop(Arc::downgrade(&inner), subscription.events).instrument(span.clone()),
        );
        let transmitter =
            tokio::spawn(Self::transmit_loop(Arc::downgrade(&inner)).instrument(span));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(receiver);
            tasks.push(transmitter);
        }

        debug!(
            "Chunked channel {} to {} open",
            short_id(&inner.config.connection_id),
            short_id(&inner.config.remote)
        );
        Ok((Self { inner }, events_rx))
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.config.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue a payload for delivery. Returns once it is queued.
    pub async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let packet_id = self.inner.state.lock().await.enqueue(data)?;
        trace!("Queued packet {} ({} bytes)", packet_id, data.len());
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Number of packets not yet fully acknowledged
    pub async fn pending_packets(&self) -> usize {
        self.inner.state.lock().await.pending_packets()
    }

    pub async fn close(&self, reason: CloseReason) {
        self.inner.close(reason).await;
    }

    async fn receive_loop(
        inner: std::sync::Weak<ChannelInner>,
        mut events: mpsc::Receiver<SignedEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = inner.handle_event(&event).await {
                inner.close(CloseReason::error(e)).await;
                break;
            }
        }
    }

    async fn transmit_loop(inner: std::sync::Weak<ChannelInner>) {
        loop {
            let Some(this) = inner.upgrade() else {
                break;
            };
            if this.closed.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            let (due, timeout, next) = {
                let mut state = this.state.lock().await;
                let timeout = state.check_timeouts(now);
                let due = if timeout.is_ok() {
                    state.poll_transmit(now)
                } else {
                    Vec::new()
                };
                (due, timeout, state.next_wakeup())
            };

            if let Err(e) = timeout {
                warn!("{}", e);
                this.close(CloseReason::error(e)).await;
                break;
            }

            for chunk in due {
                trace!(
                    "Sending chunk {}/{} of packet {}",
                    chunk.chunk_id + 1,
                    chunk.n_chunks,
                    chunk.packet_id
                );
                if let Err(e) = this.send(&ChunkMessage::Packet(chunk)).await {
                    // Retransmission covers lost sends
                    debug!("Chunk send failed: {}", e);
                }
            }

            let loop_interval = this.config.settings.loop_interval();
            let wake = this.wake.notified();
            match next {
                Some(at) => {
                    let at = at.max(Instant::now() + loop_interval);
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = wake => {}
                    }
                }
                None => wake.await,
            }
        }
    }
}

impl ChannelInner {
    async fn handle_event(&self, event: &SignedEvent) -> Result<(), ChannelError> {
        let plaintext = match self
            .bus
            .decrypt(&self.config.remote, &event.content, &self.keys)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping undecryptable chunk event: {}", e);
                return Ok(());
            }
        };
        let message: ChunkMessage = serde_json::from_str(&plaintext)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match message {
            ChunkMessage::Packet(packet) => {
                let received = {
                    let mut state = self.state.lock().await;
                    state.on_packet(packet, Instant::now())?
                };
                if let Err(e) = self.send(&ChunkMessage::Ack(received.ack)).await {
                    debug!("Ack send failed: {}", e);
                }
                if let Some(payload) = received.payload {
                    trace!("Packet {} complete ({} bytes)", received.ack.packet_id, payload.len());
                    if self.events.send(ChannelEvent::Data(payload)).is_err() {
                        trace!("Dropped payload, channel owner is gone");
                    }
                }
            }
            ChunkMessage::Ack(ack) => {
                let retired = self.state.lock().await.on_ack(ack)?;
                if retired {
                    trace!("Packet {} acknowledged", ack.packet_id);
                    self.wake.notify_one();
                }
            }
        }
        Ok(())
    }

    async fn send(&self, message: &ChunkMessage) -> Result<(), ChannelError> {
        let plaintext =
            serde_json::to_string(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
        let content = self
            .bus
            .encrypt(&self.config.remote, &plaintext, &self.keys)
            .await?;
        let expiration = unix_now() + self.config.settings.packet_timeout().as_secs().max(1);
        let template = EventTemplate::new(self.config.settings.kind, content)
            .d_tag(turn_address(&self.config.connection_id))
            .expiration(expiration);
        self.bus
            .publish(&self.config.publish_relays, template, &self.keys)
            .await?;
        Ok(())
    }

    async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "Closing chunked channel {}: {}",
            short_id(&self.config.connection_id),
            reason
        );
        if self.events.send(ChannelEvent::Closed(reason)).is_err() {
            trace!("Close not delivered, channel owner is gone");
        }
        self.wake.notify_one();
        self.bus.unsubscribe(&self.subscription_id).await;
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(chunk_length: usize) -> TurnSettings {
        TurnSettings {
            chunk_length,
            ..Default::default()
        }
    }

    fn chunk(packet_id: u64, chunk_id: usize, n_chunks: usize, data: &str) -> ChunkPacket {
        ChunkPacket {
            packet_id,
            chunk_id,
            n_chunks,
            data: data.to_string(),
        }
    }

    /// Move every due chunk from `a` to `b` and every ack back
    fn pump(a: &mut ChunkedState, b: &mut ChunkedState, now: Instant) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        for chunk in a.poll_transmit(now) {
            let received = b.on_packet(chunk, now).unwrap();
            a.on_ack(received.ack).unwrap();
            delivered.extend(received.payload);
        }
        delivered
    }

    #[test]
    fn test_encode_decode() {
        let data = b"hello hello hello hello".to_vec();
        let text = encode_payload(&data).unwrap();
        assert!(text.is_ascii());
        assert_eq!(decode_payload(&text).unwrap(), data);
    }

    #[test]
    fn test_chunk_count_matches_encoded_length() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7919 % 251) as u8).collect();
        let encoded = encode_payload(&data).unwrap();
        let mut state = ChunkedState::new(&settings(100));
        state.enqueue(&data).unwrap();

        let due = state.poll_transmit(Instant::now());
        assert_eq!(due.len(), encoded.len().div_ceil(100));
        assert!(due.iter().all(|c| c.n_chunks == due.len()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_in_order() {
        let mut a = ChunkedState::new(&settings(8));
        let mut b = ChunkedState::new(&settings(8));
        a.enqueue(b"first message").unwrap();
        a.enqueue(b"second message").unwrap();

        let now = Instant::now();
        assert_eq!(pump(&mut a, &mut b, now), vec![b"first message".to_vec()]);
        assert_eq!(a.pending_packets(), 1);
        assert_eq!(pump(&mut a, &mut b, now), vec![b"second message".to_vec()]);
        assert_eq!(a.pending_packets(), 0);
        assert!(a.poll_transmit(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_after_max_latency() {
        let mut a = ChunkedState::new(&settings(1024));
        a.enqueue(b"payload").unwrap();

        let start = Instant::now();
        assert_eq!(a.poll_transmit(start).len(), 1);
        assert!(a.poll_transmit(start + Duration::from_millis(500)).is_empty());
        let retry = a.poll_transmit(start + Duration::from_secs(2));
        assert_eq!(retry.len(), 1);

        // Retries do not count as new sends
        let mut b = ChunkedState::new(&settings(1024));
        let received = b.on_packet(retry[0].clone(), start).unwrap();
        assert!(a.on_ack(received.ack).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_chunk_is_reacked() {
        let mut a = ChunkedState::new(&settings(4));
        let mut b = ChunkedState::new(&settings(4));
        a.enqueue(b"some longer payload").unwrap();
        let now = Instant::now();
        let chunks = a.poll_transmit(now);
        assert!(chunks.len() > 1);

        let first = b.on_packet(chunks[0].clone(), now).unwrap();
        let again = b.on_packet(chunks[0].clone(), now).unwrap();
        assert_eq!(first.ack, again.ack);
        assert!(again.payload.is_none());

        // Duplicate acks are idempotent
        a.on_ack(first.ack).unwrap();
        a.on_ack(again.ack).unwrap();

        let mut delivered = None;
        for chunk in &chunks[1..] {
            let r = b.on_packet(chunk.clone(), now).unwrap();
            a.on_ack(r.ack).unwrap();
            delivered = r.payload.or(delivered);
        }
        assert_eq!(delivered.as_deref(), Some(&b"some longer payload"[..]));

        // A late copy of a finished packet is re-acked and ignored
        let late = b.on_packet(chunks[0].clone(), now).unwrap();
        assert!(late.payload.is_none());
        assert!(!b.is_receiving());
        assert!(!a.on_ack(late.ack).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_violations() {
        let now = Instant::now();
        let mut b = ChunkedState::new(&settings(4));
        assert!(matches!(
            b.on_packet(chunk(0, 3, 3, "x"), now),
            Err(ProtocolError::InvalidChunk { .. })
        ));
        b.on_packet(chunk(0, 0, 3, "aaaa"), now).unwrap();
        assert!(matches!(
            b.on_packet(chunk(1, 0, 3, "aaaa"), now),
            Err(ProtocolError::UnexpectedPacket { expected: 0, got: 1 })
        ));
        assert!(matches!(
            b.on_packet(chunk(0, 1, 4, "bbbb"), now),
            Err(ProtocolError::ChunkCountMismatch { .. })
        ));
        assert!(matches!(
            b.on_packet(chunk(0, 0, 3, "zzzz"), now),
            Err(ProtocolError::DuplicateChunk { .. })
        ));

        let mut a = ChunkedState::new(&settings(4));
        assert_eq!(
            a.on_ack(ChunkAck {
                packet_id: 0,
                chunk_id: 0
            }),
            Err(ProtocolError::UnknownPacket(0))
        );
        a.enqueue(b"abc").unwrap();
        a.poll_transmit(now);
        assert!(matches!(
            a.on_ack(ChunkAck {
                packet_id: 0,
                chunk_id: 99
            }),
            Err(ProtocolError::UnknownChunk { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_packets_are_refused() {
        let s = TurnSettings {
            chunk_length: 4,
            max_packet_size: 40,
            ..Default::default()
        };
        let now = Instant::now();

        let mut b = ChunkedState::new(&s);
        assert_eq!(
            b.on_packet(chunk(0, 0, 1 << 61, "aaaa"), now),
            Err(ProtocolError::TooManyChunks {
                packet_id: 0,
                n_chunks: 1 << 61,
                max: 10,
            })
        );
        assert!(!b.is_receiving());
        // The limit itself is fine
        b.on_packet(chunk(0, 0, 10, "aaaa"), now).unwrap();

        let mut a = ChunkedState::new(&s);
        let big: Vec<u8> = (0..200u32).map(|i| (i * 7919 % 251) as u8).collect();
        assert!(matches!(
            a.enqueue(&big),
            Err(ChannelError::TooLarge { max: 40, .. })
        ));
        assert_eq!(a.pending_packets(), 0);
        a.enqueue(b"ok").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_chunk_count_closes_channel() {
        let network = crate::mock::MockNetwork::new();
        let bus: Arc<dyn MessageBus> = Arc::new(network.bus());
        let local = Keys::generate();
        let remote = Keys::generate();
        let relays = vec!["wss://relay.test".to_string()];
        let settings = TurnSettings::default();

        let (channel, mut events) = ChunkedChannel::open(
            bus.clone(),
            local.clone(),
            ChunkedChannelConfig {
                connection_id: "conn-1".to_string(),
                remote: remote.public_key().to_hex(),
                listen_relays: relays.clone(),
                publish_relays: relays.clone(),
                settings: settings.clone(),
            },
        )
        .await
        .unwrap();

        let message = ChunkMessage::Packet(chunk(0, 0, usize::MAX, "aaaa"));
        let content = bus
            .encrypt(
                &local.public_key().to_hex(),
                &serde_json::to_string(&message).unwrap(),
                &remote,
            )
            .await
            .unwrap();
        let template = EventTemplate::new(settings.kind, content).d_tag(turn_address("conn-1"));
        bus.publish(&relays, template, &remote).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        match event {
            Some(ChannelEvent::Closed(reason)) => assert!(reason.is_error()),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(channel.is_closed());
        assert!(matches!(channel.write(b"late").await, Err(ChannelError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_timeout() {
        let s = settings(1024);
        let timeout = s.packet_timeout();
        let mut a = ChunkedState::new(&s);
        let start = Instant::now();

        // Queued but not yet started does not time out
        a.enqueue(b"one").unwrap();
        a.enqueue(b"two").unwrap();
        assert!(a.check_timeouts(start + timeout * 2).is_ok());

        a.poll_transmit(start);
        assert!(a.check_timeouts(start + timeout).is_ok());
        assert!(matches!(
            a.check_timeouts(start + timeout + Duration::from_millis(1)),
            Err(ChannelError::Timeout {
                packet_id: 0,
                direction: "outbound"
            })
        ));

        let mut b = ChunkedState::new(&s);
        b.on_packet(
            ChunkPacket {
                packet_id: 0,
                chunk_id: 0,
                n_chunks: 2,
                data: "ab".into(),
            },
            start,
        )
        .unwrap();
        assert!(matches!(
            b.check_timeouts(start + timeout + Duration::from_millis(1)),
            Err(ChannelError::Timeout {
                direction: "inbound",
                ..
            })
        ));
    }

    #[test]
    fn test_wire_format() {
        let msg = ChunkMessage::Ack(ChunkAck {
            packet_id: 3,
            chunk_id: 1,
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"ack":{"packetId":3,"chunkId":1}}"#
        );
        let parsed: ChunkMessage = serde_json::from_str(
            r#"{"packet":{"packetId":0,"chunkId":0,"nChunks":1,"data":"eJw="}}"#,
        )
        .unwrap();
        assert!(matches!(parsed, ChunkMessage::Packet(p) if p.n_chunks == 1));
    }
}
