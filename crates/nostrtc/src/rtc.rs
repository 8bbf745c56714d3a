//! WebRTC direct transport
//!
//! Wraps the webrtc crate to implement [`DirectTransportFactory`]. Callbacks
//! from the peer connection and its data channel are forwarded as
//! [`DirectEvent`]s.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::direct::{
    DirectConfig, DirectEvent, DirectState, DirectTransport, DirectTransportFactory,
    TransportError,
};
use crate::types::{IceCandidate, SessionDescription};

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn direct_state(state: RTCIceConnectionState) -> DirectState {
    match state {
        RTCIceConnectionState::Checking => DirectState::Checking,
        RTCIceConnectionState::Connected => DirectState::Connected,
        RTCIceConnectionState::Completed => DirectState::Completed,
        RTCIceConnectionState::Disconnected => DirectState::Disconnected,
        RTCIceConnectionState::Failed => DirectState::Failed,
        RTCIceConnectionState::Closed => DirectState::Closed,
        _ => DirectState::New,
    }
}

type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Direct transports backed by the webrtc crate
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }

    async fn create_connection(
        ice_servers: &[String],
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(failed)
    }
}

#[async_trait]
impl DirectTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: DirectConfig,
    ) -> Result<(Arc<dyn DirectTransport>, mpsc::UnboundedReceiver<DirectEvent>), TransportError>
    {
        let connection = Self::create_connection(&config.ice_servers).await?;
        let (events, rx) = mpsc::unbounded_channel();
        let channel: ChannelSlot = Arc::new(RwLock::new(None));

        let tx = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(DirectEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => debug!("Cannot serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        connection.on_ice_connection_state_change(Box::new(move |state| {
            trace!("ICE connection state: {:?}", state);
            let _ = tx.send(DirectEvent::StateChange(direct_state(state)));
            Box::pin(async {})
        }));

        // Acceptor side: the initiator's channel arrives here
        let tx = events.clone();
        let slot = channel.clone();
        let label = config.label.clone();
        connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let slot = slot.clone();
            let label = label.clone();
            Box::pin(async move {
                if dc.label() != label {
                    debug!("Ignoring unexpected data channel {}", dc.label());
                    return;
                }
                wire_channel(&dc, tx, slot).await;
            })
        }));

        let transport = WebRtcTransport {
            connection,
            label: config.label,
            channel,
            events,
        };
        Ok((Arc::new(transport), rx))
    }
}

/// Forward data channel callbacks as events
async fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    tx: mpsc::UnboundedSender<DirectEvent>,
    slot: ChannelSlot,
) {
    let open_tx = tx.clone();
    let open_slot = slot.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            *open_slot.write().await = Some(open_dc);
            let _ = open_tx.send(DirectEvent::ChannelOpen);
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let _ = tx.send(DirectEvent::Message(msg.data.to_vec()));
        })
    }));

    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(DirectEvent::ChannelClosed);
        })
    }));

    // Incoming channels may already be open when handed to us
    if dc.ready_state() == RTCDataChannelState::Open {
        *slot.write().await = Some(dc.clone());
        let _ = tx.send(DirectEvent::ChannelOpen);
    }
}

/// One webrtc peer connection with a single data channel
pub struct WebRtcTransport {
    connection: Arc<RTCPeerConnection>,
    label: String,
    channel: ChannelSlot,
    events: mpsc::UnboundedSender<DirectEvent>,
}

#[async_trait]
impl DirectTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .connection
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(failed)?;
        wire_channel(&dc, self.events.clone(), self.channel.clone()).await;

        let offer = self.connection.create_offer(None).await.map_err(failed)?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(failed)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if offer.kind != "offer" {
            return Err(TransportError::InvalidDescription(format!(
                "expected offer, got {}",
                offer.kind
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.connection
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;

        let answer = self.connection.create_answer(None).await.map_err(failed)?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(failed)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        if answer.kind != "answer" {
            return Err(TransportError::InvalidDescription(format!(
                "expected answer, got {}",
                answer.kind
            )));
        }
        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.connection
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let dc = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        dc.send(&bytes::Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        let channel = self.channel.write().await.take();
        if let Some(dc) = channel {
            let _ = dc.close().await;
        }
        if let Err(e) = self.connection.close().await {
            debug!("Closing peer connection failed: {}", e);
        }
    }
}
