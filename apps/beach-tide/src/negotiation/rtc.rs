//! [`PeerLink`] backed by the `webrtc` crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::peer::{PeerError, PeerEvent, PeerFactory, PeerLink, PeerState};
use crate::channel::{ChannelError, ChannelSpec, OutboundChannel};
use crate::signaling::{IceCandidate, Jsep, JsepKind};

/// Sends fail once this much data is queued on a channel.
const MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

fn to_peer_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::new(err.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_peer_error)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(to_peer_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_description(jsep: &Jsep) -> Result<RTCSessionDescription, PeerError> {
    match jsep.kind {
        JsepKind::Offer => RTCSessionDescription::offer(jsep.sdp.clone()),
        JsepKind::Answer => RTCSessionDescription::answer(jsep.sdp.clone()),
    }
    .map_err(to_peer_error)
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl RtcPeerLink {
    pub async fn new(ice_servers: &[String]) -> Result<Self, PeerError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_peer_error)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let events_tx = events_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let candidate = match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => Some(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                            Err(err) => {
                                tracing::warn!(
                                    target = "negotiation",
                                    error = %err,
                                    "failed to serialize local candidate",
                                );
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = events_tx.send(PeerEvent::LocalCandidate(candidate));
                })
            }));
        }
        {
            let events_tx = events_tx.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let _ = events_tx.send(PeerEvent::NegotiationNeeded);
                })
            }));
        }
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events_tx = events_tx.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "negotiation",
                    state = ?state,
                    "peer connection state changed",
                );
                let _ = events_tx.send(PeerEvent::StateChanged(map_state(state)));
            })
        }));

        Ok(Self {
            pc,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<Jsep, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(to_peer_error)?;
        Ok(Jsep::offer(offer.sdp))
    }

    async fn apply_local(&self, offer: &Jsep) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_description(offer)?)
            .await
            .map_err(to_peer_error)
    }

    async fn apply_remote(&self, answer: &Jsep) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_description(answer)?)
            .await
            .map_err(to_peer_error)
    }

    async fn open_channel(
        &self,
        spec: &ChannelSpec,
    ) -> Result<Arc<dyn OutboundChannel>, PeerError> {
        let dc = self
            .pc
            .create_data_channel(&spec.label, Some(spec.reliability.into()))
            .await
            .map_err(to_peer_error)?;
        Ok(Arc::new(RtcChannel::new(dc, spec.label.clone())))
    }

    async fn receive_media(&self) -> Result<(), PeerError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map_err(to_peer_error)?;
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "negotiation", error = %err, "peer connection close failed");
        }
    }
}

pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerLink>, PeerError> {
        Ok(Arc::new(RtcPeerLink::new(&self.ice_servers).await?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    Connecting,
    Open,
    Closed,
}

struct RtcChannel {
    channel: Arc<RTCDataChannel>,
    label: String,
    state_rx: watch::Receiver<OpenState>,
}

impl RtcChannel {
    fn new(channel: Arc<RTCDataChannel>, label: String) -> Self {
        let initial = match channel.ready_state() {
            RTCDataChannelState::Open => OpenState::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => OpenState::Closed,
            _ => OpenState::Connecting,
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);

        {
            let state_tx = Arc::clone(&state_tx);
            let label = label.clone();
            channel.on_open(Box::new(move || {
                tracing::info!(target = "negotiation", channel = %label, "data channel open");
                state_tx.send_replace(OpenState::Open);
                Box::pin(async {})
            }));
        }
        {
            let label = label.clone();
            channel.on_close(Box::new(move || {
                tracing::info!(target = "negotiation", channel = %label, "data channel closed");
                state_tx.send_replace(OpenState::Closed);
                Box::pin(async {})
            }));
        }

        Self {
            channel,
            label,
            state_rx,
        }
    }
}

#[async_trait]
impl OutboundChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        *self.state_rx.borrow() == OpenState::Open
    }

    async fn wait_open(&self) -> Result<(), ChannelError> {
        let mut state_rx = self.state_rx.clone();
        let state = state_rx
            .wait_for(|state| *state != OpenState::Connecting)
            .await
            .map(|state| *state)
            .unwrap_or(OpenState::Closed);
        match state {
            OpenState::Open => Ok(()),
            _ => Err(ChannelError::Closed(self.label.clone())),
        }
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.label.clone()));
        }
        let buffered = self.channel.buffered_amount().await;
        if buffered > MAX_BUFFERED_BYTES {
            return Err(ChannelError::Backpressure {
                label: self.label.clone(),
                buffered,
            });
        }
        self.channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| ChannelError::Send(err.to_string()))
    }
}
