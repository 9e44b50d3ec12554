//! WebRTC-backed implementation of the peer transport capability.
//!
//! Maps the [`PeerLink`]/[`ByteChannel`] traits onto webrtc-rs:
//! `RTCPeerConnection` for the negotiated connection and a single ordered,
//! fully reliable `RTCDataChannel` per peer for control frames and binary
//! chunks. Descriptions are exchanged as JSON-serialized
//! `RTCSessionDescription` values; candidate gathering is completed before
//! a description is handed to signaling, so the produced SDP is
//! self-contained.

use crate::config::{CHANNEL_OPEN_TIMEOUT, ICE_GATHER_TIMEOUT};
use crate::error::{Error, Result};
use crate::transport::{
    ByteChannel, LinkState, NegotiationState, PathType, PeerLink, PeerTransport,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

// ── Transport ────────────────────────────────────────────────────────────────

/// Factory for WebRTC peer links.
pub struct WebRtcTransport {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    /// Transport with the default STUN/TURN server set.
    pub fn new() -> Self {
        Self {
            ice_servers: Self::default_ice_servers(),
        }
    }

    /// Transport with caller-supplied ICE servers.
    pub fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }

    fn default_ice_servers() -> Vec<RTCIceServer> {
        vec![
            RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: String::new(),
                credential: String::new(),
            },
            RTCIceServer {
                urls: vec!["turn:openrelay.metered.ca:80".into()],
                username: "openrelayproject".into(),
                credential: "openrelayproject".into(),
            },
        ]
    }

    async fn create_api() -> Result<webrtc::api::API> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;
        Ok(APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build())
    }
}

impl Default for WebRtcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn new_link(&self) -> Result<Arc<dyn PeerLink>> {
        let api = Self::create_api().await?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );
        Ok(Arc::new(WebRtcLink::new(pc)))
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

/// A peer link over one `RTCPeerConnection`.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<LinkState>,
    incoming_tx: mpsc::UnboundedSender<Arc<dyn ByteChannel>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn ByteChannel>>>>,
}

impl WebRtcLink {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::New);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        // Connectivity monitoring.
        let state_tx = Arc::new(state_tx);
        {
            let state_tx = state_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let state_tx = state_tx.clone();
                Box::pin(async move {
                    let mapped = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => {
                            info!(event = "link_connected", "Peer connection established");
                            LinkState::Connected
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(
                                event = "link_disconnected",
                                "Transient disconnect (connectivity may recover)"
                            );
                            LinkState::Disconnected
                        }
                        RTCPeerConnectionState::Failed => {
                            error!(event = "link_failed", "Peer connection failed");
                            LinkState::Failed
                        }
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    let _ = state_tx.send(mapped);
                })
            }));
        }

        // Channels opened by the remote side.
        {
            let incoming_tx = incoming_tx.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let incoming_tx = incoming_tx.clone();
                Box::pin(async move {
                    let chan: Arc<dyn ByteChannel> = Arc::new(WebRtcChannel::attach(dc));
                    let _ = incoming_tx.send(chan);
                })
            }));
        }

        Self {
            pc,
            state_rx,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Wait for ICE gathering to complete, then return the local
    /// description as a JSON string. Gathering before sending keeps the
    /// envelope self-contained for relays that drop late candidates.
    async fn gather_local_description(&self) -> Result<String> {
        if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let (tx, rx) = oneshot::channel::<()>();
            let tx = Arc::new(Mutex::new(Some(tx)));
            self.pc.on_ice_gathering_state_change(Box::new(move |state| {
                let tx = tx.clone();
                Box::pin(async move {
                    if state == RTCIceGathererState::Complete {
                        if let Ok(mut guard) = tx.lock() {
                            if let Some(tx) = guard.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                })
            }));

            if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
                timeout(ICE_GATHER_TIMEOUT, rx).await.map_err(|_| {
                    Error::Protocol("candidate gathering timed out".into())
                })?.ok();
            }
        }

        let desc = self.pc.local_description().await.ok_or_else(|| {
            Error::Protocol("no local description after candidate gathering".into())
        })?;
        Ok(serde_json::to_string(&desc)?)
    }

    fn parse_description(sdp: &str) -> Result<RTCSessionDescription> {
        Ok(serde_json::from_str(sdp)?)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.gather_local_description().await
    }

    async fn apply_offer(&self, sdp: &str) -> Result<String> {
        let desc = Self::parse_description(sdp)?;
        self.pc.set_remote_description(desc).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.gather_local_description().await
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let desc = Self::parse_description(sdp)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => NegotiationState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => NegotiationState::HaveRemoteOffer,
            _ => NegotiationState::Stable,
        }
    }

    async fn restart_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await?;
        self.pc.set_local_description(offer).await?;
        self.gather_local_description().await
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn ByteChannel>> {
        // Explicit ordered + fully reliable (no partial reliability).
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(Arc::new(WebRtcChannel::attach(dc)))
    }

    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn ByteChannel>>> {
        self.incoming_rx.lock().ok()?.take()
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    async fn path_type(&self) -> PathType {
        if self.pc.connection_state() != RTCPeerConnectionState::Connected {
            return PathType::Unknown;
        }

        // Navigate: SCTP -> DTLS -> ICE transport.
        let sctp = self.pc.sctp();
        let dtls = sctp.transport();
        let ice = dtls.ice_transport();
        let Some(pair) = ice.get_selected_candidate_pair().await else {
            return PathType::Unknown;
        };

        if pair.local.typ == RTCIceCandidateType::Relay
            || pair.remote.typ == RTCIceCandidateType::Relay
        {
            PathType::Relayed
        } else {
            PathType::Direct
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "link_close_failure", error = %e, "Error closing peer connection");
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// The single ordered/reliable byte channel over an `RTCDataChannel`.
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    open_rx: watch::Receiver<bool>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl WebRtcChannel {
    fn attach(dc: Arc<RTCDataChannel>) -> Self {
        let (open_tx, open_rx) = watch::channel(dc.ready_state() == RTCDataChannelState::Open);
        let open_tx = Arc::new(open_tx);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        {
            let open_tx = open_tx.clone();
            dc.on_open(Box::new(move || {
                let open_tx = open_tx.clone();
                Box::pin(async move {
                    let _ = open_tx.send(true);
                })
            }));
        }
        {
            let open_tx = open_tx.clone();
            dc.on_close(Box::new(move || {
                let open_tx = open_tx.clone();
                Box::pin(async move {
                    let _ = open_tx.send(false);
                })
            }));
        }
        dc.on_message(Box::new(move |msg| {
            let frame_tx = frame_tx.clone();
            Box::pin(async move {
                let _ = frame_tx.send(msg.data);
            })
        }));

        let label = dc.label().to_string();
        Self {
            dc,
            label,
            open_rx,
            incoming_rx: Mutex::new(Some(frame_rx)),
        }
    }
}

#[async_trait]
impl ByteChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn ready(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.dc.ready_state() == RTCDataChannelState::Closed {
            return Err(Error::Protocol(format!(
                "channel '{}' is permanently closed",
                self.label
            )));
        }

        let mut open_rx = self.open_rx.clone();
        let wait = async {
            loop {
                if *open_rx.borrow() {
                    return Ok(());
                }
                if open_rx.changed().await.is_err() {
                    return Err(Error::Protocol(format!(
                        "channel '{}' dropped before opening",
                        self.label
                    )));
                }
            }
        };
        match timeout(CHANNEL_OPEN_TIMEOUT, wait).await {
            Ok(res) => res,
            Err(_) => Err(Error::Protocol(format!(
                "channel '{}' open timeout (state: {:?})",
                self.label,
                self.dc.ready_state()
            ))),
        }
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        self.dc.send(&frame).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming_rx.lock().ok()?.take()
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            warn!(event = "channel_close_failure", channel = %self.label, error = %e, "Error closing channel");
        }
    }
}
