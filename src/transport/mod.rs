//! Transport capabilities consumed by the engine.
//!
//! The engine does not implement NAT traversal or message relaying itself;
//! it drives a standard offer/answer/candidate exchange over two injected
//! capabilities:
//!
//! - [`SignalingTransport`]: a reliable, relay-only message bus used solely
//!   to deliver [`SignalingMessage`] envelopes to a peer id.
//! - [`PeerTransport`]: a factory for [`PeerLink`]s, negotiated per-peer
//!   connections that expose ordered/reliable [`ByteChannel`]s.
//!
//! The production implementation over webrtc-rs lives in [`webrtc`]; an
//! in-memory implementation for hermetic tests lives in
//! [`crate::testing`].

pub mod webrtc;

use crate::error::Result;
use crate::protocol::SignalingMessage;
use crate::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Connectivity state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Detected path classification, sampled once connectivity establishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Unknown,
    /// Host or reflexive candidates on both ends.
    Direct,
    /// At least one end goes through a relay.
    Relayed,
}

/// Where the offer/answer state machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    /// We produced an offer and await the remote answer.
    HaveLocalOffer,
    /// We applied a remote offer and owe an answer.
    HaveRemoteOffer,
}

/// Relay-only delivery of connection-setup envelopes.
///
/// Fire-and-forget: implementations must not block on acknowledgement.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, to: &PeerId, message: SignalingMessage) -> Result<()>;
}

/// Factory for negotiated per-peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn new_link(&self) -> Result<Arc<dyn PeerLink>>;
}

/// One negotiated connection to one peer.
///
/// Descriptions are opaque strings produced and consumed by the same
/// implementation; the engine only routes them through signaling.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce a local offer description (initiating side).
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and produce the answer description.
    async fn apply_offer(&self, sdp: &str) -> Result<String>;

    /// Apply the remote answer to a previously created offer.
    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    /// Add a remote connectivity candidate. Callers must only invoke this
    /// once the remote description is set; see
    /// [`has_remote_description`](Self::has_remote_description).
    async fn add_candidate(&self, candidate: &str) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    fn negotiation_state(&self) -> NegotiationState;

    /// Produce a fresh offer that restarts connectivity without destroying
    /// the logical session.
    async fn restart_offer(&self) -> Result<String>;

    /// Open the ordered/reliable byte channel with the given label
    /// (initiating side; the remote side receives it via
    /// [`take_incoming_channels`](Self::take_incoming_channels)).
    async fn open_channel(&self, label: &str) -> Result<Arc<dyn ByteChannel>>;

    /// Receiver of channels opened by the remote side. Yields `Some` once;
    /// subsequent calls return `None`.
    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn ByteChannel>>>;

    /// Watch connectivity state transitions.
    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Path classification of the selected candidate pair, if established.
    async fn path_type(&self) -> PathType;

    async fn close(&self);
}

/// Ordered, reliable byte channel bound to one peer link.
///
/// Closing the channel tears down the link and vice versa; the engine
/// relies on [`LinkState`] for teardown notification.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Wait until the channel is open, bounded by
    /// [`crate::config::CHANNEL_OPEN_TIMEOUT`].
    async fn ready(&self) -> Result<()>;

    /// Queue one frame for ordered delivery.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Bytes queued locally but not yet handed to the wire. Drives the
    /// per-channel backpressure gate.
    async fn buffered_amount(&self) -> usize;

    /// Receiver of inbound frames. Yields `Some` once; subsequent calls
    /// return `None`.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    async fn close(&self);
}
