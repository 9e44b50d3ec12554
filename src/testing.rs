//! In-memory transport implementations for hermetic tests.
//!
//! The engine's semantics (consent, mesh readiness, backpressure,
//! teardown) are independent of any real network stack, so tests exercise
//! them over these loopback implementations: a [`MemoryFabric`] whose
//! links pair through opaque offer/answer tokens, [`MemoryChannel`]s
//! backed by crossed unbounded queues, a [`RecordingSignaling`] that
//! captures envelopes, and a [`SignalingHub`] that routes them between
//! coordinators in one process.
//!
//! Descriptions are tokens of the form `offer:<link id>` / `answer:<link
//! id>`; applying one pairs the two links and flushes any channels opened
//! before pairing completed.

use crate::error::{Error, Result};
use crate::protocol::SignalingMessage;
use crate::transport::{
    ByteChannel, LinkState, NegotiationState, PathType, PeerLink, PeerTransport,
    SignalingTransport,
};
use crate::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};

// ── Byte channel ─────────────────────────────────────────────────────────────

/// Loopback byte channel: frames sent on one end appear on the other
/// end's incoming queue in order. `hold`/`release` drive an artificial
/// buffered-amount gauge for backpressure tests; `defer_ready`/
/// `finish_ready` keep the open handshake pending for stall tests.
pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    held: AtomicUsize,
    ready_ok: watch::Sender<bool>,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    peer: Mutex<Weak<MemoryChannel>>,
}

impl MemoryChannel {
    /// Build a crossed pair of channel ends with the given label.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            held: AtomicUsize::new(0),
            ready_ok: watch::channel(true).0,
            peer_tx: Mutex::new(Some(b_tx)),
            incoming: Mutex::new(Some(a_rx)),
            peer: Mutex::new(Weak::new()),
        });
        let b = Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            held: AtomicUsize::new(0),
            ready_ok: watch::channel(true).0,
            peer_tx: Mutex::new(Some(a_tx)),
            incoming: Mutex::new(Some(b_rx)),
            peer: Mutex::new(Weak::new()),
        });
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    /// Pin the buffered-amount gauge at `n` bytes.
    pub fn hold(&self, n: usize) {
        self.held.store(n, Ordering::SeqCst);
    }

    /// Drain the artificial gauge back to zero.
    pub fn release(&self) {
        self.held.store(0, Ordering::SeqCst);
    }

    /// Make `ready()` pend until [`finish_ready`](Self::finish_ready).
    pub fn defer_ready(&self) {
        let _ = self.ready_ok.send(false);
    }

    /// Resolve a deferred open handshake.
    pub fn finish_ready(&self) {
        let _ = self.ready_ok.send(true);
    }
}

#[async_trait]
impl ByteChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn ready(&self) -> Result<()> {
        let mut rx = self.ready_ok.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ChannelClosed {
                peer: self.label.clone(),
            })
        }
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed {
                peer: self.label.clone(),
            });
        }
        let tx = self.peer_tx.lock().unwrap().clone();
        match tx {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(Error::ChannelClosed {
                peer: self.label.clone(),
            }),
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming.lock().unwrap().take()
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.peer_tx.lock().unwrap() = None;
        let peer = self.peer.lock().unwrap().upgrade();
        if let Some(peer) = peer {
            peer.open.store(false, Ordering::SeqCst);
            *peer.peer_tx.lock().unwrap() = None;
        }
    }
}

// ── Link fabric ──────────────────────────────────────────────────────────────

/// Registry of loopback links, pairable across negotiator instances in
/// one process.
pub struct MemoryFabric {
    next_id: AtomicU64,
    links: Mutex<HashMap<u64, Arc<MemoryLink>>>,
    /// Links created through the [`PeerTransport`] handle, in order.
    transport_links: Mutex<Vec<Arc<MemoryLink>>>,
}

impl MemoryFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            transport_links: Mutex::new(Vec::new()),
        })
    }

    /// A [`PeerTransport`] whose links register with this fabric.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn PeerTransport> {
        Arc::new(MemoryTransport {
            fabric: self.clone(),
        })
    }

    /// Links created through [`transport`](Self::transport), in creation
    /// order.
    pub fn transport_links(&self) -> Vec<Arc<MemoryLink>> {
        self.transport_links.lock().unwrap().clone()
    }

    fn lookup(&self, id: u64) -> Option<Arc<MemoryLink>> {
        self.links.lock().unwrap().get(&id).cloned()
    }
}

struct MemoryTransport {
    fabric: Arc<MemoryFabric>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn new_link(&self) -> Result<Arc<dyn PeerLink>> {
        let link = MemoryLink::create(&self.fabric);
        self.fabric.transport_links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

/// Loopback peer link. Offers and answers are `offer:<id>` /
/// `answer:<id>` tokens; applying one pairs the links and connects both
/// state watches.
pub struct MemoryLink {
    id: u64,
    fabric: Weak<MemoryFabric>,
    state: watch::Sender<LinkState>,
    negotiation: Mutex<NegotiationState>,
    remote: Mutex<Option<u64>>,
    candidates: Mutex<Vec<String>>,
    /// Far channel ends opened before pairing completed.
    pending_channels: Mutex<Vec<Arc<MemoryChannel>>>,
    incoming_tx: mpsc::UnboundedSender<Arc<dyn ByteChannel>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn ByteChannel>>>>,
}

impl MemoryLink {
    /// Create a link registered with the fabric but not associated with
    /// any transport handle (the "remote side" of a test).
    pub fn create(fabric: &Arc<MemoryFabric>) -> Arc<Self> {
        let id = fabric.next_id.fetch_add(1, Ordering::SeqCst);
        let (state, _) = watch::channel(LinkState::New);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id,
            fabric: Arc::downgrade(fabric),
            state,
            negotiation: Mutex::new(NegotiationState::Stable),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            pending_channels: Mutex::new(Vec::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        });
        fabric.links.lock().unwrap().insert(id, link.clone());
        link
    }

    /// Candidates applied to this link, in arrival order.
    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    /// Drive the state watch to `Failed`.
    pub fn fail(&self) {
        let _ = self.state.send(LinkState::Failed);
    }

    fn remote_link(&self) -> Option<Arc<MemoryLink>> {
        let id = (*self.remote.lock().unwrap())?;
        self.fabric.upgrade()?.lookup(id)
    }

    fn flush_pending(&self) {
        let Some(remote) = self.remote_link() else {
            return;
        };
        for far in self.pending_channels.lock().unwrap().drain(..) {
            let _ = remote.incoming_tx.send(far);
        }
    }
}

fn parse_token(prefix: &str, token: &str) -> Result<u64> {
    token
        .strip_prefix(prefix)
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed description token: {token}")))
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<String> {
        *self.negotiation.lock().unwrap() = NegotiationState::HaveLocalOffer;
        Ok(format!("offer:{}", self.id))
    }

    async fn apply_offer(&self, sdp: &str) -> Result<String> {
        let remote_id = parse_token("offer:", sdp)?;
        *self.remote.lock().unwrap() = Some(remote_id);
        *self.negotiation.lock().unwrap() = NegotiationState::Stable;
        let _ = self.state.send(LinkState::Connected);
        self.flush_pending();
        Ok(format!("answer:{}", self.id))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let remote_id = parse_token("answer:", sdp)?;
        *self.remote.lock().unwrap() = Some(remote_id);
        *self.negotiation.lock().unwrap() = NegotiationState::Stable;
        let _ = self.state.send(LinkState::Connected);
        self.flush_pending();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate.to_string());
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.lock().unwrap().is_some()
    }

    fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.lock().unwrap()
    }

    async fn restart_offer(&self) -> Result<String> {
        *self.negotiation.lock().unwrap() = NegotiationState::HaveLocalOffer;
        Ok(format!("offer:{}", self.id))
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn ByteChannel>> {
        let (near, far) = MemoryChannel::pair(label);
        match self.remote_link() {
            Some(remote) => {
                let _ = remote.incoming_tx.send(far);
            }
            None => self.pending_channels.lock().unwrap().push(far),
        }
        Ok(near)
    }

    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn ByteChannel>>> {
        self.incoming_rx.lock().unwrap().take()
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn path_type(&self) -> PathType {
        PathType::Direct
    }

    async fn close(&self) {
        let _ = self.state.send(LinkState::Closed);
    }
}

// ── Signaling ────────────────────────────────────────────────────────────────

/// Records every envelope handed to it; delivers nothing.
pub struct RecordingSignaling {
    sent: Mutex<Vec<(PeerId, SignalingMessage)>>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(PeerId, SignalingMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for RecordingSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for RecordingSignaling {
    async fn send(&self, to: &PeerId, message: SignalingMessage) -> Result<()> {
        self.sent.lock().unwrap().push((to.clone(), message));
        Ok(())
    }
}

/// Routes signaling envelopes between endpoints in one process, standing
/// in for a relay server.
pub struct SignalingHub {
    routes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<(PeerId, SignalingMessage)>>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Register `id` and get its transport handle plus the stream of
    /// envelopes addressed to it, tagged with the sender's id.
    pub fn endpoint(
        self: &Arc<Self>,
        id: &PeerId,
    ) -> (
        Arc<dyn SignalingTransport>,
        mpsc::UnboundedReceiver<(PeerId, SignalingMessage)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(id.clone(), tx);
        let transport = Arc::new(HubEndpoint {
            id: id.clone(),
            hub: self.clone(),
        });
        (transport, rx)
    }
}

struct HubEndpoint {
    id: PeerId,
    hub: Arc<SignalingHub>,
}

#[async_trait]
impl SignalingTransport for HubEndpoint {
    async fn send(&self, to: &PeerId, message: SignalingMessage) -> Result<()> {
        let route = self.hub.routes.lock().unwrap().get(to).cloned();
        let Some(route) = route else {
            return Err(Error::UnknownPeer { peer: to.clone() });
        };
        route
            .send((self.id.clone(), message))
            .map_err(|_| Error::UnknownPeer { peer: to.clone() })
    }
}
