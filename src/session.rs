//! Session coordinator: the engine's single entry point.
//!
//! Owns the outbound mesh session state machine, per-peer inbound
//! transfers, the channel registry, and the dispatch of control frames.
//! Callers construct it with four injected capabilities (signaling, peer
//! transport, resume store, sink factory) and receive every observable
//! state change on one unbounded event channel.
//!
//! Outbound lifecycle: `send_files` invites a set of peers and records a
//! pending session. Each `accept` moves a peer into the ready set; each
//! `decline` or connection failure shrinks the invited set. The mesh
//! starts streaming exactly once, the moment the ready set equals the
//! (non-empty) invited set, and the pending session is consumed at that
//! point. A pending session whose invited set empties out is discarded
//! without ever starting.

use crate::config::{
    BACKPRESSURE_POLL_INTERVAL, BACKPRESSURE_TIMEOUT, CHANNEL_LABEL, CHUNK_SIZE, CONSENT_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::event::{emit, ConsentReply, EventTx, TransferEvent};
use crate::manifest::{FileDescriptor, TransferManifest};
use crate::negotiator::{Negotiator, NegotiatorEvent};
use crate::pipeline::receiver::InboundTransfer;
use crate::pipeline::reader::ChunkProducer;
use crate::pipeline::sender::{EvictReason, MeshChannel, MeshOutcome, MeshSender, OutboundFile};
use crate::pipeline::sink::SinkFactory;
use crate::protocol::{self, ControlMessage, Frame, SignalingMessage};
use crate::registry::ChannelRegistry;
use crate::resume::ResumeStore;
use crate::transport::{ByteChannel, PathType, PeerTransport, SignalingTransport};
use crate::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Session state ────────────────────────────────────────────────────────────

struct PendingSession {
    id: Uuid,
    files: Vec<OutboundFile>,
    invited: HashSet<PeerId>,
    ready: HashSet<PeerId>,
}

struct RunningSession {
    id: Uuid,
    cancel: watch::Sender<bool>,
    /// Peers the coordinator resolved mid-stream; the mesh sender removes
    /// them between chunks and emits their terminal event.
    evict: mpsc::UnboundedSender<(PeerId, EvictReason)>,
}

enum OutboundState {
    Idle,
    Pending(PendingSession),
    Running(RunningSession),
}

enum InboundState {
    /// Metadata declared; consent prompt outstanding.
    AwaitingConsent,
    Receiving(InboundTransfer),
}

struct Inner {
    negotiator: Negotiator,
    registry: ChannelRegistry,
    store: Arc<dyn ResumeStore>,
    sinks: Arc<dyn SinkFactory>,
    events: EventTx,
    outbound: Mutex<OutboundState>,
    inbound: Mutex<HashMap<PeerId, InboundState>>,
}

// ── Coordinator ──────────────────────────────────────────────────────────────

/// Drives transfer sessions over injected transport capabilities.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Build a coordinator and the event stream it reports on.
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn ResumeStore>,
        sinks: Arc<dyn SinkFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (neg_tx, neg_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            negotiator: Negotiator::new(transport, signaling, neg_tx),
            registry: ChannelRegistry::new(),
            store,
            sinks,
            events,
            outbound: Mutex::new(OutboundState::Idle),
            inbound: Mutex::new(HashMap::new()),
        });
        tokio::spawn(negotiator_loop(inner.clone(), neg_rx));
        (Self { inner }, events_rx)
    }

    /// Offer `files` to every peer in `peers` as one mesh session.
    ///
    /// Connections are negotiated and metadata declared concurrently per
    /// peer; streaming starts only once every still-invited peer has
    /// accepted. At most one outbound session runs at a time.
    pub async fn send_files(&self, peers: Vec<PeerId>, files: Vec<OutboundFile>) -> Result<Uuid> {
        if peers.is_empty() || files.is_empty() {
            return Err(Error::Protocol("session needs peers and files".into()));
        }
        let id = Uuid::new_v4();
        {
            let mut state = self.inner.outbound.lock().await;
            if !matches!(*state, OutboundState::Idle) {
                return Err(Error::Busy);
            }
            *state = OutboundState::Pending(PendingSession {
                id,
                files: files.clone(),
                invited: peers.iter().cloned().collect(),
                ready: HashSet::new(),
            });
        }
        info!(
            event = "session_created",
            session = %id,
            peers = peers.len(),
            files = files.len(),
        );

        let descriptors: Vec<FileDescriptor> =
            files.iter().map(|f| f.descriptor.clone()).collect();
        for peer in peers {
            tokio::spawn(setup_peer(self.inner.clone(), peer, descriptors.clone()));
        }
        Ok(id)
    }

    /// Route an inbound signaling envelope to the negotiator.
    pub async fn handle_signaling(&self, from: &PeerId, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Offer { sdp } => self.inner.negotiator.handle_offer(from, &sdp).await,
            SignalingMessage::Answer { sdp } => {
                self.inner.negotiator.handle_answer(from, &sdp).await
            }
            SignalingMessage::IceCandidate { candidate } => {
                self.inner.negotiator.handle_candidate(from, &candidate).await
            }
        }
    }

    /// Cancel the outbound session, pending or running.
    ///
    /// A running mesh stops cooperatively: the sender observes the request
    /// between chunks, so at most one chunk completes in flight.
    pub async fn cancel_transfer(&self) {
        let inner = &self.inner;
        let mut state = inner.outbound.lock().await;
        if let OutboundState::Running(r) = &*state {
            info!(event = "session_cancel_requested", session = %r.id);
            let _ = r.cancel.send(true);
            return;
        }
        if let OutboundState::Pending(p) = std::mem::replace(&mut *state, OutboundState::Idle) {
            drop(state);
            info!(event = "session_cancelled", session = %p.id);
            for peer in p.invited {
                let _ = send_control(inner, &peer, &ControlMessage::Cancel).await;
                emit(&inner.events, TransferEvent::Cancelled { peer: peer.clone() });
                teardown_peer(inner, &peer).await;
            }
        }
    }

    /// Cancel an inbound transfer from `peer`, keeping its last resume
    /// checkpoint so a later transfer of the same files can pick up.
    pub async fn cancel_inbound(&self, peer: &PeerId) {
        let inner = &self.inner;
        let removed = {
            let mut inbound = inner.inbound.lock().await;
            match inbound.remove(peer) {
                Some(InboundState::Receiving(mut transfer)) => {
                    transfer.abort().await;
                    true
                }
                Some(InboundState::AwaitingConsent) => true,
                None => false,
            }
        };
        if removed {
            let _ = send_control(inner, peer, &ControlMessage::Cancel).await;
            emit(&inner.events, TransferEvent::Cancelled { peer: peer.clone() });
            teardown_peer(inner, peer).await;
        }
    }

    /// Deliver a short text snippet over an established channel.
    pub async fn send_text(&self, peer: &PeerId, body: impl Into<String>) -> Result<()> {
        send_control(&self.inner, peer, &ControlMessage::Text { body: body.into() }).await
    }

    /// Ask `peer` how many bytes it has persisted for `file_id`. The
    /// answer arrives as [`TransferEvent::ResumeOffset`].
    pub async fn query_resume(&self, peer: &PeerId, file_id: &str) -> Result<()> {
        send_control(
            &self.inner,
            peer,
            &ControlMessage::ResumeQuery {
                file_id: file_id.into(),
            },
        )
        .await
    }

    /// Locally persisted resume offset for `file_id`, 0 when absent.
    pub async fn resume_offset(&self, file_id: &str) -> Result<u64> {
        Ok(self
            .inner
            .store
            .get(file_id)
            .await?
            .map(|r| r.received_size)
            .unwrap_or(0))
    }

    /// Path classification of the connection to `peer`.
    pub async fn path_type(&self, peer: &PeerId) -> PathType {
        self.inner.negotiator.path_type(peer).await
    }
}

// ── Outbound setup ───────────────────────────────────────────────────────────

async fn setup_peer(inner: Arc<Inner>, peer: PeerId, files: Vec<FileDescriptor>) {
    if let Err(e) = try_setup_peer(&inner, &peer, files).await {
        warn!(event = "peer_setup_failure", peer = %peer, error = %e);
        emit(
            &inner.events,
            TransferEvent::Failed {
                peer: peer.clone(),
                error: e,
            },
        );
        drop_invitee(&inner, &peer).await;
        teardown_peer(&inner, &peer).await;
    }
}

async fn try_setup_peer(inner: &Arc<Inner>, peer: &PeerId, files: Vec<FileDescriptor>) -> Result<()> {
    let link = inner.negotiator.open(peer).await?;
    // The channel must exist before the offer so it rides the session
    // description.
    let channel = link.open_channel(CHANNEL_LABEL).await?;
    inner.negotiator.send_offer(peer).await?;
    channel.ready().await?;
    inner.registry.register(peer, channel.clone()).await;
    spawn_read_loop(inner.clone(), peer.clone(), channel.clone());
    channel
        .send(protocol::encode_control(&ControlMessage::Metadata { files })?)
        .await?;
    debug!(event = "metadata_declared", peer = %peer);
    Ok(())
}

/// Remove a peer from the pending invited set, discarding the session if
/// it empties and starting it if the remaining invitees are all ready.
async fn drop_invitee(inner: &Arc<Inner>, peer: &PeerId) {
    let mut state = inner.outbound.lock().await;
    let mut removed = false;
    let mut emptied = false;
    if let OutboundState::Pending(p) = &mut *state {
        removed = p.invited.remove(peer);
        p.ready.remove(peer);
        emptied = p.invited.is_empty();
    }
    if removed {
        if emptied {
            info!(event = "session_discarded");
            *state = OutboundState::Idle;
        } else {
            maybe_start(inner, &mut state).await;
        }
    }
}

/// Start the mesh if every still-invited peer is ready. Called with the
/// outbound lock held; consumes the pending session on start.
async fn maybe_start(inner: &Arc<Inner>, state: &mut OutboundState) {
    {
        let OutboundState::Pending(p) = &*state else { return };
        if p.invited.is_empty() || p.ready != p.invited {
            return;
        }
    }
    let OutboundState::Pending(p) = std::mem::replace(state, OutboundState::Idle) else {
        return;
    };

    let mut channels = Vec::new();
    for peer in &p.invited {
        match inner.registry.get(peer).await {
            Some(channel) => channels.push(MeshChannel {
                peer: peer.clone(),
                channel,
            }),
            None => {
                warn!(event = "ready_peer_without_channel", peer = %peer);
                emit(
                    &inner.events,
                    TransferEvent::Failed {
                        peer: peer.clone(),
                        error: Error::UnknownPeer { peer: peer.clone() },
                    },
                );
            }
        }
    }
    if channels.is_empty() {
        return;
    }

    let peers: Vec<PeerId> = channels.iter().map(|c| c.peer.clone()).collect();
    let total_size: u64 = p.files.iter().map(|f| f.descriptor.size).sum();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (evict_tx, evict_rx) = mpsc::unbounded_channel();
    *state = OutboundState::Running(RunningSession {
        id: p.id,
        cancel: cancel_tx,
        evict: evict_tx,
    });

    info!(
        event = "mesh_session_started",
        session = %p.id,
        peers = peers.len(),
        total_size,
    );
    emit(
        &inner.events,
        TransferEvent::TransferStarted {
            session_id: p.id,
            peers: peers.clone(),
            total_size,
        },
    );

    let sender = MeshSender::new(
        channels,
        ChunkProducer::new(CHUNK_SIZE),
        cancel_rx,
        evict_rx,
        inner.events.clone(),
    );
    tokio::spawn(supervise_mesh(inner.clone(), peers, sender, p.files));
}

/// Await the mesh outcome, resolve the remaining peers, and release the
/// session slot.
async fn supervise_mesh(
    inner: Arc<Inner>,
    peers: Vec<PeerId>,
    sender: MeshSender,
    files: Vec<OutboundFile>,
) {
    match sender.run(files).await {
        MeshOutcome::Completed { survivors } => {
            for peer in &survivors {
                drain_channel(&inner, peer).await;
            }
        }
        MeshOutcome::Cancelled { remaining } => {
            for peer in &remaining {
                let _ = send_control(&inner, peer, &ControlMessage::Cancel).await;
                emit(&inner.events, TransferEvent::Cancelled { peer: peer.clone() });
            }
        }
        MeshOutcome::AllDropped | MeshOutcome::ReadFailed => {}
    }
    for peer in &peers {
        teardown_peer(&inner, peer).await;
    }
    *inner.outbound.lock().await = OutboundState::Idle;
    info!(event = "session_closed");
}

/// Give a completed channel a bounded window to flush queued frames
/// before teardown.
async fn drain_channel(inner: &Arc<Inner>, peer: &PeerId) {
    let Some(channel) = inner.registry.get(peer).await else {
        return;
    };
    let deadline = Instant::now() + BACKPRESSURE_TIMEOUT;
    while channel.is_open() && channel.buffered_amount().await > 0 && Instant::now() < deadline {
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }
}

async fn teardown_peer(inner: &Arc<Inner>, peer: &PeerId) {
    inner.registry.close(peer).await;
    inner.negotiator.close(peer).await;
}

async fn send_control(inner: &Inner, peer: &PeerId, msg: &ControlMessage) -> Result<()> {
    let channel = inner
        .registry
        .get(peer)
        .await
        .ok_or_else(|| Error::UnknownPeer { peer: peer.clone() })?;
    channel.send(protocol::encode_control(msg)?).await
}

// ── Inbound dispatch ─────────────────────────────────────────────────────────

fn spawn_read_loop(inner: Arc<Inner>, peer: PeerId, channel: Arc<dyn ByteChannel>) {
    let Some(mut rx) = channel.take_incoming() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match protocol::decode_frame(&frame) {
                Ok(Frame::Control(msg)) => handle_control(&inner, &peer, msg).await,
                Ok(Frame::Chunk(bytes)) => handle_chunk(&inner, &peer, bytes).await,
                Err(e) => {
                    warn!(event = "frame_decode_failure", peer = %peer, error = %e);
                }
            }
        }
        debug!(event = "channel_reader_stopped", peer = %peer);
    });
}

async fn handle_control(inner: &Arc<Inner>, peer: &PeerId, msg: ControlMessage) {
    match msg {
        ControlMessage::Metadata { files } => handle_metadata(inner, peer, files).await,
        ControlMessage::Accept => {
            let mut state = inner.outbound.lock().await;
            let mut accepted = false;
            if let OutboundState::Pending(p) = &mut *state {
                if p.invited.contains(peer) {
                    accepted = p.ready.insert(peer.clone());
                }
            }
            if accepted {
                info!(event = "peer_accepted", peer = %peer);
                maybe_start(inner, &mut state).await;
            } else {
                debug!(event = "stray_accept", peer = %peer);
            }
        }
        ControlMessage::Decline => {
            let declined = {
                let state = inner.outbound.lock().await;
                matches!(&*state, OutboundState::Pending(p) if p.invited.contains(peer))
            };
            if declined {
                info!(event = "peer_declined", peer = %peer);
                emit(&inner.events, TransferEvent::Declined { peer: peer.clone() });
                drop_invitee(inner, peer).await;
                teardown_peer(inner, peer).await;
            } else {
                debug!(event = "stray_decline", peer = %peer);
            }
        }
        ControlMessage::Cancel => handle_remote_cancel(inner, peer).await,
        ControlMessage::FileComplete { file_id, .. } => {
            handle_file_complete(inner, peer, &file_id).await;
        }
        ControlMessage::ResumeQuery { file_id } => {
            let offset = match inner.store.get(&file_id).await {
                Ok(record) => record.map(|r| r.received_size).unwrap_or(0),
                Err(e) => {
                    warn!(event = "resume_lookup_failure", file_id = %file_id, error = %e);
                    0
                }
            };
            if let Err(e) =
                send_control(inner, peer, &ControlMessage::ResumeResponse { file_id, offset }).await
            {
                warn!(event = "resume_reply_failure", peer = %peer, error = %e);
            }
        }
        ControlMessage::ResumeResponse { file_id, offset } => {
            emit(
                &inner.events,
                TransferEvent::ResumeOffset {
                    peer: peer.clone(),
                    file_id,
                    offset,
                },
            );
        }
        ControlMessage::Text { body } => {
            emit(
                &inner.events,
                TransferEvent::TextReceived {
                    peer: peer.clone(),
                    body,
                },
            );
        }
    }
}

/// A peer declared a transfer: surface the consent prompt and resolve it
/// on answer, or as an implicit decline when the window expires.
async fn handle_metadata(inner: &Arc<Inner>, peer: &PeerId, files: Vec<FileDescriptor>) {
    {
        let mut inbound = inner.inbound.lock().await;
        if inbound.contains_key(peer) {
            warn!(event = "duplicate_metadata", peer = %peer);
            return;
        }
        inbound.insert(peer.clone(), InboundState::AwaitingConsent);
    }
    info!(
        event = "transfer_declared",
        peer = %peer,
        files = files.len(),
        total_size = files.iter().map(|f| f.size).sum::<u64>(),
    );

    let (tx, rx) = oneshot::channel();
    emit(
        &inner.events,
        TransferEvent::ConsentRequest {
            peer: peer.clone(),
            files: files.clone(),
            reply: ConsentReply::new(tx),
        },
    );

    let inner = inner.clone();
    let peer = peer.clone();
    tokio::spawn(async move {
        let accepted = matches!(
            tokio::time::timeout(CONSENT_TIMEOUT, rx).await,
            Ok(Ok(true))
        );
        resolve_consent(inner, peer, files, accepted).await;
    });
}

async fn resolve_consent(inner: Arc<Inner>, peer: PeerId, files: Vec<FileDescriptor>, accepted: bool) {
    // The declaration may have been withdrawn while the prompt was open.
    let still_pending = {
        let inbound = inner.inbound.lock().await;
        matches!(inbound.get(&peer), Some(InboundState::AwaitingConsent))
    };
    if !still_pending {
        debug!(event = "consent_obsolete", peer = %peer);
        return;
    }

    if accepted {
        {
            let mut inbound = inner.inbound.lock().await;
            inbound.insert(
                peer.clone(),
                InboundState::Receiving(InboundTransfer::new(
                    peer.clone(),
                    TransferManifest { files },
                    inner.sinks.clone(),
                    inner.store.clone(),
                    inner.events.clone(),
                )),
            );
        }
        if let Err(e) = send_control(&inner, &peer, &ControlMessage::Accept).await {
            warn!(event = "accept_send_failure", peer = %peer, error = %e);
            inner.inbound.lock().await.remove(&peer);
            emit(
                &inner.events,
                TransferEvent::Failed {
                    peer: peer.clone(),
                    error: e,
                },
            );
            teardown_peer(&inner, &peer).await;
        } else {
            info!(event = "transfer_accepted", peer = %peer);
        }
    } else {
        info!(event = "transfer_declined_locally", peer = %peer);
        let _ = send_control(&inner, &peer, &ControlMessage::Decline).await;
        inner.inbound.lock().await.remove(&peer);
        emit(&inner.events, TransferEvent::Declined { peer: peer.clone() });
        teardown_peer(&inner, &peer).await;
    }
}

async fn handle_chunk(inner: &Arc<Inner>, peer: &PeerId, bytes: bytes::Bytes) {
    let failure = {
        let mut inbound = inner.inbound.lock().await;
        match inbound.get_mut(peer) {
            Some(InboundState::Receiving(transfer)) => match transfer.accept_chunk(bytes).await {
                Ok(()) => None,
                Err(e) => {
                    if let Some(InboundState::Receiving(mut t)) = inbound.remove(peer) {
                        t.abort().await;
                    }
                    Some(e)
                }
            },
            _ => {
                warn!(event = "chunk_without_transfer", peer = %peer, len = bytes.len());
                None
            }
        }
    };
    if let Some(e) = failure {
        emit(
            &inner.events,
            TransferEvent::Failed {
                peer: peer.clone(),
                error: e,
            },
        );
        teardown_peer(inner, peer).await;
    }
}

async fn handle_file_complete(inner: &Arc<Inner>, peer: &PeerId, file_id: &str) {
    let outcome = {
        let mut inbound = inner.inbound.lock().await;
        match inbound.get_mut(peer) {
            Some(InboundState::Receiving(transfer)) => {
                match transfer.complete_file(file_id).await {
                    Ok(()) => {
                        if transfer.is_complete() {
                            inbound.remove(peer);
                            Some(Ok(()))
                        } else {
                            None
                        }
                    }
                    Err(e) => {
                        if let Some(InboundState::Receiving(mut t)) = inbound.remove(peer) {
                            t.abort().await;
                        }
                        Some(Err(e))
                    }
                }
            }
            _ => {
                warn!(event = "stray_file_complete", peer = %peer, file_id = %file_id);
                None
            }
        }
    };
    match outcome {
        Some(Ok(())) => teardown_peer(inner, peer).await,
        Some(Err(e)) => {
            emit(
                &inner.events,
                TransferEvent::Failed {
                    peer: peer.clone(),
                    error: e,
                },
            );
            teardown_peer(inner, peer).await;
        }
        None => {}
    }
}

/// The remote side withdrew: resolve whichever role this peer held.
async fn handle_remote_cancel(inner: &Arc<Inner>, peer: &PeerId) {
    let mut handled = {
        let mut inbound = inner.inbound.lock().await;
        match inbound.remove(peer) {
            Some(InboundState::Receiving(mut transfer)) => {
                transfer.abort().await;
                true
            }
            Some(InboundState::AwaitingConsent) => true,
            None => false,
        }
    };
    let mut evicted = false;
    {
        let mut state = inner.outbound.lock().await;
        let mut pending = false;
        if let OutboundState::Pending(p) = &mut *state {
            pending = p.invited.remove(peer);
            p.ready.remove(peer);
        }
        if pending {
            handled = true;
            let emptied = matches!(&*state, OutboundState::Pending(p) if p.invited.is_empty());
            if emptied {
                info!(event = "session_discarded");
                *state = OutboundState::Idle;
            } else {
                maybe_start(inner, &mut state).await;
            }
        } else if let OutboundState::Running(r) = &*state {
            // The mesh sender removes the peer and emits its terminal
            // event; the supervisor closes the channel at session end.
            let _ = r.evict.send((peer.clone(), EvictReason::Cancelled));
            evicted = true;
        }
    }
    if handled {
        info!(event = "peer_cancelled", peer = %peer);
        emit(&inner.events, TransferEvent::Cancelled { peer: peer.clone() });
        teardown_peer(inner, peer).await;
    } else if evicted {
        info!(event = "peer_cancelled", peer = %peer);
    } else {
        debug!(event = "stray_cancel", peer = %peer);
    }
}

// ── Negotiator events ────────────────────────────────────────────────────────

async fn negotiator_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<NegotiatorEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            NegotiatorEvent::ChannelOpened { peer, channel } => {
                // One peer's slow channel-open handshake must not stall
                // other peers' events behind it.
                tokio::spawn(register_inbound_channel(inner.clone(), peer, channel));
            }
            NegotiatorEvent::ConnectionFailed { peer } => {
                handle_connection_failure(&inner, &peer).await;
            }
        }
    }
}

/// Wait out the channel-open handshake, then wire the channel into the
/// registry and start its read loop.
async fn register_inbound_channel(inner: Arc<Inner>, peer: PeerId, channel: Arc<dyn ByteChannel>) {
    if let Err(e) = channel.ready().await {
        warn!(event = "inbound_channel_not_ready", peer = %peer, error = %e);
        return;
    }
    debug!(event = "inbound_channel_registered", peer = %peer);
    inner.registry.register(&peer, channel.clone()).await;
    spawn_read_loop(inner, peer, channel);
}

/// A link died after its one automatic restart: fail every transfer the
/// peer participates in, leaving inbound resume checkpoints behind.
async fn handle_connection_failure(inner: &Arc<Inner>, peer: &PeerId) {
    warn!(event = "peer_connection_failed", peer = %peer);
    let mut terminal = {
        let mut inbound = inner.inbound.lock().await;
        match inbound.remove(peer) {
            Some(InboundState::Receiving(mut transfer)) => {
                transfer.abort().await;
                true
            }
            Some(InboundState::AwaitingConsent) => true,
            None => false,
        }
    };
    {
        let mut state = inner.outbound.lock().await;
        let mut removed = false;
        let mut emptied = false;
        if let OutboundState::Pending(p) = &mut *state {
            removed = p.invited.remove(peer);
            p.ready.remove(peer);
            emptied = p.invited.is_empty();
        }
        if removed {
            terminal = true;
            if emptied {
                info!(event = "session_discarded");
                *state = OutboundState::Idle;
            } else {
                maybe_start(inner, &mut state).await;
            }
        } else if let OutboundState::Running(r) = &*state {
            let _ = r.evict.send((
                peer.clone(),
                EvictReason::Failed(Error::Negotiation {
                    peer: peer.clone(),
                    reason: "connection failed after restart".into(),
                }),
            ));
        }
    }
    if terminal {
        emit(
            &inner.events,
            TransferEvent::Failed {
                peer: peer.clone(),
                error: Error::Negotiation {
                    peer: peer.clone(),
                    reason: "connection failed after restart".into(),
                },
            },
        );
    }
    teardown_peer(inner, peer).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::MemorySinkFactory;
    use crate::resume::MemoryResumeStore;
    use crate::testing::{MemoryChannel, MemoryFabric, RecordingSignaling};
    use std::path::PathBuf;

    fn coordinator() -> (SessionCoordinator, mpsc::UnboundedReceiver<TransferEvent>) {
        let fabric = MemoryFabric::new();
        SessionCoordinator::new(
            Arc::new(RecordingSignaling::new()),
            fabric.transport(),
            Arc::new(MemoryResumeStore::new()),
            Arc::new(MemorySinkFactory::new()),
        )
    }

    fn dummy_file(name: &str, size: u64) -> OutboundFile {
        OutboundFile {
            descriptor: FileDescriptor {
                name: name.into(),
                size,
                mime: "application/octet-stream".into(),
                path: None,
            },
            source: PathBuf::from("/nonexistent"),
        }
    }

    #[tokio::test]
    async fn second_session_while_one_is_pending_is_busy() {
        let (coordinator, _events) = coordinator();
        coordinator
            .send_files(vec!["p1".into()], vec![dummy_file("a.txt", 10)])
            .await
            .unwrap();
        let err = coordinator
            .send_files(vec!["p2".into()], vec![dummy_file("b.txt", 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy));
    }

    #[tokio::test]
    async fn empty_session_is_rejected() {
        let (coordinator, _events) = coordinator();
        assert!(coordinator
            .send_files(vec![], vec![dummy_file("a.txt", 10)])
            .await
            .is_err());
        assert!(coordinator
            .send_files(vec!["p1".into()], vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn resume_offset_reads_the_local_store() {
        let store = Arc::new(MemoryResumeStore::new());
        store.put("big.bin-1000", 640).await.unwrap();
        let fabric = MemoryFabric::new();
        let (coordinator, _events) = SessionCoordinator::new(
            Arc::new(RecordingSignaling::new()),
            fabric.transport(),
            store,
            Arc::new(MemorySinkFactory::new()),
        );
        assert_eq!(coordinator.resume_offset("big.bin-1000").await.unwrap(), 640);
        assert_eq!(coordinator.resume_offset("absent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stalled_inbound_channel_does_not_block_other_registrations() {
        let fabric = MemoryFabric::new();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (neg_tx, neg_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            negotiator: Negotiator::new(
                fabric.transport(),
                Arc::new(RecordingSignaling::new()),
                neg_tx.clone(),
            ),
            registry: ChannelRegistry::new(),
            store: Arc::new(MemoryResumeStore::new()),
            sinks: Arc::new(MemorySinkFactory::new()),
            events,
            outbound: Mutex::new(OutboundState::Idle),
            inbound: Mutex::new(HashMap::new()),
        });
        tokio::spawn(negotiator_loop(inner.clone(), neg_rx));

        let (slow, _slow_far) = MemoryChannel::pair(CHANNEL_LABEL);
        slow.defer_ready();
        let (fast, _fast_far) = MemoryChannel::pair(CHANNEL_LABEL);
        neg_tx
            .send(NegotiatorEvent::ChannelOpened {
                peer: "slow".into(),
                channel: slow,
            })
            .unwrap();
        neg_tx
            .send(NegotiatorEvent::ChannelOpened {
                peer: "fast".into(),
                channel: fast,
            })
            .unwrap();

        // The later channel registers even though the earlier one never
        // finishes opening.
        let fast_id: PeerId = "fast".into();
        for _ in 0..100 {
            if inner.registry.get(&fast_id).await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(inner.registry.get(&fast_id).await.is_some());
        assert!(inner.registry.get(&"slow".into()).await.is_none());
    }

    #[tokio::test]
    async fn text_to_unknown_peer_fails() {
        let (coordinator, _events) = coordinator();
        let err = coordinator.send_text(&"ghost".into(), "hi").await.unwrap_err();
        assert!(matches!(err, Error::UnknownPeer { .. }));
    }
}
