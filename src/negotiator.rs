//! Connection negotiator: one negotiated link per peer id.
//!
//! Drives the offer/answer/candidate state machine over the signaling
//! transport, including renegotiation (an inbound offer for a known peer
//! reuses its link) and restart-on-failure. Connectivity candidates that
//! arrive before the remote description is set are buffered per peer and
//! flushed in arrival order once it is.
//!
//! Failure policy: when connectivity drops to failed/disconnected, the
//! negotiator waits a short debounce window and, if the link has not
//! recovered, performs exactly one automatic restart. A second consecutive
//! failure is surfaced to the coordinator as fatal for that peer.

use crate::config::RESTART_DEBOUNCE;
use crate::error::{Error, Result};
use crate::protocol::SignalingMessage;
use crate::transport::{
    ByteChannel, LinkState, NegotiationState, PathType, PeerLink, PeerTransport,
    SignalingTransport,
};
use crate::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events the negotiator reports to the session coordinator.
pub enum NegotiatorEvent {
    /// The remote side opened a byte channel on this peer's link.
    ChannelOpened {
        peer: PeerId,
        channel: Arc<dyn ByteChannel>,
    },
    /// The link failed after its one automatic restart.
    ConnectionFailed { peer: PeerId },
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    /// Candidates received before the remote description was set.
    pending_candidates: Vec<String>,
    /// Sampled once connectivity establishes; reset by `close`.
    path: Arc<std::sync::Mutex<PathType>>,
    monitor: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

pub struct Negotiator {
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingTransport>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl Negotiator {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingTransport>,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        Self {
            transport,
            signaling,
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Return the peer's link, creating (and monitoring) one if absent.
    pub async fn open(&self, peer: &PeerId) -> Result<Arc<dyn PeerLink>> {
        let mut peers = self.peers.lock().await;
        if let Some(entry) = peers.get(peer) {
            return Ok(entry.link.clone());
        }

        let link = self.transport.new_link().await?;
        let path = Arc::new(std::sync::Mutex::new(PathType::Unknown));

        let monitor = tokio::spawn(monitor_link(
            peer.clone(),
            link.clone(),
            self.signaling.clone(),
            self.events.clone(),
            path.clone(),
        ));
        let forwarder = tokio::spawn(forward_channels(
            peer.clone(),
            link.clone(),
            self.events.clone(),
        ));

        debug!(event = "link_created", peer = %peer);
        peers.insert(
            peer.clone(),
            PeerEntry {
                link: link.clone(),
                pending_candidates: Vec::new(),
                path,
                monitor,
                forwarder,
            },
        );
        Ok(link)
    }

    /// Create and send an offer for the peer's link.
    pub async fn send_offer(&self, peer: &PeerId) -> Result<()> {
        let link = self.open(peer).await?;
        let sdp = link.create_offer().await?;
        self.signaling
            .send(peer, SignalingMessage::Offer { sdp })
            .await
    }

    /// Handle an inbound setup offer: reuse the peer's link when present
    /// (renegotiation), answer over signaling either way.
    pub async fn handle_offer(&self, from: &PeerId, sdp: &str) -> Result<()> {
        let link = self.open(from).await?;
        let answer = link.apply_offer(sdp).await.map_err(|e| Error::Negotiation {
            peer: from.clone(),
            reason: e.to_string(),
        })?;
        self.flush_candidates(from).await;
        self.signaling
            .send(from, SignalingMessage::Answer { sdp: answer })
            .await
    }

    /// Handle an inbound answer. Applied only while a local offer is
    /// outstanding; anything else is logged and dropped.
    pub async fn handle_answer(&self, from: &PeerId, sdp: &str) -> Result<()> {
        let link = {
            let peers = self.peers.lock().await;
            match peers.get(from) {
                Some(entry) => entry.link.clone(),
                None => {
                    warn!(event = "answer_without_link", peer = %from, "Dropping answer for unknown peer");
                    return Ok(());
                }
            }
        };

        if link.negotiation_state() != NegotiationState::HaveLocalOffer {
            warn!(
                event = "unexpected_answer",
                peer = %from,
                state = ?link.negotiation_state(),
                "Dropping answer: no local offer outstanding"
            );
            return Ok(());
        }

        link.apply_answer(sdp).await.map_err(|e| Error::Negotiation {
            peer: from.clone(),
            reason: e.to_string(),
        })?;
        self.flush_candidates(from).await;
        Ok(())
    }

    /// Handle an inbound connectivity candidate, buffering it when the
    /// remote description is not yet set.
    pub async fn handle_candidate(&self, from: &PeerId, candidate: &str) -> Result<()> {
        let link = self.open(from).await?;
        if link.has_remote_description().await {
            if let Err(e) = link.add_candidate(candidate).await {
                warn!(event = "candidate_rejected", peer = %from, error = %e, "Transport rejected candidate");
            }
        } else {
            let mut peers = self.peers.lock().await;
            if let Some(entry) = peers.get_mut(from) {
                entry.pending_candidates.push(candidate.to_string());
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self, peer: &PeerId) {
        let buffered = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(peer) {
                Some(entry) => std::mem::take(&mut entry.pending_candidates),
                None => return,
            }
        };
        if buffered.is_empty() {
            return;
        }

        let link = {
            let peers = self.peers.lock().await;
            match peers.get(peer) {
                Some(entry) => entry.link.clone(),
                None => return,
            }
        };
        debug!(event = "candidates_flushed", peer = %peer, count = buffered.len());
        for candidate in buffered {
            if let Err(e) = link.add_candidate(&candidate).await {
                warn!(event = "candidate_rejected", peer = %peer, error = %e, "Transport rejected buffered candidate");
            }
        }
    }

    /// Force a fresh negotiation cycle without destroying the logical
    /// session.
    pub async fn restart(&self, peer: &PeerId) -> Result<()> {
        let link = {
            let peers = self.peers.lock().await;
            peers
                .get(peer)
                .map(|e| e.link.clone())
                .ok_or_else(|| Error::UnknownPeer { peer: peer.clone() })?
        };
        let sdp = link.restart_offer().await?;
        self.signaling
            .send(peer, SignalingMessage::Offer { sdp })
            .await
    }

    /// Tear the peer's link down and forget its detected path type.
    pub async fn close(&self, peer: &PeerId) {
        let entry = self.peers.lock().await.remove(peer);
        if let Some(entry) = entry {
            entry.monitor.abort();
            entry.forwarder.abort();
            entry.link.close().await;
            info!(event = "link_closed", peer = %peer);
        }
    }

    /// Cached path classification for the peer, `Unknown` if never sampled.
    pub async fn path_type(&self, peer: &PeerId) -> PathType {
        let peers = self.peers.lock().await;
        peers
            .get(peer)
            .and_then(|e| e.path.lock().ok().map(|p| *p))
            .unwrap_or(PathType::Unknown)
    }

    pub async fn has_link(&self, peer: &PeerId) -> bool {
        self.peers.lock().await.contains_key(peer)
    }
}

/// Forward channels opened by the remote side to the coordinator.
async fn forward_channels(
    peer: PeerId,
    link: Arc<dyn PeerLink>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
) {
    let Some(mut rx) = link.take_incoming_channels() else {
        return;
    };
    while let Some(channel) = rx.recv().await {
        if events
            .send(NegotiatorEvent::ChannelOpened {
                peer: peer.clone(),
                channel,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Watch connectivity, sample the path type once, and run the bounded
/// restart policy.
async fn monitor_link(
    peer: PeerId,
    link: Arc<dyn PeerLink>,
    signaling: Arc<dyn SignalingTransport>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    path: Arc<std::sync::Mutex<PathType>>,
) {
    let mut rx = link.link_state();
    let mut restarted = false;

    loop {
        let state = *rx.borrow_and_update();
        match state {
            LinkState::Connected => {
                restarted = false;
                let sampled = {
                    let current = path.lock().map(|p| *p).unwrap_or(PathType::Unknown);
                    current == PathType::Unknown
                };
                if sampled {
                    let detected = link.path_type().await;
                    if let Ok(mut p) = path.lock() {
                        *p = detected;
                    }
                    info!(event = "path_detected", peer = %peer, path = ?detected);
                }
            }
            LinkState::Failed | LinkState::Disconnected => {
                tokio::time::sleep(RESTART_DEBOUNCE).await;
                let current = *rx.borrow();
                if matches!(current, LinkState::Failed | LinkState::Disconnected) {
                    if restarted {
                        warn!(event = "link_gave_up", peer = %peer, "Connectivity lost after restart");
                        let _ = events.send(NegotiatorEvent::ConnectionFailed { peer: peer.clone() });
                        return;
                    }
                    restarted = true;
                    warn!(event = "link_restarting", peer = %peer, "Connectivity lost, attempting restart");
                    match link.restart_offer().await {
                        Ok(sdp) => {
                            let _ = signaling
                                .send(&peer, SignalingMessage::Offer { sdp })
                                .await;
                        }
                        Err(e) => {
                            warn!(event = "link_restart_failure", peer = %peer, error = %e);
                            let _ =
                                events.send(NegotiatorEvent::ConnectionFailed { peer: peer.clone() });
                            return;
                        }
                    }
                }
            }
            LinkState::Closed => return,
            _ => {}
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryFabric, MemoryLink, RecordingSignaling};

    fn negotiator(
        fabric: &Arc<MemoryFabric>,
        signaling: &Arc<RecordingSignaling>,
    ) -> (Negotiator, mpsc::UnboundedReceiver<NegotiatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Negotiator::new(fabric.transport(), signaling.clone(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn open_reuses_existing_link() {
        let fabric = MemoryFabric::new();
        let signaling = Arc::new(RecordingSignaling::new());
        let (neg, _rx) = negotiator(&fabric, &signaling);

        let peer: PeerId = "p1".into();
        let a = neg.open(&peer).await.unwrap();
        let b = neg.open(&peer).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn inbound_offer_produces_answer_over_signaling() {
        let fabric = MemoryFabric::new();
        let signaling = Arc::new(RecordingSignaling::new());
        let (neg, _rx) = negotiator(&fabric, &signaling);

        // A remote peer creates its own link and offer out-of-band.
        let remote = MemoryLink::create(&fabric);
        let offer = remote.create_offer().await.unwrap();

        let peer: PeerId = "remote".into();
        neg.handle_offer(&peer, &offer).await.unwrap();

        let sent = signaling.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        assert!(matches!(sent[0].1, SignalingMessage::Answer { .. }));
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description_then_flush_in_order() {
        let fabric = MemoryFabric::new();
        let signaling = Arc::new(RecordingSignaling::new());
        let (neg, _rx) = negotiator(&fabric, &signaling);

        let peer: PeerId = "remote".into();
        neg.handle_candidate(&peer, "cand-1").await.unwrap();
        neg.handle_candidate(&peer, "cand-2").await.unwrap();

        // Nothing applied yet: the link has no remote description.
        let local = fabric.transport_links()[0].clone();
        assert!(local.candidates().is_empty());

        let remote = MemoryLink::create(&fabric);
        let offer = remote.create_offer().await.unwrap();
        neg.handle_offer(&peer, &offer).await.unwrap();

        assert_eq!(local.candidates(), vec!["cand-1", "cand-2"]);

        // Later candidates apply immediately.
        neg.handle_candidate(&peer, "cand-3").await.unwrap();
        assert_eq!(local.candidates(), vec!["cand-1", "cand-2", "cand-3"]);
    }

    #[tokio::test]
    async fn unexpected_answer_is_dropped() {
        let fabric = MemoryFabric::new();
        let signaling = Arc::new(RecordingSignaling::new());
        let (neg, _rx) = negotiator(&fabric, &signaling);

        let peer: PeerId = "remote".into();
        neg.open(&peer).await.unwrap();
        // No local offer outstanding: the answer must be ignored, not fail.
        neg.handle_answer(&peer, "bogus-answer").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_consecutive_failure_surfaces_to_caller() {
        let fabric = MemoryFabric::new();
        let signaling = Arc::new(RecordingSignaling::new());
        let (neg, mut rx) = negotiator(&fabric, &signaling);

        let peer: PeerId = "flaky".into();
        neg.open(&peer).await.unwrap();
        let link = fabric.transport_links()[0].clone();

        // First failure: debounce elapses, one restart offer goes out.
        link.fail();
        tokio::time::sleep(RESTART_DEBOUNCE * 2).await;
        assert!(signaling
            .sent()
            .iter()
            .any(|(_, m)| matches!(m, SignalingMessage::Offer { .. })));

        // Still failed after the restart: fatal for this peer.
        link.fail();
        tokio::time::sleep(RESTART_DEBOUNCE * 2).await;
        match rx.try_recv() {
            Ok(NegotiatorEvent::ConnectionFailed { peer: failed }) => assert_eq!(failed, peer),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }
}
