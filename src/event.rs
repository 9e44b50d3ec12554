//! Caller-facing events.
//!
//! The engine never renders anything; every observable state change is
//! pushed onto one unbounded channel the caller receives from
//! [`crate::session::SessionCoordinator::new`]. Exactly one terminal event
//! (`Completed` | `Declined` | `Cancelled` | `Failed`) is emitted per
//! transfer per peer.

use crate::error::Error;
use crate::manifest::FileDescriptor;
use crate::pipeline::sink::SinkArtifact;
use crate::PeerId;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Transfer direction, from the local device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Events emitted by the engine.
#[derive(Debug)]
pub enum TransferEvent {
    /// A mesh session became ready and started streaming.
    TransferStarted {
        session_id: Uuid,
        peers: Vec<PeerId>,
        total_size: u64,
    },
    /// Throttled progress/speed statistics (at most one per 150 ms).
    ///
    /// `peer` is `None` for the outbound mesh aggregate (one disk read is
    /// shared across all sends) and `Some` for a per-peer inbound stream.
    Progress {
        peer: Option<PeerId>,
        direction: Direction,
        bytes: u64,
        total_size: u64,
        percent: f64,
        speed_bps: f64,
    },
    /// A peer declared a transfer and awaits local consent.
    ///
    /// Answer through `reply`; silence for 120 s counts as a decline.
    ConsentRequest {
        peer: PeerId,
        files: Vec<FileDescriptor>,
        reply: ConsentReply,
    },
    /// One received file was finalized into its sink.
    FileCompleted {
        peer: PeerId,
        file_id: String,
        name: String,
        artifact: SinkArtifact,
    },
    /// Terminal: the transfer with this peer finished successfully.
    Completed { peer: PeerId, direction: Direction },
    /// Terminal: the peer declined the transfer.
    Declined { peer: PeerId },
    /// Terminal: the transfer with this peer was cancelled (either side).
    Cancelled { peer: PeerId },
    /// Terminal: the transfer with this peer failed.
    Failed { peer: PeerId, error: Error },
    /// A short text snippet arrived from a peer.
    TextReceived { peer: PeerId, body: String },
    /// A peer reported its persisted resume offset for a file.
    ResumeOffset {
        peer: PeerId,
        file_id: String,
        offset: u64,
    },
}

/// One-shot consent decision handle carried by
/// [`TransferEvent::ConsentRequest`].
///
/// Dropping the handle without answering resolves the prompt the same way
/// the consent timeout does: as a decline.
#[derive(Debug)]
pub struct ConsentReply {
    tx: Option<oneshot::Sender<bool>>,
}

impl ConsentReply {
    pub(crate) fn new(tx: oneshot::Sender<bool>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Accept the declared transfer.
    pub fn accept(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Decline the declared transfer.
    pub fn decline(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

pub(crate) type EventTx = mpsc::UnboundedSender<TransferEvent>;

/// Forward an event to the caller, ignoring a hung-up receiver.
pub(crate) fn emit(tx: &EventTx, event: TransferEvent) {
    let _ = tx.send(event);
}
