//! Error taxonomy for the transfer engine.
//!
//! Failures are grouped by where a caller can act on them: negotiation
//! failures are fatal for that peer after one automatic restart, channel
//! write failures drop a single peer from its mesh, read failures abort
//! the transfer, and protocol violations are logged and ignored by the
//! dispatcher unless repeated.

use crate::PeerId;
use thiserror::Error;

/// All errors surfaced by the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control message codec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("negotiation with peer {peer} failed: {reason}")]
    Negotiation { peer: PeerId, reason: String },

    #[error("write to peer {peer} failed: {reason}")]
    ChannelWrite { peer: PeerId, reason: String },

    #[error("channel to peer {peer} is closed")]
    ChannelClosed { peer: PeerId },

    #[error("no active channel for peer {peer}")]
    UnknownPeer { peer: PeerId },

    #[error("chunk read failed: {0}")]
    Read(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("an outbound transfer session is already active")]
    Busy,

    #[error("resume store: {0}")]
    Store(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
