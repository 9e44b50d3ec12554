//! # meshdrop
//!
//! Peer-to-peer transfer engine for files and short text snippets.
//!
//! The engine negotiates direct connections between devices over a
//! relay-only signaling channel, runs a consent handshake per transfer
//! (offer / accept / decline / cancel, with a bounded wait), and streams
//! files as framed binary chunks over one or many simultaneously selected
//! peer channels, one disk read fanned out to N sends. Per-channel
//! backpressure keeps memory bounded, and periodic checkpoints make an
//! interrupted receive resumable.
//!
//! ## Capabilities, not globals
//!
//! The engine is constructed explicitly from four injected capabilities:
//!
//! - [`transport::SignalingTransport`]: fire-and-forget delivery of
//!   connection-setup envelopes, addressed by peer id.
//! - [`transport::PeerTransport`]: the negotiated-transport primitive
//!   (one connection per peer, ordered/reliable byte channels). A
//!   WebRTC-backed implementation ships in [`transport::webrtc`].
//! - [`resume::ResumeStore`]: key-value bookkeeping for resumable receives.
//! - [`pipeline::SinkFactory`]: where received bytes land (streaming file
//!   sink or in-memory buffer).
//!
//! Everything the caller needs to observe arrives on a single
//! [`event::TransferEvent`] channel returned by
//! [`session::SessionCoordinator::new`].

pub mod config;
pub mod error;
pub mod event;
pub mod manifest;
pub mod negotiator;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod resume;
pub mod session;
pub mod testing;
pub mod transport;

pub use error::{Error, Result};
pub use event::{ConsentReply, Direction, TransferEvent};
pub use manifest::{FileDescriptor, TransferManifest};
pub use pipeline::sender::OutboundFile;
pub use protocol::{ControlMessage, SignalingMessage};
pub use session::SessionCoordinator;

/// Peer identifier as supplied by the caller's roster.
///
/// The engine never interprets peer ids; they are opaque routing keys for
/// the signaling transport and the per-peer maps.
pub type PeerId = String;
