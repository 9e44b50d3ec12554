//! Centralized configuration constants.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame tag bytes) stay with
//! the codec in [`crate::protocol`].

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (60 KiB).
///
/// One chunk is one read window on the sending side and one binary frame
/// on the wire. Sized to stay under the 64 KiB message cap common to
/// SCTP-based data channels after the one-byte frame tag, with margin for
/// transport-level envelopes; the last chunk of a file may be smaller.
pub const CHUNK_SIZE: usize = 60 * 1024;

/// Label of the single ordered/reliable byte channel each peer link carries.
pub const CHANNEL_LABEL: &str = "transfer";

/// Receive-side checkpoint cadence, measured in chunks.
///
/// Every this many accepted chunks the receiver persists a resume record
/// for the file currently being received.
pub const CHECKPOINT_INTERVAL_CHUNKS: u32 = 20;

// ── Backpressure ─────────────────────────────────────────────────────────────

/// High-water mark for a channel's outstanding buffered bytes (12 MiB).
///
/// When `buffered_amount` would exceed this value, sending on that channel
/// suspends until the buffer drains or [`BACKPRESSURE_TIMEOUT`] elapses.
/// Other channels in the same mesh are never blocked by one slow channel.
pub const CHANNEL_HIGH_WATER: usize = 12 * 1024 * 1024;

/// Safety timeout for a single backpressure wait.
///
/// A channel that fails to drain within this window is treated as stalled:
/// the engine proceeds best-effort rather than deadlocking the mesh.
pub const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a channel's send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── Consent / Sessions ───────────────────────────────────────────────────────

/// Bounded wait for the caller to answer a consent prompt.
///
/// No response within this window is treated as an implicit decline.
pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Minimum interval between progress/speed events emitted to the caller.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(150);

// ── Connection / Negotiation ─────────────────────────────────────────────────

/// Debounce window after a connectivity failure before attempting a
/// negotiation restart. A connection that recovers on its own within the
/// window is left alone.
pub const RESTART_DEBOUNCE: Duration = Duration::from_secs(2);

/// Timeout waiting for a byte channel to reach the open state.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall peer connection establishment timeout.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for ICE candidate gathering while producing a local description.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

// ── Resume bookkeeping ───────────────────────────────────────────────────────

/// Age after which a persisted resume record is eligible for garbage
/// collection (7 days).
pub const RESUME_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
