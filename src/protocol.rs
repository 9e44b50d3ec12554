//! Wire protocol: signaling envelopes, control messages, and frame codec.
//!
//! Every message on a peer channel uses a compact binary envelope:
//!
//! ```text
//!   [1 byte: frame tag] [N bytes: payload]
//! ```
//!
//! Frame tags:
//! - `0x01`: control (JSON-encoded [`ControlMessage`])
//! - `0x02`: chunk (raw file bytes, no inline header)
//!
//! Chunk frames deliberately carry no offset or file id: the channel is
//! ordered and reliable, so the receiver reconstructs position from
//! cumulative receipt order against the declared manifest. A full-sized
//! chunk costs exactly one tag byte of overhead.
//!
//! Signaling messages never touch the channel; they ride the external
//! relay-only signaling transport during connection setup.

use crate::error::{Error, Result};
use crate::manifest::FileDescriptor;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame tag for control messages.
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame tag for binary chunk payloads.
pub const FRAME_CHUNK: u8 = 0x02;

// ── Signaling ────────────────────────────────────────────────────────────────

/// Connection-setup envelopes exchanged over the signaling transport.
///
/// Fire-and-forget: nothing at this layer acknowledges them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Session description offer from the initiating side.
    Offer { sdp: String },
    /// Session description answer from the responding side.
    Answer { sdp: String },
    /// Connectivity candidate for path establishment.
    IceCandidate { candidate: String },
}

// ── Control messages ─────────────────────────────────────────────────────────

/// Control traffic carried over the peer channel as `FRAME_CONTROL` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Declared file list, sent once before any chunk.
    Metadata { files: Vec<FileDescriptor> },
    /// Receiver consents to the declared transfer.
    Accept,
    /// Receiver declines; the sender removes this peer from the mesh.
    Decline,
    /// Either side aborts its participation before completion.
    Cancel,
    /// All bytes of one file have been sent; receiver should finalize it.
    FileComplete { name: String, file_id: String },
    /// Ask the peer how many bytes it has persisted for a file.
    ResumeQuery { file_id: String },
    /// Answer to a resume query; `offset` is 0 when nothing is persisted.
    ResumeResponse { file_id: String, offset: u64 },
    /// Short text snippet delivered outside any file transfer.
    Text { body: String },
}

// ── Frame codec ──────────────────────────────────────────────────────────────

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(Bytes),
}

/// Encode a control frame: `[0x01][json bytes]`.
pub fn encode_control(msg: &ControlMessage) -> Result<Bytes> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Encode a chunk frame: `[0x02][payload]`.
pub fn encode_chunk(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode an inbound frame, slicing the payload without copying.
pub fn decode_frame(frame: &Bytes) -> Result<Frame> {
    let Some(&tag) = frame.first() else {
        return Err(Error::Protocol("empty frame".into()));
    };
    let payload = frame.slice(1..);
    match tag {
        FRAME_CONTROL => {
            let msg: ControlMessage = serde_json::from_slice(&payload)?;
            Ok(Frame::Control(msg))
        }
        FRAME_CHUNK => Ok(Frame::Chunk(payload)),
        other => Err(Error::Protocol(format!("unknown frame tag 0x{other:02x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_roundtrip() {
        let msg = ControlMessage::FileComplete {
            name: "a.txt".into(),
            file_id: "a.txt-100".into(),
        };
        let frame = encode_control(&msg).unwrap();
        assert_eq!(frame[0], FRAME_CONTROL);
        match decode_frame(&frame).unwrap() {
            Frame::Control(m) => assert_eq!(m, msg),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn control_uses_kebab_case_tags() {
        let json = serde_json::to_string(&ControlMessage::ResumeQuery {
            file_id: "b.bin-500000".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"resume-query\""));
        assert!(json.contains("\"file_id\":\"b.bin-500000\""));
    }

    #[test]
    fn chunk_frame_is_tag_plus_raw_bytes() {
        let payload = vec![7u8; 1024];
        let frame = encode_chunk(&payload);
        assert_eq!(frame.len(), 1025);
        match decode_frame(&frame).unwrap() {
            Frame::Chunk(bytes) => assert_eq!(&bytes[..], &payload[..]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let frame = Bytes::from_static(&[0x7f, 1, 2, 3]);
        assert!(matches!(
            decode_frame(&frame),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode_frame(&Bytes::new()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn signaling_envelope_shape() {
        let json = serde_json::to_string(&SignalingMessage::IceCandidate {
            candidate: "candidate:0 1 UDP ...".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
    }
}
