//! Transfer pipeline: chunk production, mesh fan-out, and reassembly.
//!
//! The sending side pulls fixed-size chunks from a background reader task
//! ([`reader`]) and fans each one out to every channel in the mesh
//! ([`sender`]): one disk read, N network writes, with per-channel
//! backpressure. The receiving side appends chunks into a polymorphic sink
//! ([`sink`]) and checkpoints progress for resume ([`receiver`]). Progress
//! reporting is throttled by [`progress`].

pub mod progress;
pub mod reader;
pub mod receiver;
pub mod sender;
pub mod sink;

pub use reader::{ChunkProducer, ChunkRead};
pub use sender::OutboundFile;
pub use sink::{ChunkSink, DirectorySinkFactory, MemorySinkFactory, SinkArtifact, SinkFactory};
