//! Mesh broadcast sender: one disk read, N network writes.
//!
//! For every file the engine pulls one chunk at a time from the
//! [`ChunkProducer`] and fans it out to all channels in the mesh
//! concurrently. Per-channel backpressure suspends only the slow channel's
//! write; the fan-out barrier resumes once every channel has accepted the
//! chunk or timed out, and only then is the next chunk requested.
//!
//! Failure policy per spec'd taxonomy: a write failure drops that peer
//! from the mesh (others unaffected), a stalled buffer proceeds
//! best-effort after the safety timeout, a read failure is fatal for the
//! whole transfer.

use crate::config::{BACKPRESSURE_POLL_INTERVAL, BACKPRESSURE_TIMEOUT, CHANNEL_HIGH_WATER};
use crate::error::Error;
use crate::event::{emit, Direction, EventTx, TransferEvent};
use crate::manifest::FileDescriptor;
use crate::pipeline::progress::ProgressMeter;
use crate::pipeline::reader::{ChunkProducer, ChunkRead};
use crate::protocol::{self, ControlMessage};
use crate::transport::ByteChannel;
use crate::PeerId;
use bytes::Bytes;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

/// A file queued for sending: its declared descriptor plus the local
/// source path the chunk producer reads from.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub descriptor: FileDescriptor,
    pub source: PathBuf,
}

/// Why the coordinator pulled a peer out of a running mesh.
///
/// The mesh sender is the only emitter of terminal events while it runs;
/// the reason travels with the eviction so the right event fires exactly
/// once even when a write failure races the eviction.
#[derive(Debug)]
pub(crate) enum EvictReason {
    Cancelled,
    Failed(Error),
}

/// One mesh participant.
pub(crate) struct MeshChannel {
    pub peer: PeerId,
    pub channel: Arc<dyn ByteChannel>,
}

/// How a mesh send ended.
#[derive(Debug)]
pub(crate) enum MeshOutcome {
    /// All files streamed; these peers stayed healthy to the end.
    Completed { survivors: Vec<PeerId> },
    /// Cancellation was requested; remaining peers listed for teardown.
    Cancelled { remaining: Vec<PeerId> },
    /// Every peer dropped out mid-transfer.
    AllDropped,
    /// The chunk producer failed; fatal for the whole transfer.
    ReadFailed,
}

pub(crate) struct MeshSender {
    channels: Vec<MeshChannel>,
    producer: ChunkProducer,
    cancel: watch::Receiver<bool>,
    /// Peers the coordinator resolved mid-stream; removed between chunks.
    evict: mpsc::UnboundedReceiver<(PeerId, EvictReason)>,
    events: EventTx,
}

impl MeshSender {
    pub fn new(
        channels: Vec<MeshChannel>,
        producer: ChunkProducer,
        cancel: watch::Receiver<bool>,
        evict: mpsc::UnboundedReceiver<(PeerId, EvictReason)>,
        events: EventTx,
    ) -> Self {
        Self {
            channels,
            producer,
            cancel,
            evict,
            events,
        }
    }

    /// Stream `files` to every mesh channel.
    ///
    /// While running, this is the only emitter of per-peer terminal
    /// events: eviction reasons, write failures, read failures, and
    /// `Completed` for survivors. Local cancellation is the exception;
    /// the supervisor resolves the remaining peers it returns.
    pub async fn run(mut self, files: Vec<OutboundFile>) -> MeshOutcome {
        let total_size: u64 = files.iter().map(|f| f.descriptor.size).sum();
        let mut meter = ProgressMeter::new(total_size);
        meter.start();
        let started = Instant::now();

        for file in &files {
            let mut rx = self.producer.start(
                file.source.clone(),
                file.descriptor.size,
                0,
            );

            loop {
                self.drain_evictions();
                if self.channels.is_empty() {
                    return MeshOutcome::AllDropped;
                }
                // Cooperative cancellation: checked between chunks, so at
                // most one chunk completes in flight after the request.
                if *self.cancel.borrow() {
                    return MeshOutcome::Cancelled {
                        remaining: self.peers(),
                    };
                }

                match rx.recv().await {
                    Some(ChunkRead::Data { bytes, .. }) => {
                        let n = bytes.len() as u64;
                        self.fan_out(protocol::encode_chunk(&bytes)).await;
                        meter.record(n);
                        if let Some(snap) = meter.due() {
                            emit(
                                &self.events,
                                TransferEvent::Progress {
                                    peer: None,
                                    direction: Direction::Outbound,
                                    bytes: snap.bytes,
                                    total_size: snap.total_size,
                                    percent: snap.percent,
                                    speed_bps: snap.speed_bps,
                                },
                            );
                        }
                    }
                    Some(ChunkRead::Complete) | None => break,
                    Some(ChunkRead::Failed(reason)) => {
                        warn!(
                            event = "chunk_read_failure",
                            file = %file.descriptor.name,
                            reason = %reason,
                            "Aborting transfer"
                        );
                        for mc in self.channels.drain(..) {
                            emit(
                                &self.events,
                                TransferEvent::Failed {
                                    peer: mc.peer,
                                    error: Error::Read(reason.clone()),
                                },
                            );
                        }
                        return MeshOutcome::ReadFailed;
                    }
                }
            }

            // Tell every surviving peer this file is finished.
            let complete = ControlMessage::FileComplete {
                name: file.descriptor.name.clone(),
                file_id: file.descriptor.file_id(),
            };
            match protocol::encode_control(&complete) {
                Ok(frame) => self.fan_out(frame).await,
                Err(e) => warn!(event = "control_encode_failure", error = %e),
            }
        }

        let snap = meter.snapshot();
        emit(
            &self.events,
            TransferEvent::Progress {
                peer: None,
                direction: Direction::Outbound,
                bytes: snap.bytes,
                total_size: snap.total_size,
                percent: snap.percent,
                speed_bps: snap.speed_bps,
            },
        );
        info!(
            event = "mesh_send_complete",
            peers = self.channels.len(),
            bytes = snap.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );

        let survivors = self.peers();
        for peer in &survivors {
            emit(
                &self.events,
                TransferEvent::Completed {
                    peer: peer.clone(),
                    direction: Direction::Outbound,
                },
            );
        }
        MeshOutcome::Completed { survivors }
    }

    fn peers(&self) -> Vec<PeerId> {
        self.channels.iter().map(|c| c.peer.clone()).collect()
    }

    fn drain_evictions(&mut self) {
        while let Ok((peer, reason)) = self.evict.try_recv() {
            let before = self.channels.len();
            self.channels.retain(|c| c.peer != peer);
            if self.channels.len() == before {
                // Already dropped by a write failure; its event fired then.
                continue;
            }
            match reason {
                EvictReason::Cancelled => emit(
                    &self.events,
                    TransferEvent::Cancelled { peer },
                ),
                EvictReason::Failed(error) => emit(
                    &self.events,
                    TransferEvent::Failed { peer, error },
                ),
            }
        }
    }

    /// Write one frame to every channel concurrently, dropping peers whose
    /// writes fail. One slow channel never blocks the others' writes; the
    /// barrier completes when all have accepted the frame or timed out.
    async fn fan_out(&mut self, frame: Bytes) {
        let results = join_all(
            self.channels
                .iter()
                .map(|mc| send_with_backpressure(mc, frame.clone())),
        )
        .await;

        let mut dropped = Vec::new();
        for (idx, result) in results.iter().enumerate() {
            if let Err(e) = result {
                let peer = self.channels[idx].peer.clone();
                warn!(event = "peer_dropped_from_mesh", peer = %peer, error = %e);
                emit(
                    &self.events,
                    TransferEvent::Failed {
                        peer: peer.clone(),
                        error: Error::ChannelWrite {
                            peer: peer.clone(),
                            reason: e.to_string(),
                        },
                    },
                );
                dropped.push(peer);
            }
        }
        if !dropped.is_empty() {
            self.channels.retain(|c| !dropped.contains(&c.peer));
        }
    }
}

async fn send_with_backpressure(mc: &MeshChannel, frame: Bytes) -> crate::Result<()> {
    wait_for_buffer_space(&mc.channel, frame.len(), &mc.peer).await?;
    mc.channel.send(frame).await.map_err(|e| Error::ChannelWrite {
        peer: mc.peer.clone(),
        reason: e.to_string(),
    })
}

/// Suspend until the channel's send buffer has room for `next_frame`
/// bytes, or the safety timeout elapses (in which case we proceed
/// best-effort rather than stalling the mesh on one peer).
async fn wait_for_buffer_space(
    channel: &Arc<dyn ByteChannel>,
    next_frame: usize,
    peer: &PeerId,
) -> crate::Result<()> {
    if !channel.is_open() {
        return Err(Error::ChannelClosed { peer: peer.clone() });
    }
    if channel.buffered_amount().await + next_frame <= CHANNEL_HIGH_WATER {
        return Ok(());
    }

    let buffered = channel.buffered_amount().await;
    info!(
        event = "backpressure_applied",
        peer = %peer,
        buffered,
        next_frame,
        high_water = CHANNEL_HIGH_WATER,
        "Waiting for channel buffer to drain"
    );

    let deadline = Instant::now() + BACKPRESSURE_TIMEOUT;
    loop {
        if !channel.is_open() {
            return Err(Error::ChannelClosed { peer: peer.clone() });
        }
        if channel.buffered_amount().await + next_frame <= CHANNEL_HIGH_WATER {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }

    if channel.is_open() {
        warn!(event = "backpressure_timeout", peer = %peer, "Buffer drain timeout, proceeding anyway");
        Ok(())
    } else {
        Err(Error::ChannelClosed { peer: peer.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    fn outbound(dir: &std::path::Path, name: &str, data: &[u8]) -> OutboundFile {
        let source = dir.join(name);
        std::fs::write(&source, data).unwrap();
        OutboundFile {
            descriptor: FileDescriptor {
                name: name.into(),
                size: data.len() as u64,
                mime: "application/octet-stream".into(),
                path: None,
            },
            source,
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("meshdrop_test").join("sender").join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    async fn collect_frames(mut rx: mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn fans_every_chunk_out_to_all_channels() {
        let dir = test_dir("fanout");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let file = outbound(&dir, "data.bin", &data);

        let (a_local, a_remote) = MemoryChannel::pair("transfer");
        let (b_local, b_remote) = MemoryChannel::pair("transfer");
        let a_rx = a_remote.take_incoming().unwrap();
        let b_rx = b_remote.take_incoming().unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_evict_tx, evict_rx) = mpsc::unbounded_channel();

        let sender = MeshSender::new(
            vec![
                MeshChannel { peer: "p1".into(), channel: a_local },
                MeshChannel { peer: "p2".into(), channel: b_local },
            ],
            ChunkProducer::new(1024),
            cancel_rx,
            evict_rx,
            events_tx,
        );

        let outcome = sender.run(vec![file]).await;
        let MeshOutcome::Completed { survivors } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(survivors.len(), 2);

        // Both peers see identical byte streams: 5 chunk frames + file-complete.
        for rx in [a_rx, b_rx] {
            let frames = collect_frames(rx).await;
            assert_eq!(frames.len(), 6);
            let payload: Vec<u8> = frames[..5]
                .iter()
                .flat_map(|f| f[1..].to_vec())
                .collect();
            assert_eq!(payload, data);
            assert_eq!(frames[5][0], protocol::FRAME_CONTROL);
        }

        // Terminal event per peer, exactly once.
        let mut completed = 0;
        while let Ok(ev) = events_rx.try_recv() {
            if matches!(ev, TransferEvent::Completed { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn write_failure_drops_only_that_peer() {
        let dir = test_dir("drop_one");
        let data = vec![9u8; 3000];
        let file = outbound(&dir, "data.bin", &data);

        let (a_local, a_remote) = MemoryChannel::pair("transfer");
        let (b_local, b_remote) = MemoryChannel::pair("transfer");
        let b_rx = b_remote.take_incoming().unwrap();
        // Peer a's channel is closed before the send starts.
        a_remote.close().await;
        a_local.close().await;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_evict_tx, evict_rx) = mpsc::unbounded_channel();

        let sender = MeshSender::new(
            vec![
                MeshChannel { peer: "p1".into(), channel: a_local },
                MeshChannel { peer: "p2".into(), channel: b_local },
            ],
            ChunkProducer::new(1024),
            cancel_rx,
            evict_rx,
            events_tx,
        );

        let outcome = sender.run(vec![file]).await;
        let MeshOutcome::Completed { survivors } = outcome else {
            panic!("expected completion for the healthy peer");
        };
        assert_eq!(survivors, vec!["p2".to_string()]);

        let frames = collect_frames(b_rx).await;
        let payload: Vec<u8> = frames
            .iter()
            .filter(|f| f[0] == protocol::FRAME_CHUNK)
            .flat_map(|f| f[1..].to_vec())
            .collect();
        assert_eq!(payload, data);

        let mut failed = Vec::new();
        let mut completed = Vec::new();
        while let Ok(ev) = events_rx.try_recv() {
            match ev {
                TransferEvent::Failed { peer, .. } => failed.push(peer),
                TransferEvent::Completed { peer, .. } => completed.push(peer),
                _ => {}
            }
        }
        assert_eq!(failed, vec!["p1".to_string()]);
        assert_eq!(completed, vec!["p2".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_chunks() {
        let dir = test_dir("cancel");
        let data = vec![7u8; 64 * 1024];
        let file = outbound(&dir, "data.bin", &data);

        let (a_local, _a_remote) = MemoryChannel::pair("transfer");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (_evict_tx, evict_rx) = mpsc::unbounded_channel();

        cancel_tx.send(true).unwrap();
        let sender = MeshSender::new(
            vec![MeshChannel { peer: "p1".into(), channel: a_local }],
            ChunkProducer::new(1024),
            cancel_rx,
            evict_rx,
            events_tx,
        );

        match sender.run(vec![file]).await {
            MeshOutcome::Cancelled { remaining } => assert_eq!(remaining, vec!["p1".to_string()]),
            other => panic!("expected cancellation, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_holds_until_drain_or_timeout() {
        let (local, _remote) = MemoryChannel::pair("transfer");
        let channel: Arc<dyn ByteChannel> = local.clone();

        // Inflate the gauge past the high-water mark.
        local.hold(CHANNEL_HIGH_WATER + 1);
        let peer: PeerId = "slow".into();

        let wait = tokio::spawn({
            let channel = channel.clone();
            let peer = peer.clone();
            async move { wait_for_buffer_space(&channel, 1024, &peer).await }
        });

        // Give the waiter a few poll cycles, then drain the buffer.
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL * 5).await;
        assert!(!wait.is_finished());
        local.release();
        let result = wait.await.unwrap();
        assert!(result.is_ok());

        // A permanently stalled channel resolves Ok after the timeout.
        local.hold(CHANNEL_HIGH_WATER + 1);
        let started = tokio::time::Instant::now();
        wait_for_buffer_space(&channel, 1024, &peer).await.unwrap();
        assert!(started.elapsed() >= BACKPRESSURE_TIMEOUT);
    }
}
