//! Inbound transfer reassembly.
//!
//! Chunk frames arrive on an ordered, reliable channel and carry no
//! header, so the receiver maps them onto files purely by position: bytes
//! fill the current file's declared size, and the sender's `file-complete`
//! control message seals each file before the next one's chunks arrive.
//! Progress is checkpointed to the [`ResumeStore`] every
//! [`CHECKPOINT_INTERVAL_CHUNKS`] chunks so an interrupted transfer leaves
//! a recent offset behind.

use crate::config::CHECKPOINT_INTERVAL_CHUNKS;
use crate::error::{Error, Result};
use crate::event::{emit, Direction, EventTx, TransferEvent};
use crate::manifest::TransferManifest;
use crate::pipeline::progress::ProgressMeter;
use crate::pipeline::sink::{ChunkSink, SinkFactory};
use crate::resume::ResumeStore;
use crate::PeerId;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reassembles one peer's incoming transfer against its accepted manifest.
pub(crate) struct InboundTransfer {
    peer: PeerId,
    manifest: TransferManifest,
    sinks: Arc<dyn SinkFactory>,
    store: Arc<dyn ResumeStore>,
    events: EventTx,
    /// Index of the file currently being filled.
    current: usize,
    sink: Option<Box<dyn ChunkSink>>,
    file_received: u64,
    chunks_since_checkpoint: u32,
    meter: ProgressMeter,
    complete: bool,
}

impl InboundTransfer {
    pub fn new(
        peer: PeerId,
        manifest: TransferManifest,
        sinks: Arc<dyn SinkFactory>,
        store: Arc<dyn ResumeStore>,
        events: EventTx,
    ) -> Self {
        let meter = ProgressMeter::new(manifest.total_size());
        Self {
            peer,
            manifest,
            sinks,
            store,
            events,
            current: 0,
            sink: None,
            file_received: 0,
            chunks_since_checkpoint: 0,
            meter,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn received(&self) -> u64 {
        self.meter.bytes()
    }

    /// Append one chunk frame's payload to the current file.
    ///
    /// Bytes past the file's declared size are a protocol violation on an
    /// ordered channel: they are logged and dropped, never written.
    pub async fn accept_chunk(&mut self, bytes: Bytes) -> Result<()> {
        if self.complete || self.current >= self.manifest.files.len() {
            warn!(
                event = "unexpected_chunk",
                peer = %self.peer,
                len = bytes.len(),
                "Chunk after transfer completion, dropping"
            );
            return Ok(());
        }

        let declared = self.manifest.files[self.current].size;
        let remaining = declared.saturating_sub(self.file_received);
        let accept = (bytes.len() as u64).min(remaining) as usize;
        if accept < bytes.len() {
            warn!(
                event = "chunk_overflow",
                peer = %self.peer,
                file = %self.manifest.files[self.current].name,
                declared,
                excess = bytes.len() - accept,
                "Chunk exceeds declared file size, dropping excess"
            );
        }
        if accept == 0 {
            return Ok(());
        }

        if self.sink.is_none() {
            let file = &self.manifest.files[self.current];
            self.sink = Some(self.sinks.open(file).await?);
        }
        self.sink
            .as_mut()
            .ok_or_else(|| Error::Protocol("sink unavailable".into()))?
            .write(&bytes[..accept])
            .await?;

        self.file_received += accept as u64;
        self.meter.record(accept as u64);

        self.chunks_since_checkpoint += 1;
        if self.chunks_since_checkpoint >= CHECKPOINT_INTERVAL_CHUNKS {
            self.chunks_since_checkpoint = 0;
            let file_id = self.manifest.files[self.current].file_id();
            self.store.put(&file_id, self.file_received).await?;
            debug!(
                event = "resume_checkpoint",
                peer = %self.peer,
                file_id = %file_id,
                received = self.file_received,
            );
        }

        if let Some(snap) = self.meter.due() {
            emit(
                &self.events,
                TransferEvent::Progress {
                    peer: Some(self.peer.clone()),
                    direction: Direction::Inbound,
                    bytes: snap.bytes,
                    total_size: snap.total_size,
                    percent: snap.percent,
                    speed_bps: snap.speed_bps,
                },
            );
        }
        Ok(())
    }

    /// Seal the current file in response to the sender's `file-complete`
    /// message, then advance to the next one. Completing the last file
    /// completes the transfer.
    pub async fn complete_file(&mut self, file_id: &str) -> Result<()> {
        if self.complete || self.current >= self.manifest.files.len() {
            return Err(Error::Protocol(format!(
                "file-complete for {file_id} after transfer completion"
            )));
        }
        let descriptor = self.manifest.files[self.current].clone();
        if descriptor.file_id() != file_id {
            return Err(Error::Protocol(format!(
                "file-complete for {file_id} but current file is {}",
                descriptor.file_id()
            )));
        }
        if self.file_received != descriptor.size {
            return Err(Error::Protocol(format!(
                "file {} sealed short: {} of {} bytes",
                descriptor.name, self.file_received, descriptor.size
            )));
        }

        // Zero-length files never see a chunk; open the sink here so the
        // artifact still materializes.
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => self.sinks.open(&descriptor).await?,
        };
        let artifact = sink.finalize().await?;
        self.store.remove(&descriptor.file_id()).await?;
        info!(
            event = "file_received",
            peer = %self.peer,
            name = %descriptor.name,
            size = descriptor.size,
        );
        emit(
            &self.events,
            TransferEvent::FileCompleted {
                peer: self.peer.clone(),
                file_id: descriptor.file_id(),
                name: descriptor.name.clone(),
                artifact,
            },
        );

        self.current += 1;
        self.file_received = 0;
        self.chunks_since_checkpoint = 0;

        if self.current == self.manifest.files.len() {
            self.complete = true;
            let snap = self.meter.snapshot();
            emit(
                &self.events,
                TransferEvent::Progress {
                    peer: Some(self.peer.clone()),
                    direction: Direction::Inbound,
                    bytes: snap.bytes,
                    total_size: snap.total_size,
                    percent: snap.percent,
                    speed_bps: snap.speed_bps,
                },
            );
            emit(
                &self.events,
                TransferEvent::Completed {
                    peer: self.peer.clone(),
                    direction: Direction::Inbound,
                },
            );
        }
        Ok(())
    }

    /// Abandon the transfer mid-flight. The sink is dropped without
    /// finalizing and the last checkpoint stays in the store so a later
    /// transfer of the same file can resume.
    pub async fn abort(&mut self) {
        self.sink = None;
        if !self.complete && self.current < self.manifest.files.len() && self.file_received > 0 {
            let file_id = self.manifest.files[self.current].file_id();
            if let Err(e) = self.store.put(&file_id, self.file_received).await {
                warn!(event = "checkpoint_failure", peer = %self.peer, error = %e);
            }
        }
        self.complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileDescriptor;
    use crate::pipeline::sink::{MemorySinkFactory, SinkArtifact};
    use crate::resume::MemoryResumeStore;
    use tokio::sync::mpsc;

    fn manifest(files: &[(&str, u64)]) -> TransferManifest {
        TransferManifest {
            files: files
                .iter()
                .map(|(name, size)| FileDescriptor {
                    name: (*name).into(),
                    size: *size,
                    mime: "application/octet-stream".into(),
                    path: None,
                })
                .collect(),
        }
    }

    fn inbound(
        manifest: TransferManifest,
    ) -> (
        InboundTransfer,
        Arc<MemoryResumeStore>,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let store = Arc::new(MemoryResumeStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let transfer = InboundTransfer::new(
            "peer-1".into(),
            manifest,
            Arc::new(MemorySinkFactory::new()),
            store.clone(),
            tx,
        );
        (transfer, store, rx)
    }

    #[tokio::test]
    async fn reassembles_multiple_files_in_order() {
        let m = manifest(&[("a.txt", 5), ("b.bin", 3)]);
        let (mut t, _store, mut rx) = inbound(m.clone());

        t.accept_chunk(Bytes::from_static(b"hel")).await.unwrap();
        t.accept_chunk(Bytes::from_static(b"lo")).await.unwrap();
        t.complete_file(&m.files[0].file_id()).await.unwrap();
        assert!(!t.is_complete());

        t.accept_chunk(Bytes::from_static(b"xyz")).await.unwrap();
        t.complete_file(&m.files[1].file_id()).await.unwrap();
        assert!(t.is_complete());
        assert_eq!(t.received(), 8);

        let mut artifacts = Vec::new();
        let mut completed = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                TransferEvent::FileCompleted { name, artifact, .. } => {
                    artifacts.push((name, artifact));
                }
                TransferEvent::Completed { peer, direction } => {
                    assert_eq!(peer, "peer-1");
                    assert!(matches!(direction, Direction::Inbound));
                    completed = true;
                }
                _ => {}
            }
        }
        assert!(completed);
        assert_eq!(artifacts.len(), 2);
        match &artifacts[0].1 {
            SinkArtifact::Memory(b) => assert_eq!(&b[..], b"hello"),
            other => panic!("unexpected artifact: {other:?}"),
        }
        match &artifacts[1].1 {
            SinkArtifact::Memory(b) => assert_eq!(&b[..], b"xyz"),
            other => panic!("unexpected artifact: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_beyond_declared_size_is_dropped() {
        let m = manifest(&[("a.txt", 4)]);
        let (mut t, _store, mut rx) = inbound(m.clone());

        t.accept_chunk(Bytes::from_static(b"abcdEXTRA")).await.unwrap();
        t.complete_file(&m.files[0].file_id()).await.unwrap();
        assert!(t.is_complete());

        let bytes = loop {
            match rx.try_recv().unwrap() {
                TransferEvent::FileCompleted { artifact, .. } => {
                    break artifact.as_bytes().unwrap().clone()
                }
                _ => continue,
            }
        };
        assert_eq!(&bytes[..], b"abcd");
    }

    #[tokio::test]
    async fn short_file_on_complete_is_a_protocol_error() {
        let m = manifest(&[("a.txt", 10)]);
        let (mut t, _store, _rx) = inbound(m.clone());

        t.accept_chunk(Bytes::from_static(b"abc")).await.unwrap();
        let err = t.complete_file(&m.files[0].file_id()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn checkpoints_every_interval_and_clears_on_completion() {
        let size = (CHECKPOINT_INTERVAL_CHUNKS as u64 + 5) * 10;
        let m = manifest(&[("big.bin", size)]);
        let file_id = m.files[0].file_id();
        let (mut t, store, _rx) = inbound(m);

        for _ in 0..CHECKPOINT_INTERVAL_CHUNKS {
            t.accept_chunk(Bytes::from(vec![0u8; 10])).await.unwrap();
        }
        let record = store.get(&file_id).await.unwrap().unwrap();
        assert_eq!(record.received_size, CHECKPOINT_INTERVAL_CHUNKS as u64 * 10);

        for _ in 0..5 {
            t.accept_chunk(Bytes::from(vec![0u8; 10])).await.unwrap();
        }
        t.complete_file(&file_id).await.unwrap();
        assert!(store.get(&file_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_persists_a_final_checkpoint() {
        let m = manifest(&[("big.bin", 1000)]);
        let file_id = m.files[0].file_id();
        let (mut t, store, _rx) = inbound(m);

        t.accept_chunk(Bytes::from(vec![1u8; 64])).await.unwrap();
        t.abort().await;

        let record = store.get(&file_id).await.unwrap().unwrap();
        assert_eq!(record.received_size, 64);
    }

    #[tokio::test]
    async fn zero_length_file_completes_without_chunks() {
        let m = manifest(&[("empty.txt", 0)]);
        let (mut t, _store, mut rx) = inbound(m.clone());

        t.complete_file(&m.files[0].file_id()).await.unwrap();
        assert!(t.is_complete());

        let mut saw_artifact = false;
        while let Ok(ev) = rx.try_recv() {
            if let TransferEvent::FileCompleted { artifact, .. } = ev {
                assert_eq!(artifact.as_bytes().unwrap().len(), 0);
                saw_artifact = true;
            }
        }
        assert!(saw_artifact);
    }
}
