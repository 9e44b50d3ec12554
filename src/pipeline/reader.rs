//! Chunk producer: sequential file reads off the coordinating task.
//!
//! One reader task is spawned per in-flight file so disk I/O never blocks
//! negotiation or other peers' chunk delivery. The task communicates
//! exclusively by message passing: each read window is handed over as an
//! owned [`bytes::Bytes`] (no copy on the consumer side), and the
//! capacity-1 channel is the "ready for next" handshake: the reader
//! cannot run more than one chunk ahead of consumption.

use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::debug;

/// One message from the reader task.
#[derive(Debug)]
pub enum ChunkRead {
    /// The next window of file bytes, in offset order.
    Data { offset: u64, bytes: Bytes },
    /// `offset` reached the declared file size.
    Complete,
    /// A read failed; the transfer is not salvageable from here.
    Failed(String),
}

/// Factory for per-file reader tasks, reused across the files of one
/// transfer. Holds the window size; the file handle belongs to the task.
#[derive(Debug, Clone)]
pub struct ChunkProducer {
    chunk_size: usize,
}

impl ChunkProducer {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Start reading `path` from `offset` up to `size`.
    ///
    /// Returns the receiving end of a capacity-1 channel. The final
    /// message is always `Complete` or `Failed`; a zero-byte read before
    /// the declared size is a failure, never end-of-stream.
    pub fn start(&self, path: PathBuf, size: u64, offset: u64) -> mpsc::Receiver<ChunkRead> {
        let (tx, rx) = mpsc::channel(1);
        let chunk_size = self.chunk_size;

        tokio::spawn(async move {
            let outcome = read_loop(&path, size, offset, chunk_size, &tx).await;
            let last = match outcome {
                Ok(()) => ChunkRead::Complete,
                Err(reason) => ChunkRead::Failed(reason),
            };
            let _ = tx.send(last).await;
        });

        rx
    }
}

async fn read_loop(
    path: &PathBuf,
    size: u64,
    mut offset: u64,
    chunk_size: usize,
    tx: &mpsc::Sender<ChunkRead>,
) -> std::result::Result<(), String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("open {}: {e}", path.display()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| format!("seek {}: {e}", path.display()))?;
        debug!(event = "reader_seek", path = %path.display(), offset);
    }

    while offset < size {
        let window = (chunk_size as u64).min(size - offset) as usize;
        let mut buf = vec![0u8; window];
        let mut filled = 0usize;
        while filled < window {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| format!("read {}: {e}", path.display()))?;
            if n == 0 {
                // The file is shorter than declared (truncated mid-transfer).
                return Err(format!(
                    "zero-byte read at offset {} of {} (declared size {})",
                    offset + filled as u64,
                    path.display(),
                    size
                ));
            }
            filled += n;
        }

        let chunk = ChunkRead::Data {
            offset,
            bytes: Bytes::from(buf),
        };
        // A full channel is the consumer telling us it is not ready yet;
        // a closed one means the consumer went away.
        if tx.send(chunk).await.is_err() {
            return Ok(());
        }
        offset += window as u64;
    }

    Ok(())
}

/// Drain helper used by tests and simple callers.
impl ChunkProducer {
    /// Number of chunks a file of `size` bytes divides into.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("meshdrop_test").join("reader").join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    #[tokio::test]
    async fn produces_all_chunks_in_offset_order() {
        let dir = test_dir("all_chunks");
        let path = dir.join("data.bin");
        let chunk = 1024usize;
        let data: Vec<u8> = (0..chunk * 3 + 100).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let producer = ChunkProducer::new(chunk);
        let mut rx = producer.start(path, data.len() as u64, 0);

        let mut reassembled = Vec::new();
        let mut expected_offset = 0u64;
        loop {
            match rx.recv().await.unwrap() {
                ChunkRead::Data { offset, bytes } => {
                    assert_eq!(offset, expected_offset);
                    expected_offset += bytes.len() as u64;
                    reassembled.extend_from_slice(&bytes);
                }
                ChunkRead::Complete => break,
                ChunkRead::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(reassembled, data);
        assert_eq!(expected_offset, data.len() as u64);

        cleanup(&dir);
    }

    #[tokio::test]
    async fn resumes_from_nonzero_offset() {
        let dir = test_dir("resume_offset");
        let path = dir.join("data.bin");
        let data = vec![0xCDu8; 4096];
        std::fs::write(&path, &data).unwrap();

        let producer = ChunkProducer::new(1024);
        let mut rx = producer.start(path, 4096, 2048);

        let first = rx.recv().await.unwrap();
        match first {
            ChunkRead::Data { offset, ref bytes } => {
                assert_eq!(offset, 2048);
                assert_eq!(bytes.len(), 1024);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_file_is_a_failure_not_eof() {
        let dir = test_dir("short_file");
        let path = dir.join("truncated.bin");
        // Declared 4096 bytes, only 1000 on disk.
        std::fs::write(&path, vec![1u8; 1000]).unwrap();

        let producer = ChunkProducer::new(1024);
        let mut rx = producer.start(path, 4096, 0);

        let mut failed = false;
        while let Some(msg) = rx.recv().await {
            match msg {
                ChunkRead::Failed(reason) => {
                    assert!(reason.contains("zero-byte read"));
                    failed = true;
                }
                ChunkRead::Complete => panic!("short file must not complete"),
                ChunkRead::Data { .. } => {}
            }
        }
        assert!(failed);

        cleanup(&dir);
    }

    #[tokio::test]
    async fn empty_file_completes_immediately() {
        let dir = test_dir("empty");
        let path = dir.join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let producer = ChunkProducer::new(1024);
        let mut rx = producer.start(path, 0, 0);
        assert!(matches!(rx.recv().await.unwrap(), ChunkRead::Complete));

        cleanup(&dir);
    }
}
