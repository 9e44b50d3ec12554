//! Chunk sinks: where received bytes land.
//!
//! The transfer engine is agnostic to storage: it appends into whatever
//! [`ChunkSink`] the injected [`SinkFactory`] opens for a file. Two
//! implementations ship here: a streaming file sink for platforms with a
//! writable directory, and an in-memory buffer fallback.

use crate::error::Result;
use crate::manifest::FileDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// What a finalized sink leaves behind.
#[derive(Debug, Clone)]
pub enum SinkArtifact {
    /// The file was streamed to this path.
    File(PathBuf),
    /// The file was buffered in memory.
    Memory(Bytes),
}

/// Append-only destination for one file's bytes.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush and seal the sink, producing its artifact. The sink is
    /// consumed; a finalized file is never written to again.
    async fn finalize(self: Box<Self>) -> Result<SinkArtifact>;
}

/// Opens one sink per declared file.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, file: &FileDescriptor) -> Result<Box<dyn ChunkSink>>;
}

// ── Path sanitization ────────────────────────────────────────────────────────

/// Sanitize a relative path by filtering each component.
///
/// - Normalizes separators to forward slashes
/// - Removes `.` and `..` components
/// - Filters characters to alphanumeric, `.`, `-`, `_`, and space
/// - Returns "file" if the result would be empty
pub(crate) fn sanitize_relative_path(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let parts: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

    if parts.is_empty() {
        return PathBuf::from("file");
    }

    let mut result = PathBuf::new();
    for part in parts {
        if part == "." || part == ".." {
            continue;
        }
        let safe: String = part
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect();
        if !safe.is_empty() {
            result.push(safe);
        }
    }

    if result.as_os_str().is_empty() {
        PathBuf::from("file")
    } else {
        result
    }
}

// ── Streaming file sink ──────────────────────────────────────────────────────

/// Streams bytes straight to disk under a root directory, preserving the
/// declared folder structure after sanitization.
pub struct DirectorySinkFactory {
    root: PathBuf,
}

impl DirectorySinkFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn destination(&self, file: &FileDescriptor) -> PathBuf {
        let relative = file.path.as_deref().unwrap_or(&file.name);
        self.root.join(sanitize_relative_path(relative))
    }
}

#[async_trait]
impl SinkFactory for DirectorySinkFactory {
    async fn open(&self, file: &FileDescriptor) -> Result<Box<dyn ChunkSink>> {
        let path = self.destination(file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let handle = tokio::fs::File::create(&path).await?;
        debug!(event = "sink_opened", path = %path.display(), size = file.size);
        Ok(Box::new(FileSink { handle, path }))
    }
}

struct FileSink {
    handle: tokio::fs::File,
    path: PathBuf,
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.handle.write_all(bytes).await?;
        Ok(())
    }

    async fn finalize(mut self: Box<Self>) -> Result<SinkArtifact> {
        self.handle.flush().await?;
        self.handle.sync_all().await?;
        Ok(SinkArtifact::File(self.path))
    }
}

// ── In-memory sink ───────────────────────────────────────────────────────────

/// Buffers every file fully in memory; the fallback when no writable
/// directory is available.
#[derive(Default)]
pub struct MemorySinkFactory;

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn open(&self, file: &FileDescriptor) -> Result<Box<dyn ChunkSink>> {
        Ok(Box::new(MemorySink {
            buf: Vec::with_capacity(file.size.min(64 * 1024 * 1024) as usize),
        }))
    }
}

struct MemorySink {
    buf: Vec<u8>,
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<SinkArtifact> {
        Ok(SinkArtifact::Memory(Bytes::from(self.buf)))
    }
}

/// Convenience accessor used by tests and simple callers.
impl SinkArtifact {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            SinkArtifact::File(p) => Some(p),
            SinkArtifact::Memory(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            SinkArtifact::Memory(b) => Some(b),
            SinkArtifact::File(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64, path: Option<&str>) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            size,
            mime: "application/octet-stream".into(),
            path: path.map(Into::into),
        }
    }

    #[test]
    fn sanitize_strips_traversal_and_bad_chars() {
        assert_eq!(
            sanitize_relative_path("../../etc/passwd"),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            sanitize_relative_path("album\\photo:1.jpg"),
            PathBuf::from("album/photo1.jpg")
        );
        assert_eq!(sanitize_relative_path(""), PathBuf::from("file"));
        assert_eq!(sanitize_relative_path("./.."), PathBuf::from("file"));
    }

    #[tokio::test]
    async fn memory_sink_accumulates_and_finalizes() {
        let factory = MemorySinkFactory::new();
        let mut sink = factory.open(&file("a.txt", 10, None)).await.unwrap();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        match sink.finalize().await.unwrap() {
            SinkArtifact::Memory(bytes) => assert_eq!(&bytes[..], b"hello world"),
            other => panic!("unexpected artifact: {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_sink_preserves_folder_structure() {
        let root = std::env::temp_dir().join("meshdrop_test").join("sink_dir");
        let _ = std::fs::remove_dir_all(&root);

        let factory = DirectorySinkFactory::new(&root);
        let mut sink = factory
            .open(&file("photo.jpg", 4, Some("album/photo.jpg")))
            .await
            .unwrap();
        sink.write(&[1, 2, 3, 4]).await.unwrap();
        let artifact = sink.finalize().await.unwrap();

        let path = artifact.as_path().unwrap();
        assert!(path.ends_with("album/photo.jpg"));
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3, 4]);

        let _ = std::fs::remove_dir_all(&root);
    }
}
