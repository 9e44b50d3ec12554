//! Transfer manifest: the immutable file list declared before any bytes move.
//!
//! Binary frames carry no inline header, so the receiver locates the file a
//! byte belongs to purely by how much it has received relative to the
//! cumulative file sizes declared here. The manifest is therefore frozen the
//! moment a transfer starts.

use serde::{Deserialize, Serialize};

/// Descriptor of a single file in a transfer.
///
/// Immutable once the transfer starts. `path` preserves folder structure
/// relative to the transfer root, when the caller selected a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// MIME type as reported by the caller.
    #[serde(rename = "type")]
    pub mime: String,
    /// Relative path for folder transfers, forward-slash separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl FileDescriptor {
    /// Stable file identity used for resume bookkeeping: `name-size`.
    pub fn file_id(&self) -> String {
        format!("{}-{}", self.name, self.size)
    }
}

/// The declared file list for one transfer, with cumulative-offset lookup.
#[derive(Debug, Clone)]
pub struct TransferManifest {
    pub files: Vec<FileDescriptor>,
}

impl TransferManifest {
    pub fn new(files: Vec<FileDescriptor>) -> Self {
        Self { files }
    }

    /// Sum of all declared file sizes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Locate the file a given cumulative byte position falls into.
    ///
    /// Returns `(file index, offset within that file)`. A position equal to
    /// the end of file `i` resolves to the start of file `i + 1`; a position
    /// at or past the total size returns `None`.
    pub fn locate(&self, position: u64) -> Option<(usize, u64)> {
        let mut base = 0u64;
        for (idx, file) in self.files.iter().enumerate() {
            if position < base + file.size {
                return Some((idx, position - base));
            }
            base += file.size;
        }
        // Zero-length files at the tail still need a home for position == base.
        if position == base {
            self.files
                .iter()
                .enumerate()
                .rev()
                .find(|(_, f)| f.size == 0)
                .map(|(idx, _)| (idx, 0))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            size,
            mime: "application/octet-stream".into(),
            path: None,
        }
    }

    #[test]
    fn file_id_is_name_and_size() {
        assert_eq!(file("a.txt", 100).file_id(), "a.txt-100");
    }

    #[test]
    fn locate_maps_cumulative_positions() {
        let m = TransferManifest::new(vec![file("a", 100), file("b", 50)]);
        assert_eq!(m.total_size(), 150);
        assert_eq!(m.locate(0), Some((0, 0)));
        assert_eq!(m.locate(99), Some((0, 99)));
        assert_eq!(m.locate(100), Some((1, 0)));
        assert_eq!(m.locate(149), Some((1, 49)));
        assert_eq!(m.locate(150), None);
    }

    #[test]
    fn descriptor_roundtrips_with_wire_names() {
        let f = FileDescriptor {
            name: "photo.jpg".into(),
            size: 1234,
            mime: "image/jpeg".into(),
            path: Some("album/photo.jpg".into()),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"type\":\"image/jpeg\""));
        let back: FileDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
