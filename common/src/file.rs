//! Immutable descriptors of enumerated filesystem entries.

use std::os::unix::fs::MetadataExt;

/// What kind of entry a [`FileEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    #[must_use]
    pub fn of(metadata: &std::fs::Metadata) -> FileKind {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Regular
        }
    }
}

/// One entry captured during snapshot enumeration.
///
/// For non-directories the stored path is rewritten to embed a `/./` marker
/// after the snapshot root, e.g.
/// `/src/.snap/42snapshot7.0/./sub/b.txt`, so that a transfer program running
/// in relative mode (`rsync --relative`) reproduces `sub/b.txt` under the
/// destination root.
///
/// Entries are immutable after creation. During dispatch the path is moved
/// into a worker's argument vector with [`FileEntry::take_path`]; the entry
/// then holds nothing and is never read by the enumerator again.
#[derive(Debug)]
pub struct FileEntry {
    path: std::path::PathBuf,
    size: u64,
    kind: FileKind,
}

impl FileEntry {
    #[must_use]
    pub fn new(
        path: &std::path::Path,
        snap_root: &std::path::Path,
        metadata: &std::fs::Metadata,
    ) -> FileEntry {
        let kind = FileKind::of(metadata);
        let path = if kind == FileKind::Directory {
            path.to_path_buf()
        } else {
            match path.strip_prefix(snap_root) {
                Ok(relative) => snap_root.join(".").join(relative),
                Err(_) => path.to_path_buf(),
            }
        };
        FileEntry {
            path,
            size: metadata.size(),
            kind,
        }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Bytes this entry contributes to an argument vector.
    #[must_use]
    pub fn arg_len(&self) -> usize {
        self.path.as_os_str().len()
    }

    /// Bytes this entry contributes to transfer totals. Symlinks carry no
    /// payload.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        match self.kind {
            FileKind::Regular => self.size,
            FileKind::Directory | FileKind::Symlink => 0,
        }
    }

    /// Move the path out of the entry and into a worker's batch.
    #[must_use]
    pub fn take_path(&mut self) -> std::path::PathBuf {
        std::mem::take(&mut self.path)
    }

    /// Put a path back, undoing [`FileEntry::take_path`] when a dispatch pass
    /// has to be restarted.
    pub fn put_path(&mut self, path: std::path::PathBuf) {
        self.path = path;
    }

    /// True once the path has been consumed into a completed batch.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.path.as_os_str().is_empty()
    }
}
