//! Metadata Abstraction Layer
//!
//! Every path handed to an [`Mdal`] is relative to the layer's own root;
//! namespaces carry their metadata prefix (`Namespace::md_path`), trash
//! prefix, and fsinfo location as relative paths, so composing a full
//! reference path never leaves the abstraction.
//!
//! Reference-directory entries follow a fixed naming scheme the scanner
//! classifies without opening anything:
//!
//! - `str_<streamid>.<fileno>`: a datastream file; `fileno == 0` is the
//!   head of a stream
//! - `rebuild_<object>_<epoch>`: rebuild marker with its creation time
//! - `repack_<streamid>_<epoch>`: repack marker with its creation time
//!
//! Anything else is reported as unknown and left alone.

mod posix;

use std::path::Path;

pub use posix::PosixMdal;

use marfs_core::config::Namespace;
use marfs_core::error::Result;

/// Prefix of datastream reference files.
pub const REF_STREAM_PREFIX: &str = "str_";

/// Prefix of rebuild marker files.
pub const REF_REBUILD_PREFIX: &str = "rebuild_";

/// Prefix of repack marker files.
pub const REF_REPACK_PREFIX: &str = "repack_";

/// Stat summary of an MDFS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Inode number
    pub inode: u64,
    /// Size in bytes
    pub size: u64,
    /// Mode bits
    pub mode: u32,
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// Access time (epoch seconds)
    pub atime: i64,
    /// Modification time (epoch seconds)
    pub mtime: i64,
    /// Change time (epoch seconds)
    pub ctime: i64,
    /// Entry is a symlink
    pub is_symlink: bool,
}

/// Classification of one reference-directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEntryKind {
    /// Head of a datastream (file number zero)
    StreamStart,
    /// Non-head stream file (walked via its stream, never directly)
    StreamFile,
    /// Rebuild marker
    RebuildMarker,
    /// Repack marker
    RepackMarker,
    /// Unrecognized entry
    Unknown,
}

/// One entry yielded by a [`RefScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// Entry name within the reference directory
    pub name: String,
    /// Classification
    pub kind: RefEntryKind,
    /// Marker creation time, for marker kinds
    pub age: Option<i64>,
}

/// Classify a reference-directory entry name.
pub fn classify_entry(name: &str) -> ScanEntry {
    if let Some(rest) = name.strip_prefix(REF_STREAM_PREFIX) {
        let kind = match rest.rsplit_once('.').and_then(|(_, no)| no.parse::<u64>().ok()) {
            Some(0) => RefEntryKind::StreamStart,
            Some(_) => RefEntryKind::StreamFile,
            None => RefEntryKind::Unknown,
        };
        return ScanEntry { name: name.to_string(), kind, age: None };
    }
    for (prefix, kind) in [
        (REF_REBUILD_PREFIX, RefEntryKind::RebuildMarker),
        (REF_REPACK_PREFIX, RefEntryKind::RepackMarker),
    ] {
        if let Some(rest) = name.strip_prefix(prefix) {
            let age = rest.rsplit_once('_').and_then(|(_, ts)| ts.parse::<i64>().ok());
            let kind = if age.is_some() { kind } else { RefEntryKind::Unknown };
            return ScanEntry { name: name.to_string(), kind, age };
        }
    }
    ScanEntry { name: name.to_string(), kind: RefEntryKind::Unknown, age: None }
}

/// Reference file name for a stream member.
pub fn stream_file_name(stream_id: &str, file_no: u64) -> String {
    format!("{}{}.{}", REF_STREAM_PREFIX, stream_id, file_no)
}

/// Per-namespace usage totals recorded in the fsinfo file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    /// Inode (file) count
    pub inodes: u64,
    /// Byte total
    pub bytes: u64,
}

/// An open MD file.
pub trait MdHandle: Send {
    /// Read at the current position.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Write at the current position.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    /// Reposition.
    fn seek(&mut self, pos: u64) -> Result<()>;
    /// Truncate or extend to `len`.
    fn set_len(&mut self, len: u64) -> Result<()>;
    /// Current size.
    fn len(&self) -> Result<u64>;
    /// Flush to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// Single-threaded iterator over one reference directory.
///
/// Instances are cheap; create one per thread rather than sharing.
pub trait RefScanner: Send {
    /// Next classified entry, or `None` at end of directory.
    fn next_entry(&mut self) -> Result<Option<ScanEntry>>;
}

/// The metadata capability set.
pub trait Mdal: Send + Sync {
    /// Create a new MD file (parents included) and open it for writing.
    fn create(&self, path: &Path, mode: u32) -> Result<Box<dyn MdHandle>>;

    /// Open an existing MD file.
    fn open(&self, path: &Path, write: bool) -> Result<Box<dyn MdHandle>>;

    /// Stat an entry without following symlinks.
    fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Remove an MD file (and any attribute sidecar).
    fn unlink(&self, path: &Path) -> Result<()>;

    /// Move an MD file (with its attribute sidecar), creating target
    /// parents as needed.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create a directory chain.
    fn mkdir_all(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> Result<()>;

    /// Create a symlink at `path` pointing at `target`.
    fn symlink(&self, target: &str, path: &Path) -> Result<()>;

    /// Read a symlink's target.
    fn read_link(&self, path: &Path) -> Result<String>;

    /// Set access and modification times.
    fn set_times(&self, path: &Path, atime: i64, mtime: i64) -> Result<()>;

    /// Set mode bits.
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;

    /// Fetch one extended attribute.
    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<String>>;

    /// Install one extended attribute.
    fn set_xattr(&self, path: &Path, name: &str, value: &str) -> Result<()>;

    /// Drop one extended attribute; absent is success.
    fn remove_xattr(&self, path: &Path, name: &str) -> Result<()>;

    /// Names of all extended attributes.
    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>>;

    /// Open a scanner over one reference directory. A missing directory
    /// yields an empty scan, not an error.
    fn scan(&self, dir: &Path) -> Result<Box<dyn RefScanner>>;

    /// Current usage counters of a namespace.
    fn usage(&self, ns: &Namespace) -> Result<Usage>;

    /// Record the inode count for a namespace.
    fn set_inode_usage(&self, ns: &Namespace, inodes: u64) -> Result<()>;

    /// Record the byte total for a namespace.
    fn set_data_usage(&self, ns: &Namespace, bytes: u64) -> Result<()>;

    /// Create the namespace's metadata root and trash scatter tree.
    ///
    /// The top-level trash root itself is operator-owned; this only
    /// populates the per-namespace shard beneath it.
    fn ensure_namespace(&self, ns: &Namespace) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stream_head() {
        let e = classify_entry("str_000000000000002a.0000000065000000.0.0");
        assert_eq!(e.kind, RefEntryKind::StreamStart);
    }

    #[test]
    fn test_classify_stream_member() {
        let e = classify_entry("str_000000000000002a.0000000065000000.0.3");
        assert_eq!(e.kind, RefEntryKind::StreamFile);
    }

    #[test]
    fn test_classify_rebuild_marker() {
        let e = classify_entry("rebuild_main#root.stream.0.4_1700000000");
        assert_eq!(e.kind, RefEntryKind::RebuildMarker);
        assert_eq!(e.age, Some(1700000000));
    }

    #[test]
    fn test_classify_repack_marker() {
        let e = classify_entry("repack_streamid_1700000555");
        assert_eq!(e.kind, RefEntryKind::RepackMarker);
        assert_eq!(e.age, Some(1700000555));
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify_entry("lost+found").kind, RefEntryKind::Unknown);
        assert_eq!(classify_entry("rebuild_nodigits").kind, RefEntryKind::Unknown);
        assert_eq!(classify_entry("str_notanumber.x").kind, RefEntryKind::Unknown);
    }

    #[test]
    fn test_stream_file_name_round_trip() {
        let name = stream_file_name("00aa.00bb.1", 0);
        assert_eq!(classify_entry(&name).kind, RefEntryKind::StreamStart);
        let name = stream_file_name("00aa.00bb.1", 7);
        assert_eq!(classify_entry(&name).kind, RefEntryKind::StreamFile);
    }
}
