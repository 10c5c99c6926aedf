//! Per-file identity records
//!
//! Every MarFS file carries its identity in reserved extended attributes:
//! the [`Ftag`] (written as the `marfs_objid` xattr) pins the file to a
//! repo, stream, and object position; the [`Post`] record (`marfs_post`)
//! describes the finalized layout; [`Restart`] (`marfs_restart`) marks an
//! incomplete write. The string codecs for these records live in
//! `marfs-codec`; this module only defines the typed values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Configuration version carried by every persisted record.
///
/// Parsers must reject records whose version does not match the running
/// config, so objects are always interpreted with the parameters that were
/// in effect when they were stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigVersion {
    /// Major version; bumped for incompatible layout changes
    pub major: u32,
    /// Minor version; bumped for compatible additions
    pub minor: u32,
}

impl ConfigVersion {
    /// Construct a version pair.
    pub fn new(major: u32, minor: u32) -> Self {
        ConfigVersion { major, minor }
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Object-layout variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// One object holds the whole file
    Uni,
    /// The file spans multiple chunk objects
    Multi,
    /// Many small files share one object
    Packed,
    /// Many writers fill independent chunks of one file
    Nto1,
}

impl ObjectType {
    /// Stable single-character code used by the xattr codecs.
    pub fn code(self) -> char {
        match self {
            ObjectType::Uni => 'U',
            ObjectType::Multi => 'M',
            ObjectType::Packed => 'P',
            ObjectType::Nto1 => 'N',
        }
    }

    /// Inverse of [`ObjectType::code`].
    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'U' => Some(ObjectType::Uni),
            'M' => Some(ObjectType::Multi),
            'P' => Some(ObjectType::Packed),
            'N' => Some(ObjectType::Nto1),
            _ => None,
        }
    }
}

/// Lifecycle flags of a datastream file.
///
/// `writing` and `finalized` are mutually exclusive after release; `sized`
/// indicates the logical size is authoritative; `deleted` marks a file
/// awaiting garbage collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// A writer holds this file open
    pub writing: bool,
    /// Release completed; layout is immutable
    pub finalized: bool,
    /// Logical size is recorded and trustworthy
    pub sized: bool,
    /// Unlinked / truncated away; awaiting GC
    pub deleted: bool,
}

impl StreamState {
    /// State installed at create time.
    pub fn writing() -> Self {
        StreamState { writing: true, ..Default::default() }
    }

    /// State installed by a successful release.
    pub fn finalized() -> Self {
        StreamState { finalized: true, sized: true, ..Default::default() }
    }
}

/// Per-file-per-chunk identity (the `marfs_objid` payload).
///
/// Invariant: once installed, an Ftag is never rewritten for the same
/// `(stream_id, chunk_no)` except by truncate-to-zero, which detaches the
/// old stream to trash and starts a fresh one (bumping `unique` if the new
/// object id would collide with the trashed one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ftag {
    /// Config version in effect when the stream was created
    pub vers: ConfigVersion,
    /// Name of the repo holding the data objects
    pub repo: String,
    /// Id string of the owning namespace
    pub ns_id: String,
    /// Chunk size pinned at stream creation (bytes, including recovery)
    pub chunk_size: u64,
    /// Recovery-info bytes consumed per chunk
    pub recovery_bytes: u64,
    /// Storage stream identity, derived from (inode, ctime, unique)
    pub stream_id: String,
    /// Object number within the stream
    pub obj_no: u64,
    /// Chunk number within the object
    pub chunk_no: u64,
    /// File number within the object (packed layouts)
    pub file_no: u64,
    /// Object-creation ctime (epoch seconds)
    pub ctime: i64,
    /// Collision counter for same-second recreates
    pub unique: u64,
    /// Lifecycle flags
    pub state: StreamState,
}

impl Ftag {
    /// Derive the stream id for a fresh stream.
    pub fn make_stream_id(inode: u64, ctime: i64, unique: u64) -> String {
        format!("{:016x}.{:016x}.{}", inode, ctime as u64, unique)
    }

    /// Opaque object name for a given object number of this stream.
    ///
    /// Namespace separators are escaped so the name is safe as a single
    /// path component in any backing store.
    pub fn object_name(&self, obj_no: u64) -> String {
        let ns = self.ns_id.replace('/', "#");
        format!("{}.{}.{}.{}", ns, self.stream_id, self.unique, obj_no)
    }

    /// User-data capacity of one chunk object.
    pub fn data_per_chunk(&self) -> u64 {
        self.chunk_size.saturating_sub(self.recovery_bytes)
    }
}

/// Finalized-layout record (the `marfs_post` payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Config version, matched against the running config at parse
    pub vers: ConfigVersion,
    /// Final layout variant
    pub obj_type: ObjectType,
    /// Byte offset of this file within its object (packed layouts)
    pub obj_offset: u64,
    /// Number of chunk objects
    pub chunks: u64,
    /// Total bytes of chunk-info records in the MD file
    pub chunk_info_bytes: u64,
    /// Correctness-info tag (checksum method marker)
    pub correct_info: u64,
    /// Encryption-info tag (opaque to the core)
    pub encrypt_info: u64,
    /// Entry has been moved to the trash
    pub trash: bool,
}

impl Post {
    /// A fresh Uni-layout record.
    pub fn new(vers: ConfigVersion) -> Self {
        Post {
            vers,
            obj_type: ObjectType::Uni,
            obj_offset: 0,
            chunks: 1,
            chunk_info_bytes: 0,
            correct_info: 0,
            encrypt_info: 0,
            trash: false,
        }
    }
}

/// Write-incomplete marker (the `marfs_restart` payload).
///
/// Carries the mode bits to restore at release: writers may need the MD
/// file held permissive during the write and a stricter mode reinstated
/// afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restart {
    /// Saved mode bits, if the caller requested a restore
    pub mode: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ftag() -> Ftag {
        Ftag {
            vers: ConfigVersion::new(1, 0),
            repo: "main".to_string(),
            ns_id: "main|root".to_string(),
            chunk_size: 1024,
            recovery_bytes: 128,
            stream_id: Ftag::make_stream_id(42, 1700000000, 0),
            obj_no: 0,
            chunk_no: 0,
            file_no: 0,
            ctime: 1700000000,
            unique: 0,
            state: StreamState::writing(),
        }
    }

    #[test]
    fn test_stream_id_is_stable() {
        let a = Ftag::make_stream_id(42, 1700000000, 0);
        let b = Ftag::make_stream_id(42, 1700000000, 0);
        assert_eq!(a, b);

        // a same-second recreate must differ via the unique counter
        let c = Ftag::make_stream_id(42, 1700000000, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn test_object_name_escapes_namespace() {
        let mut ftag = sample_ftag();
        ftag.ns_id = "main|root/sub".to_string();
        let name = ftag.object_name(3);
        assert!(!name.contains('/'));
        assert!(name.ends_with(".3"));
    }

    #[test]
    fn test_data_per_chunk() {
        let ftag = sample_ftag();
        assert_eq!(ftag.data_per_chunk(), 1024 - 128);
    }

    #[test]
    fn test_object_type_codes_round_trip() {
        for ty in [ObjectType::Uni, ObjectType::Multi, ObjectType::Packed, ObjectType::Nto1] {
            assert_eq!(ObjectType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(ObjectType::from_code('X'), None);
    }

    #[test]
    fn test_stream_state_constructors() {
        let w = StreamState::writing();
        assert!(w.writing && !w.finalized);
        let f = StreamState::finalized();
        assert!(f.finalized && f.sized && !f.writing);
    }
}
