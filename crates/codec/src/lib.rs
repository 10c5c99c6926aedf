//! Serialization for MarFS persisted records
//!
//! Three record families, each with its own codec:
//!
//! - [`attrs`]: the reserved xattr strings (`marfs_objid`, `marfs_post`,
//!   `marfs_restart`): textual, field-order keyed, version checked
//! - [`chunkinfo`]: fixed-size binary MultiChunkInfo records journaled
//!   into the MD file of a Multi stream, network byte order
//! - [`recovery`]: the recovery-info region sealed into the tail of every
//!   object, parseable both forward and backward
//!
//! Byte-exactness matters only for on-disk compatibility; every codec here
//! guarantees round-trip fidelity, which is what the engine and the tests
//! rely on.

#![warn(clippy::all)]

pub mod attrs;
pub mod chunkinfo;
pub mod recovery;

pub use attrs::{is_reserved_attr, AttrCodec, ATTR_OBJID, ATTR_POST, ATTR_PREFIX, ATTR_RESTART};
pub use chunkinfo::{MultiChunkInfo, CHUNK_INFO_SIZE};
pub use recovery::{
    RecoveryFile, RecoveryHead, REC_BODY_SIZE, REC_TAIL_SIZE, REC_UNI_SIZE,
};
