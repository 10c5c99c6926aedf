//! Data Abstraction Layer
//!
//! The engine reaches the object store exclusively through [`Dal`]. A
//! handle streams one located object in one direction; there is no seek.
//! Discontiguous reads are served by closing the handle and opening a
//! fresh one at the wanted byte range. `sync` guarantees no further I/O
//! errors on the handle; `abort` discards a partially written object.

mod posix;

use std::time::Duration;

pub use posix::PosixDal;

use marfs_core::config::{MarfsConfig, RepoId};
use marfs_core::error::Result;
use marfs_core::placement::ObjectLocation;
use marfs_core::tag::Ftag;

/// Direction of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DalMode {
    /// Streaming write of a fresh object
    Put,
    /// Streaming read of a sealed object
    Get,
}

/// A located object: everything the DAL needs to find the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTarget {
    /// Repo holding the object
    pub repo: RepoId,
    /// Opaque object name
    pub object_name: String,
    /// Resolved (pod, cap, scatter)
    pub location: ObjectLocation,
}

impl ObjectTarget {
    /// Recompute the target for one object of a stream.
    ///
    /// The engine calls this after mutating a handle's object number (the
    /// "update object location" step): the name and the weighted-hash
    /// location both depend on it.
    pub fn for_ftag(config: &MarfsConfig, ftag: &Ftag, obj_no: u64) -> Result<Self> {
        let repo = config
            .repo_by_name(&ftag.repo)
            .ok_or_else(|| marfs_core::error::Error::NotFound(format!("repo {}", ftag.repo)))?;
        let object_name = ftag.object_name(obj_no);
        let location = config.object_location(repo, &object_name);
        Ok(ObjectTarget { repo, object_name, location })
    }
}

/// An open object stream.
pub trait DalHandle: Send {
    /// Append bytes to a PUT handle.
    fn put(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read bytes from a GET handle. Zero means end of range.
    fn get(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Flush written bytes; after success no further I/O error can
    /// surface for them.
    fn sync(&mut self) -> Result<()>;

    /// Discard a partially written object.
    fn abort(self: Box<Self>) -> Result<()>;

    /// Seal (PUT) or release (GET) the handle.
    fn close(self: Box<Self>) -> Result<()>;
}

/// The data capability set.
pub trait Dal: Send + Sync {
    /// Open a handle on the target.
    ///
    /// For GET, `offset` and `content_length` select a byte range
    /// (`None` = to end of object). For PUT both must be zero/None: objects
    /// are written front to back and sealed once.
    fn open(
        &self,
        target: &ObjectTarget,
        mode: DalMode,
        offset: u64,
        content_length: Option<u64>,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn DalHandle>>;

    /// Delete an object. Deleting an absent object is success (GC replays
    /// depend on this).
    fn delete(&self, target: &ObjectTarget) -> Result<()>;

    /// Size of a sealed object, or `NotFound`.
    fn stat(&self, target: &ObjectTarget) -> Result<u64>;
}
