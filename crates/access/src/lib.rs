//! Abstraction layers between the MarFS core and its storage
//!
//! Two narrow capability sets:
//!
//! - [`mdal`]: the Metadata Abstraction Layer: operations on reference
//!   paths inside the MDFS, a reference-directory scanner, and the per-
//!   namespace usage counters the resource manager writes back.
//! - [`dal`]: the Data Abstraction Layer: streaming access to located
//!   objects, with abort/sync/close semantics the datastream engine
//!   depends on.
//!
//! Both ship a POSIX-backed reference implementation rooted in an ordinary
//! directory tree, which is what the single-process test harness drives.
//! Contexts are cheap; every thread creates its own rather than sharing.

#![warn(clippy::all)]

pub mod dal;
pub mod mdal;

pub use dal::{Dal, DalHandle, DalMode, ObjectTarget, PosixDal};
pub use mdal::{
    FileStat, Mdal, MdHandle, PosixMdal, RefEntryKind, RefScanner, ScanEntry, Usage,
};
