//! # MarFS core
//!
//! A POSIX-like filesystem view over scalable object storage. User files
//! are stored as opaque objects in a backing store; their names, sizes,
//! and object pointers live in a separate metadata filesystem reached
//! through the MDAL. This crate bundles the core:
//!
//! - the datastream engine mapping writes and reads onto Uni / Multi /
//!   Packed / N:1 object layouts, with recovery-info framing and
//!   chunk-info journaling
//! - the trash and resource-manager subsystem: streamwalker
//!   classification, a crash-safe operation journal, and a
//!   manager/worker cluster discipline
//! - the configuration-driven placement model: namespaces, repos,
//!   distribution tables, and reference-tree hashing
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use marfs::{ConfigLoader, DataStream, MarfsContext, PosixDal, PosixMdal, StreamReader};
//!
//! fn main() -> marfs::Result<()> {
//!     let config = Arc::new(ConfigLoader::from_file("marfs.toml".as_ref())?);
//!     let mdal = Arc::new(PosixMdal::new("/var/marfs/mdfs")?);
//!     let dal = Arc::new(PosixDal::new("/var/marfs/objects")?);
//!     let ctx = Arc::new(MarfsContext::new(config, mdal, dal));
//!
//!     let ns = ctx.config.root();
//!     let mut stream = DataStream::create(&ctx, ns, "hello", 0o644, true)?;
//!     stream.write(b"payload")?;
//!     stream.release()?;
//!
//!     let mut reader = StreamReader::open(&ctx, ns, "hello")?;
//!     let mut buf = vec![0u8; reader.len() as usize];
//!     reader.read(&mut buf, 0)?;
//!     Ok(())
//! }
//! ```
//!
//! The VFS callback surface and the raw object-store transports are
//! external collaborators; everything here compiles and tests without
//! them through the POSIX-backed abstraction layers.

pub use marfs_core::{
    parse_size, ConfigLoader, ConfigVersion, DistTable, Erasure, Error, Ftag, MarfsConfig,
    Namespace, NsId, ObjectLocation, ObjectType, Perms, Post, Quota, QuotaKind, Repo, RepoId,
    RepoRange, Restart, Result, StreamState,
};

pub use marfs_codec::recovery;
pub use marfs_codec::{
    is_reserved_attr, AttrCodec, MultiChunkInfo, RecoveryFile, RecoveryHead, ATTR_OBJID,
    ATTR_POST, ATTR_PREFIX, ATTR_RESTART, CHUNK_INFO_SIZE, REC_BODY_SIZE, REC_TAIL_SIZE,
    REC_UNI_SIZE,
};

pub use marfs_access::{
    Dal, DalHandle, DalMode, FileStat, Mdal, MdHandle, ObjectTarget, PosixDal, PosixMdal,
    RefEntryKind, RefScanner, ScanEntry, Usage,
};

pub use marfs_datastream::{
    load_tags, paths, resolve_user_path, trash_pointer, trash_unlink, truncate_to_trash,
    undelete, DataStream, LoadedTags, MarfsContext, ParallelWriter, ReadGate, StreamReader,
};

pub use marfs_resource::{
    default_iteration, resolve_thresholds, LogMode, OpExtra, OpKind, Operation,
    OperationSummary, PoolConfig, RebuildLoc, ResourceLog, RmanConfig, RunArgs, RunOutcome,
    StreamWalker, Thresholds, WalkReport,
};

/// Run a resource-manager iteration; see [`RmanConfig`].
pub use marfs_resource::manager::run as run_resource_manager;
