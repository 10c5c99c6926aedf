//! Core types, configuration, and placement for MarFS
//!
//! This crate defines the foundational pieces shared by every other layer:
//! - Error: the error taxonomy used across the workspace
//! - Ftag / Post / Restart: per-file identity records carried in xattrs
//! - MarfsConfig: the validated, read-only configuration arena
//!   (namespaces, repos, distribution tables)
//! - Placement: pure computations mapping paths to namespaces, file sizes
//!   to repos, stream ids to reference paths, and objects to
//!   (pod, cap, scatter) locations
//!
//! Nothing in this crate performs I/O against the metadata filesystem or
//! the object store; those concerns live behind the MDAL/DAL traits in
//! `marfs-access`.

#![warn(clippy::all)]

pub mod config;
pub mod distribution;
pub mod error;
pub mod placement;
pub mod tag;

pub use config::{
    parse_size, ConfigLoader, DirectSpec, Erasure, MarfsConfig, Namespace, NsId, Perms, Quota,
    Repo, RepoId, RepoRange,
};
pub use distribution::DistTable;
pub use error::{Error, QuotaKind, Result};
pub use placement::ObjectLocation;
pub use tag::{ConfigVersion, Ftag, ObjectType, Post, Restart, StreamState};
