//! Trash/GC and resource management for MarFS
//!
//! A coherent namespace-wide walk identifies files and chunks eligible
//! for deletion, rebuild, repack, or quota accounting; work is
//! partitioned across worker ranks; and a durable operation log makes
//! the walk restartable and replayable.
//!
//! Component map:
//!
//! - [`ops`]: typed operation chains and the accounting records
//! - [`log`]: the append-only, crash-safe per-rank journal
//! - [`summary`]: the iteration summary mirroring program arguments
//! - [`walker`]: the per-stream classifier
//! - [`exec`]: idempotent operation execution
//! - [`input`] / [`threads`]: the per-rank producer/consumer pool
//! - [`manager`]: rank-0 dispatch, old-log pickup, and the quota
//!   post-pass

#![warn(clippy::all)]

pub mod exec;
pub mod input;
pub mod log;
pub mod manager;
pub mod ops;
pub mod summary;
pub mod threads;
pub mod walker;

pub use log::{LogMode, ResourceLog};
pub use manager::{default_iteration, resolve_thresholds, RmanConfig, RunOutcome};
pub use ops::{OpExtra, OpKind, Operation, OperationSummary, WalkReport};
pub use summary::RunArgs;
pub use threads::{GlobalState, PoolConfig, ThreadPool};
pub use walker::{RebuildLoc, StreamWalker, Thresholds};
