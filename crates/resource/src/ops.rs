//! Resource operations and accounting records
//!
//! The streamwalker produces chains of [`Operation`]s; the resource log
//! journals them; consumer threads execute them. Chains keep object
//! deletions ahead of reference deletions for the same stream, and a
//! reference-deletion op may batch several members (`file_nos`) that the
//! thread pool is free to split.

use serde::{Deserialize, Serialize};

use marfs_core::tag::Ftag;

/// Operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Delete data objects of a stream
    DeleteObj,
    /// Delete reference files (and their trash pairs)
    DeleteRef,
    /// Rebuild one object
    Rebuild,
    /// Repack a stream (recognized, never executed)
    Repack,
}

impl OpKind {
    /// Display name used in logs and summaries.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::DeleteObj => "DEL-OBJ",
            OpKind::DeleteRef => "DEL-REF",
            OpKind::Rebuild => "REBUILD",
            OpKind::Repack => "REPACK",
        }
    }
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpExtra {
    /// Delete `count` objects starting `offset` past the ftag's object
    DeleteObj {
        /// Skip this many objects past `ftag.obj_no`
        offset: u64,
        /// Number of consecutive objects to delete
        count: u64,
    },
    /// Delete these stream members' reference files
    DeleteRef {
        /// File numbers within the stream
        file_nos: Vec<u64>,
        /// This deletion retires the whole stream
        del_stream: bool,
    },
    /// Verify/rebuild one object, optionally clearing a marker file
    Rebuild {
        /// Object number within the stream
        obj_no: u64,
        /// Reference-dir marker that requested the rebuild
        marker: Option<String>,
    },
    /// Repack these members into a denser object
    Repack {
        /// File numbers within the stream
        file_nos: Vec<u64>,
    },
}

/// One schedulable unit of resource work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation class
    pub kind: OpKind,
    /// Identity of the stream this op targets
    pub ftag: Ftag,
    /// Kind-specific payload
    pub extra: OpExtra,
}

impl Operation {
    /// Stable identity used to pair start and completion records.
    pub fn key(&self) -> String {
        let extra = match &self.extra {
            OpExtra::DeleteObj { offset, count } => format!("o{}+{}", offset, count),
            OpExtra::DeleteRef { file_nos, del_stream } => {
                format!("r{:?}{}", file_nos, if *del_stream { "S" } else { "" })
            }
            OpExtra::Rebuild { obj_no, .. } => format!("b{}", obj_no),
            OpExtra::Repack { file_nos } => format!("p{:?}", file_nos),
        };
        format!("{}|{}|{}", self.kind.name(), self.ftag.stream_id, extra)
    }
}

/// Monotonic counters produced by walking streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkReport {
    /// Live files counted toward quota
    pub fileusage: u64,
    /// Live bytes counted toward quota
    pub byteusage: u64,
    /// All files encountered
    pub filecount: u64,
    /// All objects encountered
    pub objcount: u64,
    /// All bytes encountered
    pub bytecount: u64,
    /// Streams walked
    pub streamcount: u64,
    /// Objects scheduled for deletion
    pub delobjs: u64,
    /// Files scheduled for deletion
    pub delfiles: u64,
    /// Streams fully retired
    pub delstreams: u64,
    /// Files too volatile to judge (active writers)
    pub volfiles: u64,
    /// Files scheduled for repack
    pub rpckfiles: u64,
    /// Bytes scheduled for repack
    pub rpckbytes: u64,
    /// Objects scheduled for rebuild
    pub rbldobjs: u64,
    /// Bytes scheduled for rebuild
    pub rbldbytes: u64,
}

impl WalkReport {
    /// Fold another report into this one.
    pub fn absorb(&mut self, other: &WalkReport) {
        self.fileusage += other.fileusage;
        self.byteusage += other.byteusage;
        self.filecount += other.filecount;
        self.objcount += other.objcount;
        self.bytecount += other.bytecount;
        self.streamcount += other.streamcount;
        self.delobjs += other.delobjs;
        self.delfiles += other.delfiles;
        self.delstreams += other.delstreams;
        self.volfiles += other.volfiles;
        self.rpckfiles += other.rpckfiles;
        self.rpckbytes += other.rpckbytes;
        self.rbldobjs += other.rbldobjs;
        self.rbldbytes += other.rbldbytes;
    }
}

/// Per-class execution tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    /// Object deletions executed
    pub deletion_object_count: u64,
    /// Object deletions failed
    pub deletion_object_failures: u64,
    /// Reference deletions executed
    pub deletion_reference_count: u64,
    /// Reference deletions failed
    pub deletion_reference_failures: u64,
    /// Rebuilds executed
    pub rebuild_count: u64,
    /// Rebuilds failed
    pub rebuild_failures: u64,
    /// Repacks attempted
    pub repack_count: u64,
    /// Repacks failed
    pub repack_failures: u64,
}

impl OperationSummary {
    /// Fold another summary into this one.
    pub fn absorb(&mut self, other: &OperationSummary) {
        self.deletion_object_count += other.deletion_object_count;
        self.deletion_object_failures += other.deletion_object_failures;
        self.deletion_reference_count += other.deletion_reference_count;
        self.deletion_reference_failures += other.deletion_reference_failures;
        self.rebuild_count += other.rebuild_count;
        self.rebuild_failures += other.rebuild_failures;
        self.repack_count += other.repack_count;
        self.repack_failures += other.repack_failures;
    }

    /// Total failed operations.
    pub fn failures(&self) -> u64 {
        self.deletion_object_failures
            + self.deletion_reference_failures
            + self.rebuild_failures
            + self.repack_failures
    }
}
