//! Streamwalker: classify one datastream into operations
//!
//! Given the head reference file of a stream, the walker visits every
//! member in file order and yields operation chains: garbage collection
//! (object deletions followed by reference deletions), rebuilds, or
//! repacks, or nothing for live files, which are instead accumulated
//! into the usage report returned at close.
//!
//! Packed streams are judged as a whole: a deleted member inside an
//! object shared with live files only updates reference accounting; the
//! object is reclaimed once every member is deleted and past threshold.

use std::collections::VecDeque;
use std::path::Path;

use tracing::{debug, warn};

use marfs_access::dal::ObjectTarget;
use marfs_access::mdal::{RefEntryKind, ScanEntry};
use marfs_core::config::NsId;
use marfs_core::error::{Error, Result};
use marfs_core::placement::ObjectLocation;
use marfs_core::tag::{Ftag, ObjectType, StreamState};
use marfs_datastream::{load_tags, paths, trash_pointer, MarfsContext};

use crate::ops::{OpExtra, OpKind, Operation, WalkReport};

/// Epoch-second cutoffs per operation class; `None` disables the class.
/// A file qualifies when its relevant timestamp is at or before the
/// cutoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    /// Garbage collection of deleted files
    pub gc: Option<i64>,
    /// Rebuild candidates
    pub rebuild: Option<i64>,
    /// Repack candidates
    pub repack: Option<i64>,
    /// Cleanup of zombie references
    pub cleanup: Option<i64>,
}

/// Location filter for location-based rebuilds; `None` components match
/// anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildLoc {
    /// Pod to match
    pub pod: Option<usize>,
    /// Cap to match
    pub cap: Option<usize>,
    /// Scatter to match
    pub scatter: Option<usize>,
}

impl RebuildLoc {
    /// True when `loc` matches every present component.
    pub fn matches(&self, loc: ObjectLocation) -> bool {
        self.pod.map_or(true, |p| p == loc.pod)
            && self.cap.map_or(true, |c| c == loc.cap)
            && self.scatter.map_or(true, |s| s == loc.scatter)
    }
}

struct PackedMember {
    file_no: u64,
    expired: bool,
    live_bytes: u64,
}

/// Iterator over one datastream.
pub struct StreamWalker<'a> {
    ctx: &'a MarfsContext,
    ns: NsId,
    stream_id: String,
    thresholds: Thresholds,
    rebuild_loc: Option<RebuildLoc>,
    next_file: u64,
    exhausted: bool,
    pending: VecDeque<Vec<Operation>>,
    packed_members: Vec<PackedMember>,
    packed_ftag: Option<Ftag>,
    report: WalkReport,
}

impl<'a> StreamWalker<'a> {
    /// Open a walker on the stream whose head file is `head_name`.
    pub fn open(
        ctx: &'a MarfsContext,
        ns: NsId,
        head_name: &str,
        thresholds: Thresholds,
        rebuild_loc: Option<RebuildLoc>,
    ) -> Result<StreamWalker<'a>> {
        let stream_id = head_name
            .strip_prefix(marfs_access::mdal::REF_STREAM_PREFIX)
            .and_then(|rest| rest.rsplit_once('.'))
            .map(|(id, _)| id.to_string())
            .ok_or_else(|| {
                Error::integrity(format!("\"{}\" is not a stream head", head_name))
            })?;

        let mut report = WalkReport::default();
        report.streamcount = 1;

        Ok(StreamWalker {
            ctx,
            ns,
            stream_id,
            thresholds,
            rebuild_loc,
            next_file: 0,
            exhausted: false,
            pending: VecDeque::new(),
            packed_members: Vec::new(),
            packed_ftag: None,
            report,
        })
    }

    /// Yield the next operation chain, or `None` once the stream is
    /// fully classified.
    pub fn iterate(&mut self) -> Result<Option<Vec<Operation>>> {
        loop {
            if let Some(chain) = self.pending.pop_front() {
                return Ok(Some(chain));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.step()?;
        }
    }

    /// Close the walker, returning the accumulated report.
    pub fn close(self) -> WalkReport {
        self.report
    }

    fn step(&mut self) -> Result<()> {
        let file_no = self.next_file;
        self.next_file += 1;

        let ref_path = paths::ref_file(&self.ctx.config, self.ns, &self.stream_id, file_no);
        let stat = match self.ctx.mdal.stat(&ref_path) {
            Ok(stat) => stat,
            Err(e) if e.is_not_found() => {
                self.exhausted = true;
                self.finish_packed();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let tags = load_tags(self.ctx, &ref_path)?;
        let ftag = match tags.ftag {
            Some(ftag) => ftag,
            None => {
                // a trashed file leaves only RESTART and a pointer to
                // its trash pair behind; the pair holds the identity
                // records GC needs
                if tags.restart.is_some() {
                    if let Some(trash) = trash_pointer(self.ctx, &ref_path)? {
                        return self.judge_trashed(&trash, stat.mtime, file_no);
                    }
                }
                // zombie reference: an interrupted create or an orphaned
                // tombstone
                if self
                    .thresholds
                    .cleanup
                    .map_or(false, |cutoff| stat.mtime <= cutoff)
                {
                    let ftag = self.zombie_ftag(file_no);
                    self.report.delfiles += 1;
                    if file_no == 0 {
                        self.report.delstreams += 1;
                    }
                    self.pending.push_back(vec![Operation {
                        kind: OpKind::DeleteRef,
                        ftag,
                        extra: OpExtra::DeleteRef {
                            file_nos: vec![file_no],
                            del_stream: file_no == 0,
                        },
                    }]);
                } else {
                    self.report.volfiles += 1;
                }
                return Ok(());
            }
        };

        let post = tags.post;
        let packed = post
            .as_ref()
            .map(|p| p.obj_type == ObjectType::Packed)
            .unwrap_or(false);
        if packed && self.packed_ftag.is_none() {
            self.packed_ftag = Some(ftag.clone());
        }

        self.report.filecount += 1;

        if tags.restart.is_some() && !ftag.state.finalized {
            // a writer may still be active; never judge these
            self.report.volfiles += 1;
            return Ok(());
        }

        // live file
        let size = stat.size;
        let chunks = post.as_ref().map(|p| p.chunks).unwrap_or(0);
        self.report.fileusage += 1;
        self.report.byteusage += size;
        self.report.bytecount += size;
        if packed {
            if file_no == 0 {
                self.report.objcount += 1;
            }
            self.packed_members.push(PackedMember { file_no, expired: false, live_bytes: size });
        } else {
            self.report.objcount += chunks;
            self.maybe_rebuild(&ftag, chunks, &ref_path)?;
        }
        Ok(())
    }

    /// Classify a tombstoned member through its trash pair. The pair
    /// carries the deleted-marked identity and layout records; the
    /// reference file's mtime is the deletion time GC measures against.
    fn judge_trashed(&mut self, trash: &Path, dtime: i64, file_no: u64) -> Result<()> {
        let tags = load_tags(self.ctx, trash)?;
        let ftag = match tags.ftag {
            Some(ftag) => ftag,
            None => {
                // the pair has vanished; the cleanup threshold reaps the
                // leftover tombstone
                self.report.volfiles += 1;
                return Ok(());
            }
        };
        let post = tags.post;

        self.report.filecount += 1;
        let expired = self.thresholds.gc.map_or(false, |cutoff| dtime <= cutoff);

        let packed = post
            .as_ref()
            .map(|p| p.obj_type == ObjectType::Packed)
            .unwrap_or(false);
        if packed {
            if self.packed_ftag.is_none() {
                self.packed_ftag = Some(ftag);
            }
            self.packed_members.push(PackedMember { file_no, expired, live_bytes: 0 });
            return Ok(());
        }

        if expired {
            let objects = post.as_ref().map(|p| p.chunks).unwrap_or(1);
            let mut chain = Vec::new();
            if objects > 0 {
                self.report.delobjs += objects;
                chain.push(Operation {
                    kind: OpKind::DeleteObj,
                    ftag: ftag.clone(),
                    extra: OpExtra::DeleteObj { offset: 0, count: objects },
                });
            }
            self.report.delfiles += 1;
            self.report.delstreams += 1;
            chain.push(Operation {
                kind: OpKind::DeleteRef,
                ftag,
                extra: OpExtra::DeleteRef { file_nos: vec![file_no], del_stream: true },
            });
            self.pending.push_back(chain);
        }
        // deleted but within threshold: left for a later run
        Ok(())
    }

    /// Location-based rebuild checks for every object of a live file.
    fn maybe_rebuild(&mut self, ftag: &Ftag, chunks: u64, ref_path: &Path) -> Result<()> {
        let (Some(_cutoff), Some(loc)) = (self.thresholds.rebuild, self.rebuild_loc) else {
            return Ok(());
        };
        for obj in 0..chunks {
            let target = ObjectTarget::for_ftag(&self.ctx.config, ftag, obj)?;
            if loc.matches(target.location) {
                debug!(stream = %ftag.stream_id, obj, path = %ref_path.display(), "location rebuild candidate");
                self.report.rbldobjs += 1;
                self.report.rbldbytes += ftag.chunk_size;
                self.pending.push_back(vec![Operation {
                    kind: OpKind::Rebuild,
                    ftag: ftag.clone(),
                    extra: OpExtra::Rebuild { obj_no: obj, marker: None },
                }]);
            }
        }
        Ok(())
    }

    /// Whole-stream judgement for packed layouts, run once the member
    /// list is exhausted.
    fn finish_packed(&mut self) {
        if self.packed_members.is_empty() {
            return;
        }
        let ftag = match &self.packed_ftag {
            Some(f) => f.clone(),
            None => return,
        };

        let all_expired = self.packed_members.iter().all(|m| m.expired);
        if all_expired {
            let file_nos: Vec<u64> = self.packed_members.iter().map(|m| m.file_no).collect();
            self.report.delobjs += 1;
            self.report.delfiles += file_nos.len() as u64;
            self.report.delstreams += 1;
            self.pending.push_back(vec![
                Operation {
                    kind: OpKind::DeleteObj,
                    ftag: ftag.clone(),
                    extra: OpExtra::DeleteObj { offset: 0, count: 1 },
                },
                Operation {
                    kind: OpKind::DeleteRef,
                    ftag,
                    extra: OpExtra::DeleteRef { file_nos, del_stream: true },
                },
            ]);
            return;
        }

        let any_expired = self.packed_members.iter().any(|m| m.expired);
        if any_expired && self.thresholds.repack.is_some() {
            // the object is below full density; surviving members are
            // repack candidates
            let live: Vec<&PackedMember> =
                self.packed_members.iter().filter(|m| !m.expired && m.live_bytes > 0).collect();
            if !live.is_empty() {
                self.report.rpckfiles += live.len() as u64;
                self.report.rpckbytes += live.iter().map(|m| m.live_bytes).sum::<u64>();
                self.pending.push_back(vec![Operation {
                    kind: OpKind::Repack,
                    ftag,
                    extra: OpExtra::Repack {
                        file_nos: live.iter().map(|m| m.file_no).collect(),
                    },
                }]);
            }
        }
    }

    fn zombie_ftag(&self, file_no: u64) -> Ftag {
        Ftag {
            vers: self.ctx.config.version,
            repo: String::new(),
            ns_id: self.ctx.ns(self.ns).id_str.clone(),
            chunk_size: 0,
            recovery_bytes: 0,
            stream_id: self.stream_id.clone(),
            obj_no: 0,
            chunk_no: 0,
            file_no,
            ctime: 0,
            unique: 0,
            state: StreamState::default(),
        }
    }
}

/// Turn a reference-dir marker entry into an operation, honoring the
/// rebuild threshold. Markers newer than the cutoff are skipped rather
/// than errored; repack markers are recognized but produce nothing (the
/// execute path is rejected).
pub fn marker_op(
    ctx: &MarfsContext,
    ref_dir: &Path,
    entry: &ScanEntry,
    thresholds: Thresholds,
) -> Result<Option<Operation>> {
    match entry.kind {
        RefEntryKind::RebuildMarker => {
            let cutoff = match thresholds.rebuild {
                Some(c) => c,
                None => return Ok(None),
            };
            let age = entry.age.unwrap_or(i64::MAX);
            if age > cutoff {
                debug!(marker = %entry.name, "rebuild marker too recent; skipping");
                return Ok(None);
            }
            let marker_path = ref_dir.join(&entry.name);
            let tags = load_tags(ctx, &marker_path)?;
            let ftag = tags.ftag.ok_or_else(|| {
                Error::integrity(format!("rebuild marker \"{}\" has no identity record", entry.name))
            })?;
            Ok(Some(Operation {
                kind: OpKind::Rebuild,
                extra: OpExtra::Rebuild { obj_no: ftag.obj_no, marker: Some(entry.name.clone()) },
                ftag,
            }))
        }
        RefEntryKind::RepackMarker => {
            warn!(marker = %entry.name, "repack marker present; repack execution is not supported");
            Ok(None)
        }
        _ => Ok(None),
    }
}
