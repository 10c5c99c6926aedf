//! Operation execution
//!
//! Consumer threads run every operation through here. Execution is
//! idempotent so journal replay is safe: deleting an absent object or
//! reference succeeds, and rebuilding a healthy object is a no-op.
//! Repack operations are recognized but rejected; the execute path does
//! not exist yet.

use tracing::{debug, warn};

use marfs_access::dal::ObjectTarget;
use marfs_core::error::{Error, Result};
use marfs_datastream::{paths, trash_pointer, MarfsContext};

use crate::ops::{OpExtra, OpKind, Operation, OperationSummary};

/// Execute one operation, updating the summary tallies.
pub fn execute(ctx: &MarfsContext, op: &Operation, summary: &mut OperationSummary) -> Result<()> {
    let result = match (&op.kind, &op.extra) {
        (OpKind::DeleteObj, OpExtra::DeleteObj { offset, count }) => {
            let res = delete_objects(ctx, op, *offset, *count);
            summary.deletion_object_count += count;
            if res.is_err() {
                summary.deletion_object_failures += 1;
            }
            res
        }
        (OpKind::DeleteRef, OpExtra::DeleteRef { file_nos, .. }) => {
            let res = delete_references(ctx, op, file_nos);
            summary.deletion_reference_count += file_nos.len() as u64;
            if res.is_err() {
                summary.deletion_reference_failures += 1;
            }
            res
        }
        (OpKind::Rebuild, OpExtra::Rebuild { obj_no, marker }) => {
            let res = rebuild_object(ctx, op, *obj_no, marker.as_deref());
            summary.rebuild_count += 1;
            if res.is_err() {
                summary.rebuild_failures += 1;
            }
            res
        }
        (OpKind::Repack, _) => {
            summary.repack_count += 1;
            summary.repack_failures += 1;
            Err(Error::integrity("repack execution is not implemented"))
        }
        _ => Err(Error::integrity("operation kind and payload disagree")),
    };
    result
}

fn delete_objects(ctx: &MarfsContext, op: &Operation, offset: u64, count: u64) -> Result<()> {
    for i in 0..count {
        let obj_no = op.ftag.obj_no + offset + i;
        let target = ObjectTarget::for_ftag(&ctx.config, &op.ftag, obj_no)?;
        // absent objects are success: replay must converge
        ctx.dal.delete(&target)?;
        debug!(object = %target.object_name, "deleted object");
    }
    Ok(())
}

fn delete_references(ctx: &MarfsContext, op: &Operation, file_nos: &[u64]) -> Result<()> {
    let ns = ctx
        .config
        .namespace_by_id_str(&op.ftag.ns_id)
        .ok_or_else(|| Error::NotFound(format!("namespace {}", op.ftag.ns_id)))?;

    for file_no in file_nos {
        let ref_path = paths::ref_file(&ctx.config, ns, &op.ftag.stream_id, *file_no);

        // the reference points at its trash pair; both go together
        match trash_pointer(ctx, &ref_path) {
            Ok(Some(trash)) => {
                for victim in [paths::companion_file(&trash), trash] {
                    match ctx.mdal.unlink(&victim) {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(None) => {}
            Err(Error::NotFound(_)) => {
                // replay of an already-deleted reference
                continue;
            }
            Err(e) => {
                warn!(path = %ref_path.display(), error = %e, "unreadable trash pointer");
            }
        }

        match ctx.mdal.unlink(&ref_path) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!(path = %ref_path.display(), "deleted reference");
    }
    Ok(())
}

/// Verify an object's presence; a healthy object is a no-op rebuild.
/// Marker-driven rebuilds clear their marker on success.
fn rebuild_object(
    ctx: &MarfsContext,
    op: &Operation,
    obj_no: u64,
    marker: Option<&str>,
) -> Result<()> {
    let target = ObjectTarget::for_ftag(&ctx.config, &op.ftag, obj_no)?;
    ctx.dal.stat(&target)?;

    if let Some(marker) = marker {
        let ns = ctx
            .config
            .namespace_by_id_str(&op.ftag.ns_id)
            .ok_or_else(|| Error::NotFound(format!("namespace {}", op.ftag.ns_id)))?;
        let marker_path =
            paths::ref_dir(&ctx.config, ns, &op.ftag.stream_id).join(marker);
        match ctx.mdal.unlink(&marker_path) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    debug!(object = %target.object_name, "rebuild verified");
    Ok(())
}

/// After a reference directory has been fully scanned, drop it if it is
/// empty and GC is active. Failure is ignorable: a concurrent create may
/// have repopulated the directory.
pub fn cleanup_refdir(ctx: &MarfsContext, ref_dir: &std::path::Path, gc_active: bool) {
    if !gc_active {
        return;
    }
    if ctx.mdal.rmdir(ref_dir).is_ok() {
        debug!(dir = %ref_dir.display(), "removed empty reference dir");
    }
}
