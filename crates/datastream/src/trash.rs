//! Trash and companion handling
//!
//! Unlink and truncate-to-zero never destroy metadata directly. The MD
//! content and reserved xattrs move to an entry in the namespace's trash
//! scatter tree, and a sibling `.path` companion records the original
//! MDFS path. The reference file is stripped down to a tombstone:
//! RESTART set, no PRE, its content replaced with the trash-entry path.
//! Racing readers fail cleanly instead of chasing detached objects, and
//! the streamwalker follows the pointer to the trash pair (which carries
//! the identity records) to garbage-collect the objects once the
//! threshold passes.
//!
//! Undelete inverts the move: content and xattrs come back from the
//! trash entry, the user link is re-created, and the trash pair is
//! removed.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use marfs_codec::attrs::AttrCodec;
use marfs_codec::{ATTR_OBJID, ATTR_POST, ATTR_RESTART};
use marfs_core::config::NsId;
use marfs_core::error::{Error, Result};
use marfs_core::tag::{Post, Restart};

use crate::paths;
use crate::stream::load_tags;
use crate::MarfsContext;

const COPY_BUF: usize = 64 * 1024;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Remove a user file.
///
/// Files without an identity record (direct files, plain entries) are
/// simply unlinked. Everything else goes through the trash primitive
/// first, then the user-visible entry disappears.
pub fn trash_unlink(ctx: &MarfsContext, ns: NsId, rel_path: &str) -> Result<()> {
    let user = paths::user_file(&ctx.config, ns, rel_path);
    let stat = ctx.mdal.stat(&user)?;

    if !stat.is_symlink {
        // plain MD entry living directly in the user tree
        return ctx.mdal.unlink(&user);
    }

    let ref_path = PathBuf::from(ctx.mdal.read_link(&user)?);
    let tags = load_tags(ctx, &ref_path)?;
    if tags.ftag.is_none() {
        // no identity: user bytes (if any) live in the MD file itself
        ctx.mdal.unlink(&ref_path)?;
        return ctx.mdal.unlink(&user);
    }

    truncate_to_trash(ctx, ns, &ref_path, rel_path)?;
    ctx.mdal.unlink(&user)?;
    debug!(path = rel_path, "unlinked to trash");
    Ok(())
}

/// The truncate-to-trash primitive.
///
/// Copies the MD content (up to the chunk-info extent) and all reserved
/// xattrs onto a new trash entry with POST marked TRASH, writes the
/// `.path` companion, stamps the trash entry `atime = now, mtime =
/// original atime`, and strips the reference file to its tombstone
/// state (RESTART, no PRE). Returns the trash entry path.
pub fn truncate_to_trash(
    ctx: &MarfsContext,
    ns: NsId,
    ref_path: &Path,
    rel_path: &str,
) -> Result<PathBuf> {
    let tags = load_tags(ctx, ref_path)?;
    let mut ftag = tags
        .ftag
        .ok_or_else(|| Error::integrity("trash of a file with no identity record"))?;
    let post = tags.post.unwrap_or_else(|| {
        // mid-write streams have no published layout yet
        Post::new(ctx.config.version)
    });
    let stat = ctx.mdal.stat(ref_path)?;

    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let deletion_time = now_secs();
    let trash = paths::trash_file(&ctx.config, ns, basename, stat.inode, deletion_time);

    if stat.is_symlink {
        let target = ctx.mdal.read_link(ref_path)?;
        ctx.mdal.symlink(&target, &trash)?;
    } else {
        copy_md_content(ctx, ref_path, &trash, &post, stat.size)?;
    }

    // reserved xattrs travel with the entry; POST gains the TRASH flag
    // and the identity record is marked deleted so the pair is
    // self-describing for GC
    ftag.state.deleted = true;
    let mut trash_post = post.clone();
    trash_post.trash = true;
    ctx.mdal.set_xattr(&trash, ATTR_OBJID, &ftag.encode())?;
    ctx.mdal.set_xattr(&trash, ATTR_POST, &trash_post.encode())?;
    if let Some(restart) = &tags.restart {
        ctx.mdal.set_xattr(&trash, ATTR_RESTART, &restart.encode())?;
    }

    let user = paths::user_file(&ctx.config, ns, rel_path);
    let companion = paths::companion_file(&trash);
    write_all(ctx, &companion, user.to_string_lossy().as_bytes())?;

    if !stat.is_symlink {
        ctx.mdal.set_times(&trash, now_secs(), stat.atime)?;
    }

    // strip the original to RESTART with no PRE, pointing at its trash
    // pair; concurrent reads now fail cleanly, and the content rewrite
    // stamps the mtime GC reads as the deletion time
    ctx.mdal.remove_xattr(ref_path, ATTR_OBJID)?;
    ctx.mdal.remove_xattr(ref_path, ATTR_POST)?;
    let marker = Restart { mode: tags.restart.as_ref().and_then(|r| r.mode) };
    ctx.mdal.set_xattr(ref_path, ATTR_RESTART, &marker.encode())?;
    let mut md = ctx.mdal.open(ref_path, true)?;
    md.set_len(0)?;
    let bytes = trash.to_string_lossy().into_owned().into_bytes();
    let mut written = 0;
    while written < bytes.len() {
        written += md.write(&bytes[written..])?;
    }
    md.sync()?;

    debug!(entry = %trash.display(), "trashed metadata");
    Ok(trash)
}

/// Restore a trashed file to its companion-recorded path.
pub fn undelete(ctx: &MarfsContext, ns: NsId, trash_entry: &Path) -> Result<()> {
    let companion = paths::companion_file(trash_entry);
    let user_path = PathBuf::from(read_all_string(ctx, &companion)?);

    let tags = load_tags(ctx, trash_entry)?;
    let mut ftag = tags
        .ftag
        .ok_or_else(|| Error::integrity("trash entry lacks an identity record"))?;
    let mut post = tags
        .post
        .ok_or_else(|| Error::integrity("trash entry lacks a layout record"))?;
    let trash_stat = ctx.mdal.stat(trash_entry)?;

    ftag.state.deleted = false;
    post.trash = false;

    // the reference file is still in place (GC has not run); restore its
    // content and records
    let ref_path = paths::ref_file(&ctx.config, ns, &ftag.stream_id, ftag.file_no);
    copy_md_content(ctx, trash_entry, &ref_path, &post, trash_stat.size)?;
    ctx.mdal.set_xattr(&ref_path, ATTR_OBJID, &ftag.encode())?;
    ctx.mdal.set_xattr(&ref_path, ATTR_POST, &post.encode())?;
    // the tombstone RESTART ends with the restore
    ctx.mdal.remove_xattr(&ref_path, ATTR_RESTART)?;

    // trash mtime preserved the original atime
    ctx.mdal.set_times(&ref_path, trash_stat.mtime, now_secs())?;

    match ctx.mdal.unlink(&user_path) {
        Ok(()) | Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    ctx.mdal.symlink(&ref_path.to_string_lossy(), &user_path)?;

    ctx.mdal.unlink(trash_entry)?;
    ctx.mdal.unlink(&companion)?;
    debug!(path = %user_path.display(), "undeleted");
    Ok(())
}

/// Copy chunk-info content (`min(chunk_info_bytes, size)` bytes) and
/// re-truncate the target to the source's logical size.
fn copy_md_content(
    ctx: &MarfsContext,
    from: &Path,
    to: &Path,
    post: &Post,
    logical_size: u64,
) -> Result<()> {
    let phy_size = post.chunk_info_bytes.min(logical_size);

    if ctx.mdal.stat(to).is_err() {
        let handle = ctx.mdal.create(to, 0o600)?;
        drop(handle);
    }
    let mut src = ctx.mdal.open(from, false)?;
    let mut dst = ctx.mdal.open(to, true)?;
    dst.set_len(0)?;

    let mut remaining = phy_size;
    let mut buf = vec![0u8; COPY_BUF];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            written += dst.write(&buf[written..n])?;
        }
        remaining -= n as u64;
    }

    dst.set_len(logical_size)?;
    dst.sync()?;
    Ok(())
}

fn write_all(ctx: &MarfsContext, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut handle = ctx.mdal.create(path, 0o600)?;
    let mut written = 0;
    while written < bytes.len() {
        written += handle.write(&bytes[written..])?;
    }
    handle.sync()?;
    Ok(())
}

fn read_all_string(ctx: &MarfsContext, path: &Path) -> Result<String> {
    let mut handle = ctx.mdal.open(path, false)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = handle.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(out).map_err(|_| Error::integrity("companion path is not valid text"))
}

/// Read the trash-entry path a tombstoned reference file points at.
///
/// The tombstone state is RESTART with no identity record; anything else
/// is a live file or a plain zombie and yields nothing.
pub fn trash_pointer(ctx: &MarfsContext, ref_path: &Path) -> Result<Option<PathBuf>> {
    let tags = load_tags(ctx, ref_path)?;
    if tags.ftag.is_some() || tags.restart.is_none() {
        return Ok(None);
    }
    let s = read_all_string(ctx, ref_path)?;
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(PathBuf::from(s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pattern, read_back, test_ctx};
    use crate::{DataStream, StreamReader};

    #[test]
    fn test_unlink_moves_to_trash() {
        let (_dir, ctx) = test_ctx();
        let ns = ctx.config.root();
        let data = pattern(2048);

        let mut ds = DataStream::create(&ctx, ns, "doomed", 0o644, true).unwrap();
        ds.write(&data).unwrap();
        let ref_path = ds.ref_path().to_path_buf();
        ds.release().unwrap();

        trash_unlink(&ctx, ns, "doomed").unwrap();

        // user entry is gone
        assert!(StreamReader::open(&ctx, ns, "doomed").is_err());

        // the reference is a tombstone: RESTART, no PRE, no POST, and a
        // pointer to its trash pair
        let tags = load_tags(&ctx, &ref_path).unwrap();
        assert!(tags.ftag.is_none());
        assert!(tags.post.is_none());
        assert!(tags.restart.is_some());
        let trash = trash_pointer(&ctx, &ref_path).unwrap().unwrap();

        // trash entry carries the records, deleted-marked and with POST
        // flagged TRASH
        let trash_tags = load_tags(&ctx, &trash).unwrap();
        assert!(trash_tags.ftag.unwrap().state.deleted);
        assert!(trash_tags.post.unwrap().trash);

        // companion holds exactly the original MDFS path
        let companion = paths::companion_file(&trash);
        let mut handle = ctx.mdal.open(&companion, false).unwrap();
        let mut buf = [0u8; 512];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            paths::user_file(&ctx.config, ns, "doomed").to_string_lossy()
        );
    }

    #[test]
    fn test_tombstoned_reference_fails_reads_cleanly() {
        let (_dir, ctx) = test_ctx();
        let ns = ctx.config.root();

        let mut ds = DataStream::create(&ctx, ns, "torn", 0o644, true).unwrap();
        ds.write(&pattern(512)).unwrap();
        let ref_path = ds.ref_path().to_path_buf();
        ds.release().unwrap();

        trash_unlink(&ctx, ns, "torn").unwrap();

        // a reader racing the detach sees a clean transient failure, not
        // stale object bytes
        let err = StreamReader::open_ref(&ctx, &ref_path).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unlink_without_identity_just_unlinks() {
        let (_dir, ctx) = test_ctx();
        let ns = ctx.config.root();

        // a plain MD entry in the user tree, no stream behind it
        let user = paths::user_file(&ctx.config, ns, "plain");
        let mut handle = ctx.mdal.create(&user, 0o644).unwrap();
        handle.write(b"direct bytes").unwrap();
        drop(handle);

        trash_unlink(&ctx, ns, "plain").unwrap();
        assert!(ctx.mdal.stat(&user).is_err());
    }

    #[test]
    fn test_trash_mtime_preserves_original_atime() {
        let (_dir, ctx) = test_ctx();
        let ns = ctx.config.root();

        let mut ds = DataStream::create(&ctx, ns, "aged", 0o644, true).unwrap();
        ds.write(&pattern(64)).unwrap();
        let ref_path = ds.ref_path().to_path_buf();
        ds.release().unwrap();

        ctx.mdal.set_times(&ref_path, 1_234_567_890, 1_234_567_890).unwrap();

        trash_unlink(&ctx, ns, "aged").unwrap();
        let trash = trash_pointer(&ctx, &ref_path).unwrap().unwrap();
        let stat = ctx.mdal.stat(&trash).unwrap();
        assert_eq!(stat.mtime, 1_234_567_890);
    }

    #[test]
    fn test_undelete_round_trip() {
        let (_dir, ctx) = test_ctx();
        let ns = ctx.config.root();
        let data = pattern(10_000); // multi-chunk, so chunk-info survives the trip

        let mut ds = DataStream::create(&ctx, ns, "back", 0o644, true).unwrap();
        ds.write(&data).unwrap();
        let ref_path = ds.ref_path().to_path_buf();
        ds.release().unwrap();

        ctx.mdal.set_times(&ref_path, 1_600_000_000, 1_600_000_001).unwrap();
        let original_atime = ctx.mdal.stat(&ref_path).unwrap().atime;

        trash_unlink(&ctx, ns, "back").unwrap();
        let trash = trash_pointer(&ctx, &ref_path).unwrap().unwrap();

        undelete(&ctx, ns, &trash).unwrap();

        // content identical, atime restored, trash pair gone
        assert_eq!(read_back(&ctx, "back"), data);
        assert_eq!(ctx.mdal.stat(&ref_path).unwrap().atime, original_atime);
        assert!(ctx.mdal.stat(&trash).is_err());
        assert!(ctx.mdal.stat(&paths::companion_file(&trash)).is_err());
    }
}
