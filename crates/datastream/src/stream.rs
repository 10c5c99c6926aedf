//! Datastream write, parallel-write, and read paths
//!
//! Write-path state machine per stream:
//!
//! ```text
//!  INIT --create--> WRITING(Uni) --boundary crossed--> WRITING(Multi)
//!                      |                                   |
//!                      +--release--> FINALIZED <--release--+
//!  INIT --create+extend(n)--> PARALLEL (N:1; writers fill chunks
//!                             independently, creator releases)
//! ```
//!
//! Every sealed object carries a recovery region at its tail; every sealed
//! chunk of a Multi/N:1 stream appends a MultiChunkInfo record into the
//! MD file at `chunk_no * CHUNK_INFO_SIZE`. User bytes and system bytes
//! (recovery regions) are accounted separately, so logical offsets never
//! include framing.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use marfs_access::dal::{DalHandle, DalMode, ObjectTarget};
use marfs_access::mdal::MdHandle;
use marfs_codec::attrs::AttrCodec;
use marfs_codec::chunkinfo::{MultiChunkInfo, CHUNK_INFO_SIZE};
use marfs_codec::recovery::{self, RecoveryFile, RecoveryHead, REC_UNI_SIZE};
use marfs_codec::{ATTR_OBJID, ATTR_POST, ATTR_RESTART};
use marfs_core::config::{NsId, Perms};
use marfs_core::error::{Error, Result};
use marfs_core::tag::{Ftag, ObjectType, Post, Restart, StreamState};

use crate::paths;
use crate::MarfsContext;

/// Mode bits MD files carry while a write is in flight.
const WRITING_MODE: u32 = 0o600;

/// Bounded retries for short reads on one byte range.
const READ_RETRIES: usize = 2;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse the inode component back out of a stream id.
fn stream_inode(stream_id: &str) -> u64 {
    stream_id
        .split('.')
        .next()
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}

/// The reserved records found on one reference path.
pub struct LoadedTags {
    /// Identity record, if installed
    pub ftag: Option<Ftag>,
    /// Layout record, if installed
    pub post: Option<Post>,
    /// Write-incomplete marker, if set
    pub restart: Option<Restart>,
}

/// Load and parse all reserved xattrs of a reference path.
pub fn load_tags(ctx: &MarfsContext, ref_path: &std::path::Path) -> Result<LoadedTags> {
    let vers = ctx.config.version;
    let parse_attr = |name: &str| -> Result<Option<String>> { ctx.mdal.get_xattr(ref_path, name) };
    let ftag = match parse_attr(ATTR_OBJID)? {
        Some(s) => Some(Ftag::parse(&s, vers)?),
        None => None,
    };
    let post = match parse_attr(ATTR_POST)? {
        Some(s) => Some(Post::parse(&s, vers)?),
        None => None,
    };
    let restart = match parse_attr(ATTR_RESTART)? {
        Some(s) => Some(Restart::parse(&s, vers)?),
        None => None,
    };
    Ok(LoadedTags { ftag, post, restart })
}

/// Resolve a user-tree entry to its reference path.
pub fn resolve_user_path(
    ctx: &MarfsContext,
    ns: NsId,
    rel: &str,
) -> Result<std::path::PathBuf> {
    let user = paths::user_file(&ctx.config, ns, rel);
    let target = ctx.mdal.read_link(&user)?;
    Ok(std::path::PathBuf::from(target))
}

enum WriteState {
    /// Sequential writer; object type starts Uni
    Writing,
    /// Extended for N:1; creator waits for parallel writers
    Parallel,
    /// Release completed
    Released,
}

/// A writable datastream handle, one per created file.
pub struct DataStream {
    ctx: Arc<MarfsContext>,
    ns: NsId,
    rel_path: String,
    ref_path: std::path::PathBuf,
    ftag: Ftag,
    post: Post,
    restart: Restart,
    state: WriteState,
    /// Logical user bytes written so far
    user_bytes: u64,
    /// User bytes already stored in sealed chunks
    sealed_bytes: u64,
    /// Non-user bytes (recovery regions) written
    sys_writes: u64,
    /// Reserved logical size for N:1 streams
    extended: Option<u64>,
    obj_handle: Option<Box<dyn DalHandle>>,
    md_handle: Option<Box<dyn MdHandle>>,
    direct: bool,
}

impl DataStream {
    /// Create a new user file and its backing stream.
    ///
    /// Reserves a stream id unique across the namespace, installs the
    /// RESTART marker (unless the repo is direct-write), links the user
    /// path, and leaves the stream ready for writes. Quota preflight
    /// happens here so callers can reject early with a distinct error.
    pub fn create(
        ctx: &Arc<MarfsContext>,
        ns: NsId,
        rel_path: &str,
        mode: u32,
        interactive: bool,
    ) -> Result<DataStream> {
        ctx.check_perms(
            ns,
            interactive,
            Perms { write_meta: true, write_data: true, ..Default::default() },
        )?;

        let namespace = ctx.ns(ns);
        if namespace.quota_files.enforced {
            let usage = ctx.mdal.usage(namespace)?;
            if usage.inodes + 1 > namespace.quota_files.limit {
                return Err(Error::QuotaExceeded {
                    namespace: namespace.id_str.clone(),
                    kind: marfs_core::error::QuotaKind::Files,
                });
            }
        }

        let repo_id = ctx.config.find_repo(ns, 0, interactive);
        let repo = ctx.config.repo(repo_id);
        let direct = repo.direct.write;

        // the stream id embeds the reference inode, so the file must exist
        // before it can be named: create under a temporary name, stat, and
        // move into its hashed home
        static CREATE_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = CREATE_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tmp_name = format!("tmp_{}_{}", std::process::id(), seq);
        let tmp_path = namespace.md_path.join("refs").join(&tmp_name);
        let handle = ctx.mdal.create(&tmp_path, WRITING_MODE)?;
        drop(handle);
        let stat = ctx.mdal.stat(&tmp_path)?;

        let mut unique = 0u64;
        let (stream_id, ref_path) = loop {
            let candidate = Ftag::make_stream_id(stat.inode, stat.ctime, unique);
            let ref_path = paths::ref_file(&ctx.config, ns, &candidate, 0);
            // a just-trashed stream may still occupy this identity
            if ctx.mdal.stat(&ref_path).is_err() {
                break (candidate, ref_path);
            }
            unique += 1;
        };
        ctx.mdal.rename(&tmp_path, &ref_path)?;

        let ftag = Ftag {
            vers: ctx.config.version,
            repo: repo.name.clone(),
            ns_id: namespace.id_str.clone(),
            chunk_size: repo.chunk_size,
            recovery_bytes: REC_UNI_SIZE as u64,
            stream_id,
            obj_no: 0,
            chunk_no: 0,
            file_no: 0,
            ctime: stat.ctime,
            unique,
            state: StreamState::writing(),
        };
        let post = Post::new(ctx.config.version);
        let restart = Restart { mode: Some(mode) };

        if !direct {
            ctx.mdal.set_xattr(&ref_path, ATTR_RESTART, &restart.encode())?;
            ctx.mdal.set_xattr(&ref_path, ATTR_OBJID, &ftag.encode())?;
        }

        let user = paths::user_file(&ctx.config, ns, rel_path);
        ctx.mdal.symlink(&ref_path.to_string_lossy(), &user)?;

        debug!(stream = %ftag.stream_id, path = rel_path, "created datastream");
        Ok(DataStream {
            ctx: Arc::clone(ctx),
            ns,
            rel_path: rel_path.to_string(),
            ref_path,
            ftag,
            post,
            restart,
            state: WriteState::Writing,
            user_bytes: 0,
            sealed_bytes: 0,
            sys_writes: 0,
            extended: None,
            obj_handle: None,
            md_handle: None,
            direct,
        })
    }

    /// Re-open an existing user file for truncation to zero.
    ///
    /// The only supported truncation; the old stream detaches to trash
    /// and a fresh one begins, exactly as [`DataStream::ftruncate_zero`]
    /// on a live handle.
    pub fn open_truncate(
        ctx: &Arc<MarfsContext>,
        ns: NsId,
        rel_path: &str,
    ) -> Result<DataStream> {
        let ref_path = resolve_user_path(ctx, ns, rel_path)?;
        let tags = load_tags(ctx, &ref_path)?;
        let ftag = tags
            .ftag
            .ok_or_else(|| Error::integrity("truncate of a file with no identity record"))?;
        let stat = ctx.mdal.stat(&ref_path)?;
        let direct = ctx
            .config
            .repo_by_name(&ftag.repo)
            .map(|id| ctx.config.repo(id).direct.write)
            .unwrap_or(false);

        let mut stream = DataStream {
            ctx: Arc::clone(ctx),
            ns,
            rel_path: rel_path.to_string(),
            ref_path,
            post: tags.post.unwrap_or_else(|| Post::new(ctx.config.version)),
            restart: tags.restart.unwrap_or(Restart { mode: Some(stat.mode) }),
            ftag,
            state: WriteState::Writing,
            user_bytes: 0,
            sealed_bytes: 0,
            sys_writes: 0,
            extended: None,
            obj_handle: None,
            md_handle: None,
            direct,
        };
        stream.ftruncate_zero()?;
        Ok(stream)
    }

    /// The stream's identity record.
    pub fn ftag(&self) -> &Ftag {
        &self.ftag
    }

    /// Reference path of the stream head.
    pub fn ref_path(&self) -> &std::path::Path {
        &self.ref_path
    }

    /// Pre-reserve `n` logical bytes and publish the identity records so
    /// parallel writers can attach. Legal only before the first write.
    pub fn extend(&mut self, n: u64) -> Result<()> {
        if self.user_bytes > 0 || self.extended.is_some() {
            return Err(Error::integrity("extend after data was written"));
        }
        if self.direct {
            return Err(Error::integrity("extend on a direct-write repo"));
        }
        if n == 0 {
            return Err(Error::integrity("extend of zero bytes"));
        }

        let dpc = self.ftag.data_per_chunk();
        let chunks = n.div_ceil(dpc);
        self.post.obj_type = ObjectType::Nto1;
        self.post.chunks = chunks;
        self.ftag.state.sized = true;
        self.extended = Some(n);

        // hole slots for every chunk-info record; parallel writers fill
        // their own as they seal
        let slot_bytes = chunks * CHUNK_INFO_SIZE as u64;
        let mut md = self.ctx.mdal.open(&self.ref_path, true)?;
        md.set_len(n.max(slot_bytes))?;
        drop(md);

        self.ctx.mdal.set_xattr(&self.ref_path, ATTR_OBJID, &self.ftag.encode())?;
        self.ctx.mdal.set_xattr(&self.ref_path, ATTR_POST, &self.post.encode())?;
        self.state = WriteState::Parallel;
        debug!(stream = %self.ftag.stream_id, n, chunks, "extended for parallel write");
        Ok(())
    }

    /// Append user bytes at the current logical write position.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.state {
            WriteState::Writing => {}
            WriteState::Parallel => {
                return Err(Error::integrity("sequential write on an extended stream"))
            }
            WriteState::Released => return Err(Error::integrity("write after release")),
        }

        if self.direct {
            return self.write_direct(buf);
        }

        let dpc = self.ftag.data_per_chunk();
        let mut remaining = buf;
        while !remaining.is_empty() {
            let in_chunk = self.user_bytes - self.sealed_bytes;
            let room = dpc - in_chunk;
            if room == 0 {
                // this chunk is full; seal it and continue the stream in
                // the next object
                self.seal_chunk(true)?;
                continue;
            }
            let take = (room as usize).min(remaining.len());
            self.put_object_bytes(&remaining[..take])?;
            self.user_bytes += take as u64;
            remaining = &remaining[take..];
        }
        Ok(buf.len())
    }

    fn write_direct(&mut self, buf: &[u8]) -> Result<usize> {
        if self.md_handle.is_none() {
            let mut handle = self.ctx.mdal.open(&self.ref_path, true)?;
            handle.seek(self.user_bytes)?;
            self.md_handle = Some(handle);
        }
        let handle = self.md_handle.as_mut().unwrap_or_else(|| unreachable!());
        let mut written = 0;
        while written < buf.len() {
            written += handle.write(&buf[written..])?;
        }
        self.user_bytes += buf.len() as u64;
        Ok(buf.len())
    }

    fn put_object_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.obj_handle.is_none() {
            let target = ObjectTarget::for_ftag(&self.ctx.config, &self.ftag, self.ftag.obj_no)?;
            self.obj_handle = Some(self.ctx.dal.open(&target, DalMode::Put, 0, None, None)?);
        }
        let handle = self.obj_handle.as_mut().unwrap_or_else(|| unreachable!());
        let mut written = 0;
        while written < buf.len() {
            written += handle.put(&buf[written..])?;
        }
        Ok(())
    }

    fn recovery_file(&self, user_bytes_this_obj: u64) -> Result<RecoveryFile> {
        let stat = self.ctx.mdal.stat(&self.ref_path)?;
        let ns_path = {
            let mnt = &self.ctx.ns(self.ns).mnt_path;
            if mnt == "/" {
                format!("/{}", self.rel_path.trim_start_matches('/'))
            } else {
                format!("{}/{}", mnt, self.rel_path.trim_start_matches('/'))
            }
        };
        Ok(RecoveryFile {
            head: RecoveryHead {
                vers: self.ctx.config.version,
                user_bytes: user_bytes_this_obj,
                mode: self.restart.mode.unwrap_or(stat.mode),
                uid: stat.uid,
                gid: stat.gid,
                mtime: now_secs(),
            },
            ftag: self.ftag.clone(),
            post: self.post.clone(),
            path: ns_path,
        })
    }

    /// Seal the current object: recovery tail, sync, close, and (for
    /// chunked layouts) the chunk-info record. With `more`, the stream
    /// advances to the next object and becomes Multi.
    fn seal_chunk(&mut self, more: bool) -> Result<()> {
        let user_this_obj = self.user_bytes - self.sealed_bytes;

        if more && self.post.obj_type == ObjectType::Uni {
            self.post.obj_type = ObjectType::Multi;
        }

        if self.obj_handle.is_none() && (user_this_obj > 0 || more) {
            // an object with zero user bytes still needs its handle for
            // the recovery tail when the stream continues past it
            let target = ObjectTarget::for_ftag(&self.ctx.config, &self.ftag, self.ftag.obj_no)?;
            self.obj_handle = Some(self.ctx.dal.open(&target, DalMode::Put, 0, None, None)?);
        }

        if let Some(mut handle) = self.obj_handle.take() {
            let region = recovery::encode_uni(&self.recovery_file(user_this_obj)?)?;
            let mut written = 0;
            while written < region.len() {
                written += match handle.put(&region[written..]) {
                    Ok(n) => n,
                    Err(e) => {
                        // write failures are fatal for the stream
                        let _ = handle.abort();
                        return Err(e);
                    }
                };
            }
            handle.sync()?;
            handle.close()?;
            self.sys_writes += region.len() as u64;
        }

        if self.post.obj_type == ObjectType::Multi {
            let info = MultiChunkInfo {
                vers: self.ctx.config.version,
                chunk_no: self.ftag.obj_no,
                logical_offset: self.sealed_bytes,
                chunk_data_bytes: user_this_obj,
                correct_info: self.post.correct_info,
                encrypt_info: self.post.encrypt_info,
            };
            self.append_chunk_info(&info)?;
        }

        self.sealed_bytes = self.user_bytes;
        if more {
            self.ftag.obj_no += 1;
            self.post.chunks = self.ftag.obj_no + 1;
            debug!(stream = %self.ftag.stream_id, obj = self.ftag.obj_no, "advanced to next chunk object");
        }
        Ok(())
    }

    fn append_chunk_info(&mut self, info: &MultiChunkInfo) -> Result<()> {
        if self.md_handle.is_none() {
            self.md_handle = Some(self.ctx.mdal.open(&self.ref_path, true)?);
        }
        let handle = self.md_handle.as_mut().unwrap_or_else(|| unreachable!());
        handle.seek(info.chunk_no * CHUNK_INFO_SIZE as u64)?;
        let bytes = info.to_bytes();
        let mut written = 0;
        while written < bytes.len() {
            written += handle.write(&bytes[written..])?;
        }
        Ok(())
    }

    /// Finalize the stream: seal the tail object, journal the final
    /// chunk-info, record the layout, truncate the MD file to the logical
    /// size, clear RESTART, and restore the caller's mode bits.
    ///
    /// If release fails midway the file stays recoverable: RESTART
    /// remains, already-journaled chunk-info records stay valid, and a
    /// later walk can continue.
    pub fn release(mut self) -> Result<()> {
        match self.state {
            WriteState::Released => return Err(Error::integrity("double release")),
            WriteState::Parallel => return self.release_parallel(),
            WriteState::Writing => {}
        }

        if self.direct {
            if let Some(mut md) = self.md_handle.take() {
                md.sync()?;
            }
            self.state = WriteState::Released;
            return Ok(());
        }

        if self.user_bytes > 0 {
            self.seal_chunk(false)?;
        }
        // zero-byte file: Uni, no chunk-info, no object
        if self.user_bytes == 0 {
            self.post.chunks = 0;
        }

        if self.post.obj_type == ObjectType::Multi {
            self.post.chunk_info_bytes = self.post.chunks * CHUNK_INFO_SIZE as u64;
        }

        self.finalize_md(self.user_bytes)?;
        self.state = WriteState::Released;
        Ok(())
    }

    fn release_parallel(&mut self) -> Result<()> {
        let expected = self.post.chunks;
        let reserved = self.extended.unwrap_or(0);

        let mut md = self.ctx.mdal.open(&self.ref_path, false)?;
        let mut filled = 0u64;
        let mut buf = [0u8; CHUNK_INFO_SIZE];
        for k in 0..expected {
            md.seek(k * CHUNK_INFO_SIZE as u64)?;
            let mut got = 0;
            while got < CHUNK_INFO_SIZE {
                let n = md.read(&mut buf[got..])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            if got == CHUNK_INFO_SIZE
                && MultiChunkInfo::from_bytes(&buf, self.ctx.config.version)?.is_some()
            {
                filled += 1;
            }
        }
        drop(md);

        if filled < expected {
            // leave RESTART in place; the stream stays recoverable
            return Err(Error::integrity(format!(
                "parallel stream incomplete: {} of {} chunks written",
                filled, expected
            )));
        }

        self.post.chunk_info_bytes = expected * CHUNK_INFO_SIZE as u64;
        self.finalize_md(reserved)?;
        self.state = WriteState::Released;
        Ok(())
    }

    fn finalize_md(&mut self, logical_size: u64) -> Result<()> {
        let mut md = match self.md_handle.take() {
            Some(h) => h,
            None => self.ctx.mdal.open(&self.ref_path, true)?,
        };
        md.set_len(logical_size)?;
        md.sync()?;
        drop(md);

        self.ftag.state = StreamState::finalized();
        self.ctx.mdal.set_xattr(&self.ref_path, ATTR_OBJID, &self.ftag.encode())?;
        self.ctx.mdal.set_xattr(&self.ref_path, ATTR_POST, &self.post.encode())?;
        self.ctx.mdal.remove_xattr(&self.ref_path, ATTR_RESTART)?;
        if let Some(mode) = self.restart.mode {
            self.ctx.mdal.set_mode(&self.ref_path, mode)?;
        }
        debug!(
            stream = %self.ftag.stream_id,
            size = logical_size,
            sys_writes = self.sys_writes,
            "released datastream"
        );
        Ok(())
    }

    /// Truncate to zero: detach the current stream to trash and begin a
    /// fresh one under the same user path.
    ///
    /// The new identity keeps the old inode basis; a same-second truncate
    /// bumps the `unique` counter so the fresh object ids cannot collide
    /// with the trashed ones.
    pub fn ftruncate_zero(&mut self) -> Result<()> {
        if self.direct {
            let mut md = self.ctx.mdal.open(&self.ref_path, true)?;
            md.set_len(0)?;
            self.user_bytes = 0;
            return Ok(());
        }

        if let Some(handle) = self.obj_handle.take() {
            handle.abort()?;
        }
        self.md_handle = None;

        // persist current layout so the trashed stream's objects stay
        // enumerable by GC
        self.ctx.mdal.set_xattr(&self.ref_path, ATTR_OBJID, &self.ftag.encode())?;
        self.ctx.mdal.set_xattr(&self.ref_path, ATTR_POST, &self.post.encode())?;
        crate::trash::truncate_to_trash(&self.ctx, self.ns, &self.ref_path, &self.rel_path)?;

        // fresh stream on the same identity basis
        let inode = stream_inode(&self.ftag.stream_id);
        let now = now_secs();
        let mut unique = if now == self.ftag.ctime { self.ftag.unique + 1 } else { 0 };
        let (stream_id, new_ref) = loop {
            let candidate = Ftag::make_stream_id(inode, now, unique);
            let ref_path = paths::ref_file(&self.ctx.config, self.ns, &candidate, 0);
            match self.ctx.mdal.create(&ref_path, WRITING_MODE) {
                Ok(handle) => {
                    drop(handle);
                    break (candidate, ref_path);
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    unique += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.ftag.stream_id = stream_id;
        self.ftag.ctime = now;
        self.ftag.unique = unique;
        self.ftag.obj_no = 0;
        self.ftag.chunk_no = 0;
        self.ftag.state = StreamState::writing();
        self.post = Post::new(self.ctx.config.version);
        self.user_bytes = 0;
        self.sealed_bytes = 0;
        self.sys_writes = 0;
        self.extended = None;
        self.state = WriteState::Writing;

        self.ctx.mdal.set_xattr(&new_ref, ATTR_RESTART, &self.restart.encode())?;
        self.ctx.mdal.set_xattr(&new_ref, ATTR_OBJID, &self.ftag.encode())?;

        let user = paths::user_file(&self.ctx.config, self.ns, &self.rel_path);
        self.ctx.mdal.unlink(&user)?;
        self.ctx.mdal.symlink(&new_ref.to_string_lossy(), &user)?;
        self.ref_path = new_ref;
        Ok(())
    }
}

/// Writer for one chunk of an extended (N:1) stream.
pub struct ParallelWriter {
    ctx: Arc<MarfsContext>,
    ref_path: std::path::PathBuf,
    ftag: Ftag,
    post: Post,
    ns_path: String,
    chunk: u64,
    written: u64,
    capacity: u64,
    handle: Option<Box<dyn DalHandle>>,
}

impl ParallelWriter {
    /// Attach to chunk `chunk` of a previously extended file.
    pub fn open(ctx: &Arc<MarfsContext>, ns: NsId, rel_path: &str, chunk: u64) -> Result<Self> {
        let ref_path = resolve_user_path(ctx, ns, rel_path)?;
        let tags = load_tags(ctx, &ref_path)?;
        let ftag = tags
            .ftag
            .ok_or_else(|| Error::integrity("parallel open of a file with no identity"))?;
        let post = tags
            .post
            .ok_or_else(|| Error::integrity("parallel open of an unextended file"))?;
        if post.obj_type != ObjectType::Nto1 {
            return Err(Error::integrity("parallel open of a non-extended stream"));
        }
        if chunk >= post.chunks {
            return Err(Error::integrity(format!(
                "chunk {} outside extended range of {} chunks",
                chunk, post.chunks
            )));
        }

        let ns_path = {
            let mnt = &ctx.ns(ns).mnt_path;
            if mnt == "/" {
                format!("/{}", rel_path.trim_start_matches('/'))
            } else {
                format!("{}/{}", mnt, rel_path.trim_start_matches('/'))
            }
        };

        let capacity = ftag.data_per_chunk();
        Ok(ParallelWriter {
            ctx: Arc::clone(ctx),
            ref_path,
            ftag,
            post,
            ns_path,
            chunk,
            written: 0,
            capacity,
            handle: None,
        })
    }

    /// Append bytes; the writer must stay entirely within its chunk.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.written + buf.len() as u64 > self.capacity {
            return Err(Error::integrity(format!(
                "write of {} bytes exceeds chunk capacity {}",
                buf.len(),
                self.capacity
            )));
        }
        if self.handle.is_none() {
            let target = ObjectTarget::for_ftag(&self.ctx.config, &self.ftag, self.chunk)?;
            self.handle = Some(self.ctx.dal.open(&target, DalMode::Put, 0, None, None)?);
        }
        let handle = self.handle.as_mut().unwrap_or_else(|| unreachable!());
        let mut written = 0;
        while written < buf.len() {
            written += handle.put(&buf[written..])?;
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Seal the chunk: recovery tail, object close, and the chunk-info
    /// record in this chunk's slot. The record becomes visible to readers
    /// immediately, independent of other chunks.
    pub fn close(mut self) -> Result<()> {
        let mut handle = match self.handle.take() {
            Some(h) => h,
            None => return Err(Error::integrity("closing a parallel writer that wrote nothing")),
        };

        let stat = self.ctx.mdal.stat(&self.ref_path)?;
        let mut ftag = self.ftag.clone();
        ftag.obj_no = self.chunk;
        let region = recovery::encode_uni(&RecoveryFile {
            head: RecoveryHead {
                vers: self.ctx.config.version,
                user_bytes: self.written,
                mode: stat.mode,
                uid: stat.uid,
                gid: stat.gid,
                mtime: now_secs(),
            },
            ftag,
            post: self.post.clone(),
            path: self.ns_path.clone(),
        })?;
        let mut put = 0;
        while put < region.len() {
            put += match handle.put(&region[put..]) {
                Ok(n) => n,
                Err(e) => {
                    let _ = handle.abort();
                    return Err(e);
                }
            };
        }
        handle.sync()?;
        handle.close()?;

        let info = MultiChunkInfo {
            vers: self.ctx.config.version,
            chunk_no: self.chunk,
            logical_offset: self.chunk * self.ftag.data_per_chunk(),
            chunk_data_bytes: self.written,
            correct_info: self.post.correct_info,
            encrypt_info: self.post.encrypt_info,
        };
        let mut md = self.ctx.mdal.open(&self.ref_path, true)?;
        md.seek(self.chunk * CHUNK_INFO_SIZE as u64)?;
        let bytes = info.to_bytes();
        let mut written = 0;
        while written < bytes.len() {
            written += md.write(&bytes[written..])?;
        }
        md.sync()?;
        debug!(stream = %self.ftag.stream_id, chunk = self.chunk, bytes = self.written, "sealed parallel chunk");
        Ok(())
    }
}

/// A readable datastream handle.
pub struct StreamReader {
    ctx: Arc<MarfsContext>,
    ref_path: std::path::PathBuf,
    layout: ReadLayout,
    logical_size: u64,
    current: Option<OpenChunk>,
}

enum ReadLayout {
    /// User bytes live in the MD file itself
    Direct,
    /// User bytes live in objects, described by ftag + post
    Object { ftag: Ftag, post: Post },
}

struct OpenChunk {
    chunk: u64,
    /// Next data offset within the chunk this handle will yield
    data_offset: u64,
    handle: Box<dyn DalHandle>,
}

impl StreamReader {
    /// Open a user file for reading.
    pub fn open(ctx: &Arc<MarfsContext>, ns: NsId, rel_path: &str) -> Result<Self> {
        ctx.check_perms(
            ns,
            true,
            Perms { read_meta: true, read_data: true, ..Default::default() },
        )?;
        let ref_path = resolve_user_path(ctx, ns, rel_path)?;
        Self::open_ref(ctx, &ref_path)
    }

    /// Open a reference path directly (walker and test harness entry).
    pub fn open_ref(ctx: &Arc<MarfsContext>, ref_path: &std::path::Path) -> Result<Self> {
        let tags = load_tags(ctx, ref_path)?;
        let stat = ctx.mdal.stat(ref_path)?;

        let layout = match (tags.ftag, tags.post) {
            (Some(ftag), Some(post)) => {
                if ftag.state.deleted || post.trash {
                    // the stream has been detached to trash
                    return Err(Error::Transient(
                        "file has been detached to trash; no readable layout".to_string(),
                    ));
                }
                ReadLayout::Object { ftag, post }
            }
            (None, None) if tags.restart.is_none() => ReadLayout::Direct,
            // a writer is mid-stream, or a trash tombstone (RESTART with
            // no PRE) is all that remains; fail cleanly either way
            _ => {
                return Err(Error::Transient(
                    "file is being written; no readable layout".to_string(),
                ))
            }
        };

        Ok(StreamReader {
            ctx: Arc::clone(ctx),
            ref_path: ref_path.to_path_buf(),
            layout,
            logical_size: stat.size,
            current: None,
        })
    }

    /// Logical end of file.
    pub fn len(&self) -> u64 {
        self.logical_size
    }

    /// True for an empty file.
    pub fn is_empty(&self) -> bool {
        self.logical_size == 0
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count.
    /// Short counts only occur at EOF.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.logical_size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.logical_size - offset) as usize;

        match &self.layout {
            ReadLayout::Direct => self.read_direct(&mut buf[..want], offset),
            ReadLayout::Object { .. } => self.read_objects(&mut buf[..want], offset),
        }
    }

    fn read_direct(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut md = self.ctx.mdal.open(&self.ref_path, false)?;
        md.seek(offset)?;
        let mut got = 0;
        while got < buf.len() {
            let n = md.read(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        Ok(got)
    }

    fn read_objects(&mut self, buf: &mut [u8], mut offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..], offset)?;
            if n == 0 {
                break;
            }
            filled += n;
            offset += n as u64;
        }
        Ok(filled)
    }

    /// Read within one chunk, opening or reusing the byte-range stream.
    fn read_some(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let (ftag, post) = match &self.layout {
            ReadLayout::Object { ftag, post } => (ftag.clone(), post.clone()),
            ReadLayout::Direct => return Err(Error::integrity("object read on direct layout")),
        };

        let phys = post.obj_offset + offset;
        let (chunk, intra, chunk_data) = match post.obj_type {
            // a packed file's bytes end at obj_offset + size within the
            // shared object's data region
            ObjectType::Packed => (0, phys, post.obj_offset + self.logical_size),
            ObjectType::Uni => (0, phys, self.logical_size),
            ObjectType::Multi | ObjectType::Nto1 => {
                let dpc = ftag.data_per_chunk();
                let chunk = phys / dpc;
                let intra = phys % dpc;
                let info = self.chunk_info(chunk)?.ok_or_else(|| {
                    Error::Io(std::io::Error::other(format!(
                        "chunk {} has not been written",
                        chunk
                    )))
                })?;
                (chunk, intra, info.chunk_data_bytes)
            }
        };

        if intra >= chunk_data {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(chunk_data - intra) as usize;

        // a seek invalidates the open stream
        let reusable = self
            .current
            .as_ref()
            .map(|c| c.chunk == chunk && c.data_offset == intra)
            .unwrap_or(false);
        if !reusable {
            self.open_chunk(&ftag, chunk, intra, chunk_data)?;
        }

        let mut attempts = 0;
        loop {
            let cur = self.current.as_mut().unwrap_or_else(|| unreachable!());
            let mut got = 0;
            let mut failed = false;
            while got < want {
                match cur.handle.get(&mut buf[got..want]) {
                    Ok(0) => {
                        failed = true;
                        break;
                    }
                    Ok(n) => got += n,
                    Err(e) if e.is_retryable() => {
                        failed = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !failed {
                cur.data_offset += got as u64;
                return Ok(got);
            }
            // short read inside a valid range: retry the same byte range
            attempts += 1;
            if attempts > READ_RETRIES {
                return Err(Error::Transient(format!(
                    "short read in chunk {} after {} attempts",
                    chunk, attempts
                )));
            }
            self.open_chunk(&ftag, chunk, intra, chunk_data)?;
        }
    }

    fn open_chunk(&mut self, ftag: &Ftag, chunk: u64, intra: u64, chunk_data: u64) -> Result<()> {
        if let Some(old) = self.current.take() {
            old.handle.close()?;
        }
        let target = ObjectTarget::for_ftag(&self.ctx.config, ftag, chunk)?;
        let handle = self.ctx.dal.open(
            &target,
            DalMode::Get,
            intra,
            Some(chunk_data - intra),
            None,
        )?;
        self.current = Some(OpenChunk { chunk, data_offset: intra, handle });
        Ok(())
    }

    /// Chunk-info record for chunk `k`, or `None` while the slot is a
    /// hole. Always re-reads the MD file: a parallel writer may have
    /// sealed the chunk since the last look.
    fn chunk_info(&self, k: u64) -> Result<Option<MultiChunkInfo>> {
        let mut md = self.ctx.mdal.open(&self.ref_path, false)?;
        md.seek(k * CHUNK_INFO_SIZE as u64)?;
        let mut buf = [0u8; CHUNK_INFO_SIZE];
        let mut got = 0;
        while got < CHUNK_INFO_SIZE {
            let n = md.read(&mut buf[got..])?;
            if n == 0 {
                return Ok(None);
            }
            got += n;
        }
        MultiChunkInfo::from_bytes(&buf, self.ctx.config.version)
    }

    /// Release the read handle.
    pub fn close(mut self) -> Result<()> {
        if let Some(cur) = self.current.take() {
            cur.handle.close()?;
        }
        Ok(())
    }
}
