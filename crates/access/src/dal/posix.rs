//! POSIX-backed DAL
//!
//! Objects are plain files under `pod<p>/cap<c>/scat<s>/` inside one root
//! directory. A PUT streams into `<name>.partial` and renames into place
//! on close, so an aborted or crashed write never leaves a visible
//! object.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use marfs_core::error::{Error, Result};

use super::{Dal, DalHandle, DalMode, ObjectTarget};

const PARTIAL_SUFFIX: &str = ".partial";

/// DAL over a plain directory tree.
pub struct PosixDal {
    root: PathBuf,
}

impl PosixDal {
    /// Open the layer over `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(PosixDal { root })
    }

    /// Build a PosixDal from a repo's opaque DAL block: reads the `root`
    /// key.
    pub fn from_config(block: &toml::Value) -> Result<Self> {
        let root = block
            .get("root")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::config("dal block lacks a \"root\" path"))?;
        PosixDal::new(root)
    }

    fn object_path(&self, target: &ObjectTarget) -> PathBuf {
        self.root
            .join(format!("pod{}", target.location.pod))
            .join(format!("cap{}", target.location.cap))
            .join(format!("scat{}", target.location.scatter))
            .join(&target.object_name)
    }
}

enum HandleState {
    Put { file: File, partial: PathBuf, sealed: PathBuf },
    Get { file: File, remaining: Option<u64> },
}

struct PosixDalHandle {
    state: HandleState,
}

impl DalHandle for PosixDalHandle {
    fn put(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.state {
            HandleState::Put { file, .. } => Ok(file.write(buf)?),
            HandleState::Get { .. } => {
                Err(Error::integrity("put on a GET handle"))
            }
        }
    }

    fn get(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.state {
            HandleState::Get { file, remaining } => {
                let want = match remaining {
                    Some(rem) => (*rem).min(buf.len() as u64) as usize,
                    None => buf.len(),
                };
                if want == 0 {
                    return Ok(0);
                }
                let n = file.read(&mut buf[..want])?;
                if let Some(rem) = remaining {
                    *rem -= n as u64;
                }
                Ok(n)
            }
            HandleState::Put { .. } => Err(Error::integrity("get on a PUT handle")),
        }
    }

    fn sync(&mut self) -> Result<()> {
        match &mut self.state {
            HandleState::Put { file, .. } => Ok(file.sync_all()?),
            HandleState::Get { .. } => Ok(()),
        }
    }

    fn abort(self: Box<Self>) -> Result<()> {
        match self.state {
            HandleState::Put { file, partial, .. } => {
                drop(file);
                match fs::remove_file(&partial) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            HandleState::Get { .. } => Ok(()),
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        match self.state {
            HandleState::Put { mut file, partial, sealed } => {
                file.flush()?;
                file.sync_all()?;
                drop(file);
                fs::rename(&partial, &sealed)?;
                Ok(())
            }
            HandleState::Get { .. } => Ok(()),
        }
    }
}

impl Dal for PosixDal {
    fn open(
        &self,
        target: &ObjectTarget,
        mode: DalMode,
        offset: u64,
        content_length: Option<u64>,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn DalHandle>> {
        let sealed = self.object_path(target);
        match mode {
            DalMode::Put => {
                if offset != 0 {
                    return Err(Error::integrity("PUT handles start at offset zero"));
                }
                if let Some(parent) = sealed.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut partial = sealed.clone().into_os_string();
                partial.push(PARTIAL_SUFFIX);
                let partial = PathBuf::from(partial);
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&partial)?;
                debug!(object = %target.object_name, "opened PUT stream");
                Ok(Box::new(PosixDalHandle {
                    state: HandleState::Put { file, partial, sealed },
                }))
            }
            DalMode::Get => {
                let mut file = File::open(&sealed).map_err(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        Error::NotFound(format!("object {}", target.object_name))
                    } else {
                        e.into()
                    }
                })?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))?;
                }
                Ok(Box::new(PosixDalHandle {
                    state: HandleState::Get { file, remaining: content_length },
                }))
            }
        }
    }

    fn delete(&self, target: &ObjectTarget) -> Result<()> {
        match fs::remove_file(self.object_path(target)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(object = %target.object_name, "delete of absent object");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&self, target: &ObjectTarget) -> Result<u64> {
        match fs::metadata(self.object_path(target)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}", target.object_name)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marfs_core::placement::ObjectLocation;
    use marfs_core::config::RepoId;
    use tempfile::TempDir;

    fn target(name: &str) -> ObjectTarget {
        ObjectTarget {
            repo: RepoId(0),
            object_name: name.to_string(),
            location: ObjectLocation { pod: 1, cap: 2, scatter: 3 },
        }
    }

    fn dal() -> (TempDir, PosixDal) {
        let dir = TempDir::new().unwrap();
        let dal = PosixDal::new(dir.path().join("objects")).unwrap();
        (dir, dal)
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, dal) = dal();
        let tgt = target("obj.1");

        let mut h = dal.open(&tgt, DalMode::Put, 0, None, None).unwrap();
        h.put(b"0123456789").unwrap();
        h.sync().unwrap();
        h.close().unwrap();

        let mut h = dal.open(&tgt, DalMode::Get, 0, None, None).unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = h.get(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(buf, b"0123456789");
    }

    #[test]
    fn test_get_byte_range() {
        let (_dir, dal) = dal();
        let tgt = target("obj.range");
        let mut h = dal.open(&tgt, DalMode::Put, 0, None, None).unwrap();
        h.put(b"abcdefghij").unwrap();
        h.close().unwrap();

        let mut h = dal.open(&tgt, DalMode::Get, 2, Some(3), None).unwrap();
        let mut buf = [0u8; 8];
        let n = h.get(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"cde");
        assert_eq!(h.get(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_partial_is_invisible_until_close() {
        let (_dir, dal) = dal();
        let tgt = target("obj.vis");
        let mut h = dal.open(&tgt, DalMode::Put, 0, None, None).unwrap();
        h.put(b"data").unwrap();

        assert!(dal.stat(&tgt).is_err());
        h.close().unwrap();
        assert_eq!(dal.stat(&tgt).unwrap(), 4);
    }

    #[test]
    fn test_abort_discards() {
        let (_dir, dal) = dal();
        let tgt = target("obj.abort");
        let mut h = dal.open(&tgt, DalMode::Put, 0, None, None).unwrap();
        h.put(b"junk").unwrap();
        h.abort().unwrap();

        assert!(dal.stat(&tgt).is_err());
        assert!(dal.open(&tgt, DalMode::Get, 0, None, None).is_err());
    }

    #[test]
    fn test_delete_absent_is_success() {
        let (_dir, dal) = dal();
        dal.delete(&target("never.existed")).unwrap();
    }

    #[test]
    fn test_delete_removes() {
        let (_dir, dal) = dal();
        let tgt = target("obj.del");
        let mut h = dal.open(&tgt, DalMode::Put, 0, None, None).unwrap();
        h.put(b"x").unwrap();
        h.close().unwrap();

        dal.delete(&tgt).unwrap();
        assert!(dal.stat(&tgt).is_err());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, dal) = dal();
        let err = dal.open(&target("ghost"), DalMode::Get, 0, None, None).unwrap_err();
        assert!(err.is_not_found());
    }
}
