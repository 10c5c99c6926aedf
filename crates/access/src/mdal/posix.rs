//! POSIX-backed MDAL
//!
//! Metadata lives in an ordinary directory tree under one root. Extended
//! attributes are kept in a bincode sidecar next to each MD file
//! (`<name>#attrs`) so the layer works on any filesystem; sidecars are
//! written atomically (temp + rename) and are invisible to the scanner.

use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tracing::debug;

use marfs_core::config::Namespace;
use marfs_core::error::{Error, Result};

use super::{classify_entry, FileStat, MdHandle, Mdal, RefEntryKind, RefScanner, ScanEntry, Usage};

const ATTR_SIDECAR_SUFFIX: &str = "#attrs";

/// Number of entries per level of the trash scatter tree.
const TRASH_SCATTER_BREADTH: u64 = 10;

/// MDAL over a plain directory tree.
pub struct PosixMdal {
    root: PathBuf,
}

impl PosixMdal {
    /// Open the layer over `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(PosixMdal { root })
    }

    /// Build a PosixMdal from a repo's opaque MDAL block: reads the
    /// `root` key.
    pub fn from_config(block: &toml::Value) -> Result<Self> {
        let root = block
            .get("root")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::config("mdal block lacks a \"root\" path"))?;
        PosixMdal::new(root)
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn sidecar(&self, path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(ATTR_SIDECAR_SUFFIX);
        self.full(path).with_file_name(name)
    }

    fn load_attrs(&self, path: &Path) -> Result<BTreeMap<String, String>> {
        match fs::read(self.sidecar(path)) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::integrity(format!("corrupt attr sidecar: {}", e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store_attrs(&self, path: &Path, attrs: &BTreeMap<String, String>) -> Result<()> {
        let sidecar = self.sidecar(path);
        if attrs.is_empty() {
            match fs::remove_file(&sidecar) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let bytes = bincode::serialize(attrs)
            .map_err(|e| Error::integrity(format!("attr serialization failed: {}", e)))?;
        let mut tmp = sidecar.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &sidecar)?;
        Ok(())
    }
}

fn not_found(path: &Path) -> Error {
    Error::NotFound(path.display().to_string())
}

fn map_open_err(e: io::Error, path: &Path) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        not_found(path)
    } else {
        e.into()
    }
}

#[cfg(not(unix))]
fn epoch_secs(t: io::Result<std::time::SystemTime>) -> i64 {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct PosixHandle {
    file: File,
}

impl MdHandle for PosixHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf)?)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

struct PosixScanner {
    entries: std::vec::IntoIter<ScanEntry>,
}

impl RefScanner for PosixScanner {
    fn next_entry(&mut self) -> Result<Option<ScanEntry>> {
        Ok(self.entries.next())
    }
}

impl Mdal for PosixMdal {
    fn create(&self, path: &Path, mode: u32) -> Result<Box<dyn MdHandle>> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&full)?;
        set_mode_bits(&full, mode)?;
        Ok(Box::new(PosixHandle { file }))
    }

    fn open(&self, path: &Path, write: bool) -> Result<Box<dyn MdHandle>> {
        let full = self.full(path);
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(&full)
            .map_err(|e| map_open_err(e, path))?;
        Ok(Box::new(PosixHandle { file }))
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let full = self.full(path);
        let meta = fs::symlink_metadata(&full).map_err(|e| map_open_err(e, path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(FileStat {
                inode: meta.ino(),
                size: meta.len(),
                mode: meta.mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
                atime: meta.atime(),
                mtime: meta.mtime(),
                ctime: meta.ctime(),
                is_symlink: meta.file_type().is_symlink(),
            })
        }
        #[cfg(not(unix))]
        {
            Ok(FileStat {
                inode: 0,
                size: meta.len(),
                mode: 0o644,
                uid: 0,
                gid: 0,
                atime: epoch_secs(meta.accessed()),
                mtime: epoch_secs(meta.modified()),
                ctime: epoch_secs(meta.modified()),
                is_symlink: meta.file_type().is_symlink(),
            })
        }
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.full(path)).map_err(|e| map_open_err(e, path))?;
        let _ = fs::remove_file(self.sidecar(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let to_full = self.full(to);
        if let Some(parent) = to_full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.full(from), &to_full).map_err(|e| map_open_err(e, from))?;
        let from_sidecar = self.sidecar(from);
        if from_sidecar.exists() {
            fs::rename(&from_sidecar, self.sidecar(to))?;
        }
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        Ok(fs::create_dir_all(self.full(path))?)
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_dir(self.full(path))?)
    }

    fn symlink(&self, target: &str, path: &Path) -> Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &full)?;
        #[cfg(not(unix))]
        fs::write(&full, target)?;
        Ok(())
    }

    fn read_link(&self, path: &Path) -> Result<String> {
        let full = self.full(path);
        #[cfg(unix)]
        {
            let target = fs::read_link(&full).map_err(|e| map_open_err(e, path))?;
            Ok(target.to_string_lossy().into_owned())
        }
        #[cfg(not(unix))]
        {
            Ok(fs::read_to_string(&full).map_err(|e| map_open_err(e, path))?)
        }
    }

    fn set_times(&self, path: &Path, atime: i64, mtime: i64) -> Result<()> {
        let full = self.full(path);
        let file = match File::options().write(true).open(&full) {
            Ok(f) => f,
            // symlinks and read-only targets keep their timestamps
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
            Err(_) => return Ok(()),
        };
        let times = FileTimes::new()
            .set_accessed(UNIX_EPOCH + Duration::from_secs(atime.max(0) as u64))
            .set_modified(UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64));
        file.set_times(times)?;
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        set_mode_bits(&self.full(path), mode)
    }

    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<String>> {
        Ok(self.load_attrs(path)?.get(name).cloned())
    }

    fn set_xattr(&self, path: &Path, name: &str, value: &str) -> Result<()> {
        let mut attrs = self.load_attrs(path)?;
        attrs.insert(name.to_string(), value.to_string());
        self.store_attrs(path, &attrs)
    }

    fn remove_xattr(&self, path: &Path, name: &str) -> Result<()> {
        let mut attrs = self.load_attrs(path)?;
        if attrs.remove(name).is_some() {
            self.store_attrs(path, &attrs)?;
        }
        Ok(())
    }

    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.load_attrs(path)?.into_keys().collect())
    }

    fn scan(&self, dir: &Path) -> Result<Box<dyn RefScanner>> {
        let full = self.full(dir);
        let mut entries = Vec::new();
        match fs::read_dir(&full) {
            Ok(iter) => {
                for entry in iter {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(ATTR_SIDECAR_SUFFIX) {
                        continue;
                    }
                    entries.push(classify_entry(&name));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "scan of absent reference dir");
            }
            Err(e) => return Err(e.into()),
        }
        // deterministic order keeps walks reproducible across runs
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(PosixScanner { entries: entries.into_iter() }))
    }

    fn usage(&self, ns: &Namespace) -> Result<Usage> {
        match fs::read(self.full(&ns.fsinfo_path)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::integrity(format!("corrupt fsinfo: {}", e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Usage::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_inode_usage(&self, ns: &Namespace, inodes: u64) -> Result<()> {
        let mut usage = self.usage(ns)?;
        usage.inodes = inodes;
        self.write_usage(ns, usage)
    }

    fn set_data_usage(&self, ns: &Namespace, bytes: u64) -> Result<()> {
        let mut usage = self.usage(ns)?;
        usage.bytes = bytes;
        self.write_usage(ns, usage)
    }

    fn ensure_namespace(&self, ns: &Namespace) -> Result<()> {
        self.mkdir_all(&ns.md_path.join("refs"))?;

        // trash scatter tree: <trash>/<ns>.<shard>/<hi>/<med>/<lo>
        let shard_root = ns.trash_root.join(format!("{}.0", ns.name));
        for hi in 0..TRASH_SCATTER_BREADTH {
            for med in 0..TRASH_SCATTER_BREADTH {
                for lo in 0..TRASH_SCATTER_BREADTH {
                    let dir = shard_root
                        .join(hi.to_string())
                        .join(med.to_string())
                        .join(lo.to_string());
                    self.mkdir_all(&dir)?;
                    // ordinary users must be able to file deletions here
                    set_mode_bits(&self.full(&dir), 0o1777)?;
                }
            }
        }
        Ok(())
    }
}

impl PosixMdal {
    fn write_usage(&self, ns: &Namespace, usage: Usage) -> Result<()> {
        let path = self.full(&ns.fsinfo_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(&usage)
            .map_err(|e| Error::integrity(format!("fsinfo serialization failed: {}", e)))?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode_bits(full: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(full, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode_bits(_full: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn mdal() -> (TempDir, PosixMdal) {
        let dir = TempDir::new().unwrap();
        let mdal = PosixMdal::new(dir.path().join("mdfs")).unwrap();
        (dir, mdal)
    }

    #[test]
    fn test_create_open_read_write() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("ns/refs/000/str_a.0");

        let mut handle = mdal.create(&path, 0o600).unwrap();
        handle.write(b"hello").unwrap();
        drop(handle);

        let mut handle = mdal.open(&path, false).unwrap();
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_create_existing_fails() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("f");
        mdal.create(&path, 0o600).unwrap();
        assert!(mdal.create(&path, 0o600).is_err());
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let (_dir, mdal) = mdal();
        let err = mdal.open(&PathBuf::from("absent"), false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_xattr_round_trip() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("f");
        mdal.create(&path, 0o600).unwrap();

        mdal.set_xattr(&path, "marfs_objid", "payload").unwrap();
        assert_eq!(mdal.get_xattr(&path, "marfs_objid").unwrap().as_deref(), Some("payload"));

        mdal.set_xattr(&path, "marfs_post", "p2").unwrap();
        let mut names = mdal.list_xattrs(&path).unwrap();
        names.sort();
        assert_eq!(names, vec!["marfs_objid", "marfs_post"]);

        mdal.remove_xattr(&path, "marfs_objid").unwrap();
        assert_eq!(mdal.get_xattr(&path, "marfs_objid").unwrap(), None);
        // removing an absent attr is success
        mdal.remove_xattr(&path, "marfs_objid").unwrap();
    }

    #[test]
    fn test_unlink_removes_sidecar() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("f");
        mdal.create(&path, 0o600).unwrap();
        mdal.set_xattr(&path, "marfs_objid", "x").unwrap();
        mdal.unlink(&path).unwrap();
        assert!(mdal.open(&path, false).is_err());
        // a fresh file at the same path sees no stale attrs
        mdal.create(&path, 0o600).unwrap();
        assert_eq!(mdal.get_xattr(&path, "marfs_objid").unwrap(), None);
    }

    #[test]
    fn test_scanner_classifies_and_hides_sidecars() {
        let (_dir, mdal) = mdal();
        let dir = PathBuf::from("refs/000");
        mdal.create(&dir.join("str_aa.bb.0.0"), 0o600).unwrap();
        mdal.create(&dir.join("str_aa.bb.0.1"), 0o600).unwrap();
        mdal.create(&dir.join("rebuild_obj_1700000000"), 0o600).unwrap();
        mdal.set_xattr(&dir.join("str_aa.bb.0.0"), "marfs_objid", "x").unwrap();

        let mut scanner = mdal.scan(&dir).unwrap();
        let mut kinds = Vec::new();
        while let Some(entry) = scanner.next_entry().unwrap() {
            kinds.push(entry.kind);
        }
        assert_eq!(
            kinds,
            vec![
                RefEntryKind::RebuildMarker,
                RefEntryKind::StreamStart,
                RefEntryKind::StreamFile,
            ]
        );
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let (_dir, mdal) = mdal();
        let mut scanner = mdal.scan(&PathBuf::from("refs/xyz")).unwrap();
        assert!(scanner.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_symlink_round_trip() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("links/l");
        mdal.symlink("/target/path", &path).unwrap();
        assert_eq!(mdal.read_link(&path).unwrap(), "/target/path");
        assert!(mdal.stat(&path).unwrap().is_symlink);
    }

    #[test]
    fn test_set_times() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("f");
        mdal.create(&path, 0o600).unwrap();
        mdal.set_times(&path, 1_600_000_000, 1_500_000_000).unwrap();
        let stat = mdal.stat(&path).unwrap();
        assert_eq!(stat.atime, 1_600_000_000);
        assert_eq!(stat.mtime, 1_500_000_000);
    }

    #[test]
    fn test_truncate_and_len() {
        let (_dir, mdal) = mdal();
        let path = PathBuf::from("f");
        let mut handle = mdal.create(&path, 0o600).unwrap();
        handle.write(&[7u8; 100]).unwrap();
        assert_eq!(handle.len().unwrap(), 100);
        handle.set_len(42).unwrap();
        assert_eq!(handle.len().unwrap(), 42);
    }
}
