//! MDFS path composition
//!
//! The metadata layout beneath one namespace's `md_path`:
//!
//! ```text
//! <md_path>/refs/<d0>/<d1>/.../str_<streamid>.<fileno>   reference tree
//! <md_path>/files/<user-relative-path>                   user-tree links
//! <md_path>/fsinfo                                       usage counters
//! <trash_root>/<ns>.<shard>/<hi>/<med>/<lo>/<name>.trash_<ino>_<ts>
//! ```
//!
//! User-tree entries are symlinks whose target is the MDAL-root-relative
//! reference path, so resolving a user file never needs the stream hash.

use std::path::{Path, PathBuf};

use marfs_core::config::{MarfsConfig, NsId};
use marfs_access::mdal::stream_file_name;

/// Reference directory holding a stream's files.
pub fn ref_dir(config: &MarfsConfig, ns: NsId, stream_id: &str) -> PathBuf {
    config
        .namespace(ns)
        .md_path
        .join("refs")
        .join(config.reference_path(ns, stream_id))
}

/// Reference directory for an enumerated leaf slot.
pub fn ref_dir_for_slot(config: &MarfsConfig, ns: NsId, slot: u64) -> PathBuf {
    config
        .namespace(ns)
        .md_path
        .join("refs")
        .join(config.reference_dir(ns, slot))
}

/// Reference file of one stream member.
pub fn ref_file(config: &MarfsConfig, ns: NsId, stream_id: &str, file_no: u64) -> PathBuf {
    ref_dir(config, ns, stream_id).join(stream_file_name(stream_id, file_no))
}

/// User-tree path of a namespace-relative user path.
pub fn user_file(config: &MarfsConfig, ns: NsId, rel: &str) -> PathBuf {
    let rel = rel.trim_start_matches('/');
    config.namespace(ns).md_path.join("files").join(rel)
}

/// Trash entry path: scatter by the last three decimal digits of the
/// inode, entry named `<basename>.trash_<inode>_<timestamp>`.
pub fn trash_file(
    config: &MarfsConfig,
    ns: NsId,
    basename: &str,
    inode: u64,
    timestamp: i64,
) -> PathBuf {
    let namespace = config.namespace(ns);
    let hi = (inode / 100) % 10;
    let med = (inode / 10) % 10;
    let lo = inode % 10;
    namespace
        .trash_root
        .join(format!("{}.0", namespace.name))
        .join(hi.to_string())
        .join(med.to_string())
        .join(lo.to_string())
        .join(format!("{}.trash_{}_{}", basename, inode, timestamp))
}

/// Companion path file of a trash entry.
pub fn companion_file(trash_entry: &Path) -> PathBuf {
    let mut name = trash_entry
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".path");
    trash_entry.with_file_name(name)
}
