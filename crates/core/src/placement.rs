//! Placement: pure computations over the configuration
//!
//! Everything here is deterministic arithmetic on the config arena:
//! no I/O. The four mappings:
//!
//! - absolute path -> namespace-relative sub-path
//! - sub-path -> namespace (longest mount-prefix match)
//! - (namespace, file size, interactivity) -> repo
//! - stream id -> reference path; object name -> (pod, cap, scatter)

use std::path::PathBuf;

use xxhash_rust::xxh3::xxh3_64;

use crate::config::{MarfsConfig, NsId, RepoId};
use crate::error::{Error, Result};

// Distinct seeds keep the three location lookups independent.
const POD_SEED: u64 = 0x706f64;
const CAP_SEED: u64 = 0x636170;
const SCATTER_SEED: u64 = 0x73636174;

/// A fully resolved object location within a repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLocation {
    /// Pod index
    pub pod: usize,
    /// Capacity-unit index
    pub cap: usize,
    /// Scatter index
    pub scatter: usize,
}

impl MarfsConfig {
    /// Strip the configured mount top from an absolute path.
    ///
    /// Returns `"/"` for an exact match and `None` for paths outside the
    /// mount. The match is component-exact: `/mnt_topfoo` does not match a
    /// mount top of `/mnt_top`.
    pub fn resolve_sub_path<'a>(&self, absolute: &'a str) -> Option<&'a str> {
        if absolute == self.mnt_top {
            return Some("/");
        }
        let rest = absolute.strip_prefix(&self.mnt_top)?;
        if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Longest-prefix match of a sub-path against all namespace mounts.
    pub fn find_namespace(&self, sub_path: &str) -> Result<NsId> {
        if !sub_path.starts_with('/') {
            return Err(Error::NotMarfs(sub_path.to_string()));
        }

        let mut best: Option<(usize, NsId)> = None;
        for (id, ns) in self.namespaces() {
            let matched = if ns.mnt_path == "/" {
                true
            } else {
                sub_path == ns.mnt_path
                    || sub_path
                        .strip_prefix(ns.mnt_path.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            };
            if matched {
                let len = ns.mnt_path.len();
                if best.map_or(true, |(blen, _)| len > blen) {
                    best = Some((len, id));
                }
            }
        }

        best.map(|(_, id)| id)
            .ok_or_else(|| Error::NotMarfs(sub_path.to_string()))
    }

    /// Choose the repo for a new file of the given size.
    ///
    /// Interactive writes always use the namespace's interactive repo;
    /// batch writes consult the range list, falling back to the
    /// interactive repo when no ranges are configured.
    pub fn find_repo(&self, ns: NsId, file_size: u64, interactive: bool) -> RepoId {
        let ns = self.namespace(self.resolve_ghost(ns));
        if interactive || ns.range_list.is_empty() {
            return ns.iwrite_repo;
        }
        for range in &ns.range_list {
            let covered = file_size >= range.min
                && range.max.map_or(true, |max| file_size <= max);
            if covered {
                return range.repo;
            }
        }
        // load-time validation guarantees full coverage; the final entry
        // is unbounded
        ns.range_list.last().map(|r| r.repo).unwrap_or(ns.iwrite_repo)
    }

    /// Total number of reference-tree leaf directories for a namespace.
    pub fn reference_slots(&self, ns: NsId) -> u64 {
        let repo = self.repo(self.namespace(ns).repo);
        (repo.rbreadth as u64).pow(repo.rdepth as u32)
    }

    /// Reference directory for a leaf-slot index: `rdepth` components of
    /// zero-padded base-`rbreadth` digits.
    pub fn reference_dir(&self, ns: NsId, slot: u64) -> PathBuf {
        let repo = self.repo(self.namespace(ns).repo);
        let mut components = vec![String::new(); repo.rdepth];
        let mut rem = slot;
        for level in (0..repo.rdepth).rev() {
            let digit = rem % repo.rbreadth as u64;
            rem /= repo.rbreadth as u64;
            components[level] = format!("{:0width$}", digit, width = repo.rdigits);
        }
        components.iter().collect()
    }

    /// Deterministic reference directory for a stream id.
    pub fn reference_path(&self, ns: NsId, stream_id: &str) -> PathBuf {
        let slot = xxh3_64(stream_id.as_bytes()) % self.reference_slots(ns);
        self.reference_dir(ns, slot)
    }

    /// Three independent weighted lookups for an object name.
    pub fn object_location(&self, repo: RepoId, object_id: &str) -> ObjectLocation {
        let repo = self.repo(repo);
        ObjectLocation {
            pod: repo.pods.select(object_id, POD_SEED),
            cap: repo.caps.select(object_id, CAP_SEED),
            scatter: repo.scatters.select(object_id, SCATTER_SEED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    fn config_with(extra: &str) -> MarfsConfig {
        let doc = format!(
            r#"
version = "1.0"
mnt_top = "/campaign"

[[repo]]
name = "main"

[repo.data.protection]
n = 10
e = 2
psz = 1024

[repo.data.packing]
enabled = false
max_files = 1

[repo.data.chunking]
enabled = true
max_size = "1M"

[repo.data.distribution]
pods = {{ cnt = 4 }}
caps = {{ cnt = 4 }}
scatters = {{ cnt = 16 }}

[repo.meta.namespaces]
rbreadth = 10
rdepth = 3
rdigits = 3

[[repo.meta.namespaces.ns]]
name = "root"
perms = {{ interactive = "RM,WM,RD,WD", batch = "RM,WM,RD,WD" }}
{}
"#,
            extra
        );
        ConfigLoader::from_str(&doc).unwrap()
    }

    #[test]
    fn test_resolve_sub_path_exact() {
        let cfg = config_with("");
        assert_eq!(cfg.resolve_sub_path("/campaign"), Some("/"));
    }

    #[test]
    fn test_resolve_sub_path_inside() {
        let cfg = config_with("");
        assert_eq!(cfg.resolve_sub_path("/campaign/a/b"), Some("/a/b"));
    }

    #[test]
    fn test_resolve_sub_path_rejects_partial_component() {
        let cfg = config_with("");
        assert_eq!(cfg.resolve_sub_path("/campaignfoo"), None);
        assert_eq!(cfg.resolve_sub_path("/elsewhere"), None);
    }

    #[test]
    fn test_find_namespace_longest_prefix() {
        let extra = r#"
[[repo.meta.namespaces.ns.ns]]
name = "proj"
perms = { interactive = "RM,WM,RD,WD", batch = "RM,WM,RD,WD" }

[[repo.meta.namespaces.ns.ns.ns]]
name = "deep"
perms = { interactive = "RM,WM,RD,WD", batch = "RM,WM,RD,WD" }
"#;
        let cfg = config_with(extra);
        let root = cfg.find_namespace("/file").unwrap();
        assert_eq!(cfg.namespace(root).mnt_path, "/");
        let proj = cfg.find_namespace("/proj/file").unwrap();
        assert_eq!(cfg.namespace(proj).mnt_path, "/proj");
        let deep = cfg.find_namespace("/proj/deep/file").unwrap();
        assert_eq!(cfg.namespace(deep).mnt_path, "/proj/deep");
        // partial component must not match the deeper namespace
        let projx = cfg.find_namespace("/projx").unwrap();
        assert_eq!(cfg.namespace(projx).mnt_path, "/");
    }

    #[test]
    fn test_find_repo_interactive() {
        let cfg = config_with("");
        let repo = cfg.find_repo(cfg.root(), 123, true);
        assert_eq!(cfg.repo(repo).name, "main");
    }

    #[test]
    fn test_find_repo_ranges() {
        let extra = r#"
[[repo]]
name = "bulk"

[repo.data.protection]
n = 10
e = 2
psz = 1024

[repo.data.packing]
enabled = false
max_files = 1

[repo.data.chunking]
enabled = true
max_size = "4M"

[repo.data.distribution]
pods = { cnt = 1 }
caps = { cnt = 1 }
scatters = { cnt = 1 }

[repo.meta.namespaces]
rbreadth = 10
rdepth = 1
rdigits = 2
"#;
        let ranges = r#"
[[repo.meta.namespaces.ns.range]]
min = "0"
max = "1K"
repo = "main"

[[repo.meta.namespaces.ns.range]]
min = "1025"
repo = "bulk"
"#;
        // note: "bulk" repo is appended after the root repo definition
        let doc = format!("{}{}", ranges, extra);
        let cfg = config_with(&doc);

        let small = cfg.find_repo(cfg.root(), 1024, false);
        assert_eq!(cfg.repo(small).name, "main");
        let big = cfg.find_repo(cfg.root(), 1025, false);
        assert_eq!(cfg.repo(big).name, "bulk");
        // interactive ignores ranges
        let inter = cfg.find_repo(cfg.root(), 10 << 20, true);
        assert_eq!(cfg.repo(inter).name, "main");
    }

    #[test]
    fn test_reference_path_shape() {
        let cfg = config_with("");
        let path = cfg.reference_path(cfg.root(), "0000002a.0000.0");
        let comps: Vec<_> = path.iter().map(|c| c.to_str().unwrap().to_string()).collect();
        assert_eq!(comps.len(), 3);
        for comp in &comps {
            assert_eq!(comp.len(), 3);
            let v: u64 = comp.parse().unwrap();
            assert!(v < 10);
        }
    }

    #[test]
    fn test_reference_path_deterministic() {
        let cfg = config_with("");
        let a = cfg.reference_path(cfg.root(), "stream-x");
        let b = cfg.reference_path(cfg.root(), "stream-x");
        assert_eq!(a, b);
    }

    #[test]
    fn test_reference_dir_round_trip() {
        let cfg = config_with("");
        assert_eq!(cfg.reference_slots(cfg.root()), 1000);
        let dir = cfg.reference_dir(cfg.root(), 123);
        assert_eq!(dir, PathBuf::from("001/002/003"));
    }

    #[test]
    fn test_object_location_in_bounds() {
        let cfg = config_with("");
        let repo = cfg.namespace(cfg.root()).repo;
        for i in 0..64 {
            let loc = cfg.object_location(repo, &format!("obj-{}", i));
            assert!(loc.pod < 4);
            assert!(loc.cap < 4);
            assert!(loc.scatter < 16);
        }
    }

    #[test]
    fn test_object_location_deterministic() {
        let cfg = config_with("");
        let repo = cfg.namespace(cfg.root()).repo;
        assert_eq!(cfg.object_location(repo, "obj"), cfg.object_location(repo, "obj"));
    }
}
