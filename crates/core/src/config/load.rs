//! Config loading and validation
//!
//! Raw serde structures mirror the config document one-to-one; lowering
//! turns them into the id-indexed arena of [`MarfsConfig`], rejecting every
//! structural problem eagerly so the rest of the system never revalidates:
//!
//! - reserved characters in namespace names (`/ | ( ) #`)
//! - permission and quota syntax
//! - batch range lists that overlap, gap, or bury the unbounded entry
//! - distribution tables with bad overrides or zero total weight
//! - ghost redirection cycles and ghosts that claim storage
//! - reference-tree geometry that cannot be zero-padded as configured

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{
    parse_size, DirectSpec, Erasure, MarfsConfig, Namespace, NsId, Perms, Quota, Repo, RepoId,
    RepoRange,
};
use crate::distribution::DistTable;
use crate::error::{Error, Result};
use crate::tag::ConfigVersion;

/// Characters rejected inside namespace names.
const RESERVED_NS_CHARS: &[char] = &['/', '|', '(', ')', '#'];

// ============================================================================
// Raw document shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawConfig {
    version: String,
    mnt_top: String,
    #[serde(default)]
    hosts: String,
    #[serde(default, rename = "repo")]
    repos: Vec<RawRepo>,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    name: String,
    data: RawData,
    meta: RawMeta,
}

#[derive(Debug, Deserialize)]
struct RawData {
    protection: RawProtection,
    packing: RawPacking,
    chunking: RawChunking,
    distribution: RawDistribution,
    #[serde(default = "empty_table")]
    dal: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

#[derive(Debug, Deserialize)]
struct RawProtection {
    n: u32,
    e: u32,
    psz: u64,
}

#[derive(Debug, Deserialize)]
struct RawPacking {
    enabled: bool,
    max_files: u64,
}

#[derive(Debug, Deserialize)]
struct RawChunking {
    enabled: bool,
    max_size: String,
    #[serde(default)]
    at_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDistribution {
    pods: RawDist,
    caps: RawDist,
    scatters: RawDist,
}

#[derive(Debug, Deserialize)]
struct RawDist {
    cnt: usize,
    #[serde(default = "default_weight")]
    dweight: u64,
    #[serde(default)]
    weights: String,
}

fn default_weight() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    namespaces: RawNamespaces,
    #[serde(default)]
    direct: RawDirect,
    #[serde(default = "empty_table")]
    mdal: toml::Value,
}

#[derive(Debug, Deserialize)]
struct RawNamespaces {
    rbreadth: usize,
    rdepth: usize,
    rdigits: usize,
    #[serde(default, rename = "ns")]
    list: Vec<RawNs>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDirect {
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
    #[serde(default)]
    write_chunks: u64,
}

#[derive(Debug, Deserialize)]
struct RawNs {
    name: String,
    perms: RawPerms,
    #[serde(default)]
    quotas: RawQuotas,
    #[serde(default)]
    iwrite_repo: Option<String>,
    #[serde(default, rename = "range")]
    ranges: Vec<RawRange>,
    #[serde(default)]
    ghost: Option<String>,
    #[serde(default)]
    trash: Option<String>,
    #[serde(default, rename = "ns")]
    subspaces: Vec<RawNs>,
}

#[derive(Debug, Deserialize)]
struct RawPerms {
    interactive: String,
    batch: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawQuotas {
    #[serde(default)]
    files: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    min: String,
    #[serde(default)]
    max: Option<String>,
    repo: String,
}

// ============================================================================
// Loader
// ============================================================================

/// Builds a validated [`MarfsConfig`] from a TOML document.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate from a file path.
    pub fn from_file(path: &Path) -> Result<MarfsConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config \"{}\": {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Load and validate from document text.
    pub fn from_str(content: &str) -> Result<MarfsConfig> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        lower(raw)
    }
}

fn parse_version(s: &str) -> Result<ConfigVersion> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| Error::config(format!("bad version string \"{}\"", s)))?;
    Ok(ConfigVersion::new(
        major
            .parse()
            .map_err(|_| Error::config(format!("bad major version \"{}\"", major)))?,
        minor
            .parse()
            .map_err(|_| Error::config(format!("bad minor version \"{}\"", minor)))?,
    ))
}

fn lower(raw: RawConfig) -> Result<MarfsConfig> {
    let version = parse_version(&raw.version)?;

    if raw.mnt_top.is_empty() || !raw.mnt_top.starts_with('/') {
        return Err(Error::config(format!(
            "mnt_top must be an absolute path, got \"{}\"",
            raw.mnt_top
        )));
    }
    let mnt_top = raw.mnt_top.trim_end_matches('/').to_string();
    let mnt_top = if mnt_top.is_empty() { "/".to_string() } else { mnt_top };

    if raw.repos.is_empty() {
        return Err(Error::config("config defines no repos"));
    }

    // first pass: repos
    let mut repos = Vec::with_capacity(raw.repos.len());
    for raw_repo in &raw.repos {
        if repos.iter().any(|r: &Repo| r.name == raw_repo.name) {
            return Err(Error::config(format!("duplicate repo name \"{}\"", raw_repo.name)));
        }
        repos.push(lower_repo(raw_repo)?);
    }

    // second pass: namespaces, depth-first per repo
    let mut builder = NsBuilder {
        repos: &repos,
        namespaces: Vec::new(),
        ghost_targets: Vec::new(),
    };
    let mut root = None;
    for (repo_idx, raw_repo) in raw.repos.iter().enumerate() {
        for raw_ns in &raw_repo.meta.namespaces.list {
            let is_root = raw_ns.name == "root";
            let id = builder.lower_ns(raw_ns, RepoId(repo_idx), None, is_root)?;
            if is_root {
                if root.is_some() {
                    return Err(Error::config("multiple root namespaces defined"));
                }
                root = Some(id);
            }
        }
    }
    let root = root.ok_or_else(|| Error::config("no root namespace defined"))?;

    // third pass: resolve ghost redirections
    let NsBuilder { mut namespaces, ghost_targets, .. } = builder;
    for (id, target) in ghost_targets {
        let target_id = namespaces
            .iter()
            .position(|n: &Namespace| n.id_str == target)
            .map(NsId)
            .ok_or_else(|| {
                Error::config(format!("ghost namespace targets unknown id \"{}\"", target))
            })?;
        if target_id == id {
            return Err(Error::config(format!(
                "ghost namespace \"{}\" targets itself",
                namespaces[id.0].id_str
            )));
        }
        namespaces[id.0].ghost = Some(target_id);
    }

    // ghost chains must terminate
    for idx in 0..namespaces.len() {
        let mut seen = 0;
        let mut cur = NsId(idx);
        while let Some(next) = namespaces[cur.0].ghost {
            cur = next;
            seen += 1;
            if seen > namespaces.len() {
                return Err(Error::config(format!(
                    "ghost redirection cycle involving \"{}\"",
                    namespaces[idx].id_str
                )));
            }
        }
    }

    Ok(MarfsConfig {
        version,
        mnt_top,
        hosts: raw.hosts,
        repos,
        namespaces,
        root,
    })
}

fn lower_repo(raw: &RawRepo) -> Result<Repo> {
    let chunk_size = parse_size(&raw.data.chunking.max_size)?;
    if chunk_size == 0 {
        return Err(Error::config(format!("repo \"{}\" has zero chunk size", raw.name)));
    }
    let chunk_at_size = match &raw.data.chunking.at_size {
        Some(s) => parse_size(s)?,
        None => chunk_size,
    };

    let geometry = &raw.meta.namespaces;
    if geometry.rbreadth == 0 || geometry.rdepth == 0 {
        return Err(Error::config(format!(
            "repo \"{}\" reference tree must have non-zero breadth and depth",
            raw.name
        )));
    }
    let digits_needed = (geometry.rbreadth - 1).to_string().len();
    if geometry.rdigits < digits_needed {
        return Err(Error::config(format!(
            "repo \"{}\": rdigits {} cannot represent breadth {}",
            raw.name, geometry.rdigits, geometry.rbreadth
        )));
    }
    (geometry.rbreadth as u64)
        .checked_pow(geometry.rdepth as u32)
        .ok_or_else(|| {
            Error::config(format!("repo \"{}\": reference tree slot count overflows", raw.name))
        })?;

    Ok(Repo {
        name: raw.name.clone(),
        chunk_size,
        chunk_at_size,
        chunking: raw.data.chunking.enabled,
        max_pack_files: raw.data.packing.max_files,
        packing: raw.data.packing.enabled,
        erasure: Erasure {
            n: raw.data.protection.n,
            e: raw.data.protection.e,
            partsz: raw.data.protection.psz,
        },
        pods: lower_dist(&raw.data.distribution.pods, raw, "pods")?,
        caps: lower_dist(&raw.data.distribution.caps, raw, "caps")?,
        scatters: lower_dist(&raw.data.distribution.scatters, raw, "scatters")?,
        direct: DirectSpec {
            read: raw.meta.direct.read,
            write: raw.meta.direct.write,
            write_chunks: raw.meta.direct.write_chunks,
        },
        rbreadth: geometry.rbreadth,
        rdepth: geometry.rdepth,
        rdigits: geometry.rdigits,
        dal: raw.data.dal.clone(),
        mdal: raw.meta.mdal.clone(),
    })
}

fn lower_dist(raw: &RawDist, repo: &RawRepo, which: &str) -> Result<DistTable> {
    DistTable::new(raw.cnt, raw.dweight, &raw.weights).map_err(|e| {
        Error::config(format!("repo \"{}\" {} table: {}", repo.name, which, e))
    })
}

struct NsBuilder<'a> {
    repos: &'a [Repo],
    namespaces: Vec<Namespace>,
    ghost_targets: Vec<(NsId, String)>,
}

impl NsBuilder<'_> {
    fn lower_ns(
        &mut self,
        raw: &RawNs,
        repo: RepoId,
        parent: Option<NsId>,
        is_root: bool,
    ) -> Result<NsId> {
        if raw.name.is_empty() {
            return Err(Error::config("namespace with empty name"));
        }
        if let Some(bad) = raw.name.chars().find(|c| RESERVED_NS_CHARS.contains(c)) {
            return Err(Error::config(format!(
                "namespace name \"{}\" contains reserved character '{}'",
                raw.name, bad
            )));
        }

        let repo_name = &self.repos[repo.0].name;
        let (id_str, mnt_path, md_path) = match parent {
            None => (
                format!("{}|{}", repo_name, raw.name),
                if is_root { "/".to_string() } else { format!("/{}", raw.name) },
                PathBuf::from(&raw.name),
            ),
            Some(pid) => {
                let pns = &self.namespaces[pid.0];
                let mnt = if pns.mnt_path == "/" {
                    format!("/{}", raw.name)
                } else {
                    format!("{}/{}", pns.mnt_path, raw.name)
                };
                (
                    format!("{}|{}", pns.id_str, raw.name),
                    mnt,
                    pns.md_path.join(&raw.name),
                )
            }
        };

        let iperms = Perms::parse(&raw.perms.interactive)?;
        let bperms = Perms::parse(&raw.perms.batch)?;

        let quota_files = lower_quota(&raw.quotas.files)?;
        let quota_space = lower_quota(&raw.quotas.data)?;

        let iwrite_repo = match &raw.iwrite_repo {
            Some(name) => self
                .repos
                .iter()
                .position(|r| &r.name == name)
                .map(RepoId)
                .ok_or_else(|| {
                    Error::config(format!("namespace \"{}\": unknown iwrite repo \"{}\"", id_str, name))
                })?,
            None => repo,
        };

        let range_list = self.lower_ranges(&raw.ranges, &id_str)?;

        if raw.ghost.is_some() && (!raw.subspaces.is_empty() || !raw.ranges.is_empty()) {
            return Err(Error::config(format!(
                "ghost namespace \"{}\" may not own subspaces or ranges",
                id_str
            )));
        }

        let trash_root = match &raw.trash {
            Some(t) => PathBuf::from(t),
            None => match parent {
                Some(pid) => self.namespaces[pid.0].trash_root.clone(),
                None => PathBuf::from("trash"),
            },
        };

        let id = NsId(self.namespaces.len());
        self.namespaces.push(Namespace {
            id_str,
            name: raw.name.clone(),
            mnt_path,
            fsinfo_path: md_path.join("fsinfo"),
            md_path,
            trash_root,
            iperms,
            bperms,
            quota_files,
            quota_space,
            iwrite_repo,
            range_list,
            repo,
            ghost: None,
            parent,
            subspaces: BTreeMap::new(),
        });

        if let Some(target) = &raw.ghost {
            self.ghost_targets.push((id, target.clone()));
        }

        let mut children = BTreeMap::new();
        for sub in &raw.subspaces {
            if children.contains_key(&sub.name) {
                return Err(Error::config(format!(
                    "namespace \"{}\" has duplicate subspace \"{}\"",
                    self.namespaces[id.0].id_str, sub.name
                )));
            }
            let child = self.lower_ns(sub, repo, Some(id), false)?;
            children.insert(sub.name.clone(), child);
        }
        self.namespaces[id.0].subspaces = children;

        Ok(id)
    }

    /// Validate a batch range list: ascending, contiguous from zero, with
    /// exactly one unbounded entry in final position.
    fn lower_ranges(&self, raws: &[RawRange], ns: &str) -> Result<Vec<RepoRange>> {
        if raws.is_empty() {
            return Ok(Vec::new());
        }

        let mut ranges = Vec::with_capacity(raws.len());
        for raw in raws {
            let repo = self
                .repos
                .iter()
                .position(|r| r.name == raw.repo)
                .map(RepoId)
                .ok_or_else(|| {
                    Error::config(format!("namespace \"{}\": unknown range repo \"{}\"", ns, raw.repo))
                })?;
            let min = parse_size(&raw.min)?;
            let max = raw.max.as_deref().map(parse_size).transpose()?;
            if let Some(max) = max {
                if max < min {
                    return Err(Error::config(format!(
                        "namespace \"{}\": range max {} below min {}",
                        ns, max, min
                    )));
                }
            }
            ranges.push(RepoRange { min, max, repo });
        }

        ranges.sort_by_key(|r| r.min);

        if ranges[0].min != 0 {
            return Err(Error::config(format!(
                "namespace \"{}\": range list does not start at zero",
                ns
            )));
        }
        for window in ranges.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            match a.max {
                None => {
                    return Err(Error::config(format!(
                        "namespace \"{}\": unbounded range is not last",
                        ns
                    )))
                }
                Some(amax) if b.min != amax + 1 => {
                    return Err(Error::config(format!(
                        "namespace \"{}\": ranges {}..{} and {}.. overlap or gap",
                        ns, a.min, amax, b.min
                    )))
                }
                _ => {}
            }
        }
        if ranges.last().unwrap().max.is_some() {
            return Err(Error::config(format!(
                "namespace \"{}\": range list lacks an unbounded final entry",
                ns
            )));
        }

        Ok(ranges)
    }
}

fn lower_quota(raw: &Option<String>) -> Result<Quota> {
    match raw {
        Some(s) => Ok(Quota { limit: parse_size(s)?, enforced: true }),
        None => Ok(Quota::default()),
    }
}
