//! Iteration summary log
//!
//! The manager writes one `summary.log` at the iteration root before any
//! work is dispatched, mirroring the program arguments literally. Its
//! presence marks an iteration that started cleanly; a later run parses
//! it back to replay an aborted dry-run (`-X`) or to decide whether an
//! old iteration is safe to pick up.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use marfs_core::error::{Error, Result};
use marfs_core::tag::ConfigVersion;

use crate::walker::{RebuildLoc, Thresholds};

/// The argument set a run executes under, as mirrored in the summary log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Config version the run was validated against
    pub config_version: ConfigVersion,
    /// Namespace target path (`.` = root)
    pub ns_target: String,
    /// Recurse into subspaces
    pub recurse: bool,
    /// Iteration name
    pub iteration: String,
    /// Dry-run (record mode)
    pub dryrun: bool,
    /// Set namespace usage values
    pub quotas: bool,
    /// Threshold cutoffs (epoch seconds; absent = op disabled)
    pub thresholds: Thresholds,
    /// Location filter for rebuilds
    pub rebuild_location: Option<RebuildLoc>,
}

impl RunArgs {
    /// Serialize to the summary-log text form.
    pub fn to_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("config_version = {}\n", self.config_version));
        out.push_str(&format!("ns_target = {}\n", self.ns_target));
        out.push_str(&format!("recurse = {}\n", self.recurse as u8));
        out.push_str(&format!("iteration = {}\n", self.iteration));
        out.push_str(&format!("dryrun = {}\n", self.dryrun as u8));
        out.push_str(&format!("quotas = {}\n", self.quotas as u8));
        out.push_str(&format!("gc_threshold = {}\n", opt(self.thresholds.gc)));
        out.push_str(&format!("rebuild_threshold = {}\n", opt(self.thresholds.rebuild)));
        out.push_str(&format!("repack_threshold = {}\n", opt(self.thresholds.repack)));
        out.push_str(&format!("cleanup_threshold = {}\n", opt(self.thresholds.cleanup)));
        match &self.rebuild_location {
            Some(loc) => out.push_str(&format!(
                "rebuild_location = p{}-c{}-s{}\n",
                fmt_loc(loc.pod),
                fmt_loc(loc.cap),
                fmt_loc(loc.scatter)
            )),
            None => out.push_str("rebuild_location = -\n"),
        }
        out
    }

    /// Parse the summary-log text form back.
    pub fn from_summary(text: &str) -> Result<RunArgs> {
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::integrity(format!("malformed summary line \"{}\"", line)))?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }

        let get = |key: &str| -> Result<&String> {
            fields
                .get(key)
                .ok_or_else(|| Error::integrity(format!("summary missing \"{}\"", key)))
        };

        let vers_raw = get("config_version")?;
        let (major, minor) = vers_raw
            .split_once('.')
            .ok_or_else(|| Error::integrity("summary: bad config version"))?;
        let config_version = ConfigVersion::new(
            major.parse().map_err(|_| Error::integrity("summary: bad major version"))?,
            minor.parse().map_err(|_| Error::integrity("summary: bad minor version"))?,
        );

        let rebuild_location = match get("rebuild_location")?.as_str() {
            "-" => None,
            raw => Some(parse_loc(raw)?),
        };

        Ok(RunArgs {
            config_version,
            ns_target: get("ns_target")?.clone(),
            recurse: get("recurse")? == "1",
            iteration: get("iteration")?.clone(),
            dryrun: get("dryrun")? == "1",
            quotas: get("quotas")? == "1",
            thresholds: Thresholds {
                gc: parse_opt(get("gc_threshold")?)?,
                rebuild: parse_opt(get("rebuild_threshold")?)?,
                repack: parse_opt(get("repack_threshold")?)?,
                cleanup: parse_opt(get("cleanup_threshold")?)?,
            },
            rebuild_location,
        })
    }

    /// Write the summary file for an iteration.
    pub fn write_summary(&self, iteration_root: &Path) -> Result<()> {
        fs::create_dir_all(iteration_root)?;
        let path = iteration_root.join(crate::log::SUMMARY_FILENAME);
        fs::write(&path, self.to_summary())?;
        Ok(())
    }

    /// Read the summary file of an iteration.
    pub fn read_summary(iteration_root: &Path) -> Result<RunArgs> {
        let path = iteration_root.join(crate::log::SUMMARY_FILENAME);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_summary(&text)
    }
}

fn opt(v: Option<i64>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

fn parse_opt(s: &str) -> Result<Option<i64>> {
    if s == "-" {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| Error::integrity(format!("summary: bad threshold \"{}\"", s)))
}

fn fmt_loc(v: Option<usize>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "*".to_string(),
    }
}

fn parse_loc(raw: &str) -> Result<RebuildLoc> {
    let mut loc = RebuildLoc::default();
    for part in raw.split('-').filter(|p| !p.is_empty()) {
        if !part.is_char_boundary(1) {
            return Err(Error::integrity(format!(
                "summary: bad rebuild location component \"{}\"",
                part
            )));
        }
        let (kind, value) = part.split_at(1);
        let parsed = if value == "*" {
            None
        } else {
            Some(value.parse().map_err(|_| {
                Error::integrity(format!("summary: bad rebuild location \"{}\"", raw))
            })?)
        };
        match kind {
            "p" => loc.pod = parsed,
            "c" => loc.cap = parsed,
            "s" => loc.scatter = parsed,
            _ => {
                return Err(Error::integrity(format!(
                    "summary: bad rebuild location component \"{}\"",
                    part
                )))
            }
        }
    }
    Ok(loc)
}
