//! Resource log: the per-rank operation journal
//!
//! An append-only file of framed records:
//!
//! ```text
//! [length: u32][type: u8][payload: bincode][crc32: u32]
//! ```
//!
//! - **length**: size of type + payload + crc (not counting itself)
//! - **type**: 1 = operation start, 2 = operation completion
//! - **crc32**: over `[type][payload]`, detecting torn tails
//!
//! In *record* mode (dry-run) only start records are written: the plan.
//! In *modify* mode every op is journaled at start and again at
//! completion, so replay after a crash executes exactly the starts that
//! lack completions. Readers take the file exclusively (replay trims it);
//! writers serialize behind a per-log mutex owned by the caller.
//!
//! Log tree layout:
//!
//! ```text
//! <logroot>/<MODIFY|RECORD>/<iteration>/<ns-id-escaped>/<rank>.log
//! <logroot>/<MODIFY|RECORD>/<iteration>/summary.log
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use marfs_core::error::{Error, Result};

use crate::ops::Operation;

/// Parent directory of modify-mode iterations.
pub const MODIFY_ITERATION_PARENT: &str = "MODIFY";

/// Parent directory of record-mode (dry-run) iterations.
pub const RECORD_ITERATION_PARENT: &str = "RECORD";

/// Per-iteration summary file name.
pub const SUMMARY_FILENAME: &str = "summary.log";

const TYPE_START: u8 = 1;
const TYPE_COMPLETE: u8 = 2;

/// Journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Dry-run: plan only
    Record,
    /// Journal starts and completions around real execution
    Modify,
}

impl LogMode {
    /// The iteration-parent component for this mode.
    pub fn parent(self) -> &'static str {
        match self {
            LogMode::Record => RECORD_ITERATION_PARENT,
            LogMode::Modify => MODIFY_ITERATION_PARENT,
        }
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Operation dispatched (or planned, in record mode)
    Start(Operation),
    /// Operation finished
    Complete {
        /// Key of the started operation
        key: String,
        /// Whether execution succeeded
        success: bool,
    },
}

/// Root of one mode's log tree.
pub fn mode_root(logroot: &Path, mode: LogMode) -> PathBuf {
    logroot.join(mode.parent())
}

/// Directory of one iteration.
pub fn iteration_root(logroot: &Path, mode: LogMode, iteration: &str) -> PathBuf {
    mode_root(logroot, mode).join(iteration)
}

/// Path of one rank's log file.
pub fn log_path(
    logroot: &Path,
    mode: LogMode,
    iteration: &str,
    ns_escaped: &str,
    rank: usize,
) -> PathBuf {
    iteration_root(logroot, mode, iteration)
        .join(ns_escaped)
        .join(format!("{}.log", rank))
}

/// An open, exclusively locked journal.
pub struct ResourceLog {
    file: File,
    path: PathBuf,
    mode: LogMode,
}

impl ResourceLog {
    /// Open (appending) or create the journal at `path`.
    pub fn open(path: &Path, mode: LogMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::Fatal(format!("resource log \"{}\" is held by another process", path.display()))
        })?;
        Ok(ResourceLog { file, path: path.to_path_buf(), mode })
    }

    /// Journal mode.
    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// Journal path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the start (or plan) of an operation chain, before it is
    /// distributed to any consumer.
    pub fn log_start(&mut self, ops: &[Operation]) -> Result<()> {
        for op in ops {
            self.append(&LogEntry::Start(op.clone()))?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Record the completion of one operation. A failure to journal a
    /// completion is fatal to the rank: the journal would silently
    /// diverge from reality.
    pub fn log_complete(&mut self, op: &Operation, success: bool) -> Result<()> {
        debug_assert_eq!(self.mode, LogMode::Modify);
        self.append(&LogEntry::Complete { key: op.key(), success })?;
        self.file.sync_data()?;
        Ok(())
    }

    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let (type_tag, payload) = encode_payload(entry)?;
        let total_len = 1 + payload.len() + 4;

        let mut buf = Vec::with_capacity(4 + total_len);
        buf.extend_from_slice(&(total_len as u32).to_le_bytes());
        buf.push(type_tag);
        buf.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&[type_tag]);
        hasher.update(&payload);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        self.file.write_all(&buf)?;
        Ok(())
    }
}

fn encode_payload(entry: &LogEntry) -> Result<(u8, Vec<u8>)> {
    let type_tag = match entry {
        LogEntry::Start(_) => TYPE_START,
        LogEntry::Complete { .. } => TYPE_COMPLETE,
    };
    let payload = bincode::serialize(entry)
        .map_err(|e| Error::integrity(format!("log entry serialization failed: {}", e)))?;
    Ok((type_tag, payload))
}

/// Decode one entry from `buf`, returning it and the bytes consumed.
fn decode_entry(buf: &[u8], offset: u64) -> Result<(LogEntry, usize)> {
    if buf.len() < 4 {
        return Err(Error::integrity(format!(
            "incomplete log entry at offset {}: need 4 length bytes, have {}",
            offset,
            buf.len()
        )));
    }
    let total_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if total_len < 5 {
        return Err(Error::integrity(format!(
            "offset {}: invalid log entry length {}",
            offset, total_len
        )));
    }
    if buf.len() < 4 + total_len {
        return Err(Error::integrity(format!(
            "incomplete log entry at offset {}: need {} bytes, have {}",
            offset,
            4 + total_len,
            buf.len()
        )));
    }

    let type_tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let expected_crc = u32::from_le_bytes([
        buf[total_len],
        buf[total_len + 1],
        buf[total_len + 2],
        buf[total_len + 3],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(payload);
    if hasher.finalize() != expected_crc {
        return Err(Error::integrity(format!("offset {}: log entry CRC mismatch", offset)));
    }

    let entry: LogEntry = bincode::deserialize(payload)
        .map_err(|e| Error::integrity(format!("offset {}: log entry decode failed: {}", offset, e)))?;

    let tag_matches = matches!(
        (&entry, type_tag),
        (LogEntry::Start(_), TYPE_START) | (LogEntry::Complete { .. }, TYPE_COMPLETE)
    );
    if !tag_matches {
        return Err(Error::integrity(format!("offset {}: log entry type-tag mismatch", offset)));
    }

    Ok((entry, 4 + total_len))
}

/// Read every entry of a journal. A torn final record (crash mid-append)
/// is tolerated; corruption earlier in the file is not.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    file.try_lock_exclusive().map_err(|_| {
        Error::Fatal(format!("resource log \"{}\" is held by another process", path.display()))
    })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        match decode_entry(&bytes[offset..], offset as u64) {
            Ok((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            Err(e) => {
                let remaining = bytes.len() - offset;
                let declared = if remaining >= 4 {
                    u32::from_le_bytes([
                        bytes[offset],
                        bytes[offset + 1],
                        bytes[offset + 2],
                        bytes[offset + 3],
                    ]) as usize
                        + 4
                } else {
                    usize::MAX
                };
                if declared > remaining {
                    // torn tail from a crash mid-append: ignore it
                    tracing::warn!(path = %path.display(), offset, "dropping torn log tail");
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(entries)
}

/// Operations whose start record lacks a completion: the replay set.
pub fn outstanding(path: &Path) -> Result<Vec<Operation>> {
    let entries = read_entries(path)?;
    let mut started: Vec<Operation> = Vec::new();
    for entry in entries {
        match entry {
            LogEntry::Start(op) => started.push(op),
            LogEntry::Complete { key, .. } => {
                if let Some(idx) = started.iter().position(|op| op.key() == key) {
                    started.remove(idx);
                }
            }
        }
    }
    Ok(started)
}
