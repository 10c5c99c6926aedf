//! Recovery-info region codec
//!
//! Every sealed object ends with a recovery-info region that redundantly
//! encodes the metadata needed to rebuild the MDFS from objects alone.
//! Layout of one file's body, null-terminated strings back to back:
//!
//! ```text
//! HEAD \0 PRE \0 POST \0 PATH:<ns-path> \0 <zero padding>
//! ```
//!
//! padded to [`REC_BODY_SIZE`]. The region closes with a [`REC_TAIL_SIZE`]
//! tail holding two decimal integers: the number of files contributing
//! user data to the object, and the total length of the recovery region
//! including the tail. A recovery tool reads the last `REC_TAIL_SIZE`
//! bytes of an object, learns the region length, then parses the bodies
//! backwards; no other knowledge of the object required.
//!
//! Uni and Multi objects carry one body per object (`files = 1`, total =
//! [`REC_UNI_SIZE`]). A packed object carries one body per member file
//! followed by a single tail.

use marfs_core::error::{Error, Result};
use marfs_core::tag::{ConfigVersion, Ftag, Post};

use crate::attrs::AttrCodec;

/// Total recovery bytes consumed per object for Uni/Multi layouts.
pub const REC_UNI_SIZE: usize = 4096;

/// Fixed size of the backward-parseable tail.
pub const REC_TAIL_SIZE: usize = 64;

/// Fixed size of one file's recovery body.
pub const REC_BODY_SIZE: usize = REC_UNI_SIZE - REC_TAIL_SIZE;

/// Stat-like header of one recovery body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryHead {
    /// Config version in effect when the object was sealed
    pub vers: ConfigVersion,
    /// User-data bytes this file contributed to the object
    pub user_bytes: u64,
    /// MD-file mode bits
    pub mode: u32,
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// MD-file mtime (epoch seconds)
    pub mtime: i64,
}

impl RecoveryHead {
    fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{:o}|{}|{}|{}",
            self.vers, REC_UNI_SIZE, self.user_bytes, self.mode, self.uid, self.gid, self.mtime
        )
    }

    fn parse(s: &str, expected: ConfigVersion) -> Result<Self> {
        let fields: Vec<&str> = s.split('|').collect();
        if fields.len() != 7 {
            return Err(Error::integrity(format!(
                "recovery head: expected 7 fields, found {}",
                fields.len()
            )));
        }
        let (major, minor) = fields[0]
            .split_once('.')
            .ok_or_else(|| Error::integrity("recovery head: bad version"))?;
        let vers = ConfigVersion::new(
            major.parse().map_err(|_| Error::integrity("recovery head: bad major"))?,
            minor.parse().map_err(|_| Error::integrity("recovery head: bad minor"))?,
        );
        if vers != expected {
            return Err(Error::VersionMismatch { expected, found: vers });
        }
        Ok(RecoveryHead {
            vers,
            user_bytes: fields[2]
                .parse()
                .map_err(|_| Error::integrity("recovery head: bad user-bytes"))?,
            mode: u32::from_str_radix(fields[3], 8)
                .map_err(|_| Error::integrity("recovery head: bad mode"))?,
            uid: fields[4].parse().map_err(|_| Error::integrity("recovery head: bad uid"))?,
            gid: fields[5].parse().map_err(|_| Error::integrity("recovery head: bad gid"))?,
            mtime: fields[6].parse().map_err(|_| Error::integrity("recovery head: bad mtime"))?,
        })
    }
}

/// One file's worth of recovery information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryFile {
    /// Stat-like header
    pub head: RecoveryHead,
    /// The file's identity record
    pub ftag: Ftag,
    /// The file's layout record
    pub post: Post,
    /// User-visible MarFS path (not the MDFS path)
    pub path: String,
}

/// Encode one body, zero-padded to exactly [`REC_BODY_SIZE`].
pub fn encode_body(file: &RecoveryFile) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(REC_BODY_SIZE);
    for part in [
        file.head.encode(),
        file.ftag.encode(),
        file.post.encode(),
        format!("PATH:{}", file.path),
    ] {
        buf.extend_from_slice(part.as_bytes());
        buf.push(0);
    }
    if buf.len() > REC_BODY_SIZE {
        return Err(Error::integrity(format!(
            "recovery body overflows {} bytes ({} needed)",
            REC_BODY_SIZE,
            buf.len()
        )));
    }
    buf.resize(REC_BODY_SIZE, 0);
    Ok(buf)
}

/// Encode the tail: `"<files> <total-region-length>"` zero-padded to
/// [`REC_TAIL_SIZE`].
pub fn encode_tail(files: u64, total_len: u64) -> Vec<u8> {
    let mut buf = format!("{} {}", files, total_len).into_bytes();
    debug_assert!(buf.len() < REC_TAIL_SIZE);
    buf.resize(REC_TAIL_SIZE, 0);
    buf
}

/// The full recovery region of a Uni or Multi object: one body, one tail.
pub fn encode_uni(file: &RecoveryFile) -> Result<Vec<u8>> {
    let mut region = encode_body(file)?;
    region.extend_from_slice(&encode_tail(1, REC_UNI_SIZE as u64));
    Ok(region)
}

/// The full recovery region of a packed object: one body per member file,
/// one tail.
pub fn encode_packed(files: &[RecoveryFile]) -> Result<Vec<u8>> {
    if files.is_empty() {
        return Err(Error::integrity("packed recovery region with no files"));
    }
    let total = files.len() * REC_BODY_SIZE + REC_TAIL_SIZE;
    let mut region = Vec::with_capacity(total);
    for file in files {
        region.extend_from_slice(&encode_body(file)?);
    }
    region.extend_from_slice(&encode_tail(files.len() as u64, total as u64));
    Ok(region)
}

/// Parse the tail from the last bytes of an object.
///
/// `trailing` must be at least [`REC_TAIL_SIZE`] bytes; only the final
/// `REC_TAIL_SIZE` are examined. Returns `(files, total_region_length)`.
pub fn parse_tail(trailing: &[u8]) -> Result<(u64, u64)> {
    if trailing.len() < REC_TAIL_SIZE {
        return Err(Error::integrity(format!(
            "recovery tail needs {} bytes, got {}",
            REC_TAIL_SIZE,
            trailing.len()
        )));
    }
    let tail = &trailing[trailing.len() - REC_TAIL_SIZE..];
    let end = tail.iter().position(|b| *b == 0).unwrap_or(REC_TAIL_SIZE);
    let text = std::str::from_utf8(&tail[..end])
        .map_err(|_| Error::integrity("recovery tail is not valid text"))?;
    let (files, len) = text
        .split_once(' ')
        .ok_or_else(|| Error::integrity(format!("malformed recovery tail \"{}\"", text)))?;
    Ok((
        files.parse().map_err(|_| Error::integrity("recovery tail: bad file count"))?,
        len.parse().map_err(|_| Error::integrity("recovery tail: bad region length"))?,
    ))
}

/// Parse a complete recovery region (bodies + tail) back into per-file
/// records, in file order.
pub fn parse_region(region: &[u8], expected: ConfigVersion) -> Result<Vec<RecoveryFile>> {
    let (files, total) = parse_tail(region)?;
    if total as usize != region.len() {
        return Err(Error::integrity(format!(
            "recovery region length mismatch: tail says {}, have {}",
            total,
            region.len()
        )));
    }
    let body_bytes = region.len() - REC_TAIL_SIZE;
    if files == 0 || body_bytes != files as usize * REC_BODY_SIZE {
        return Err(Error::integrity(format!(
            "recovery region holds {} body bytes for {} files",
            body_bytes, files
        )));
    }

    let mut out = Vec::with_capacity(files as usize);
    for i in 0..files as usize {
        let body = &region[i * REC_BODY_SIZE..(i + 1) * REC_BODY_SIZE];
        out.push(parse_body(body, expected)?);
    }
    Ok(out)
}

fn parse_body(body: &[u8], expected: ConfigVersion) -> Result<RecoveryFile> {
    let mut strings = Vec::with_capacity(4);
    let mut start = 0;
    for _ in 0..4 {
        let rel = body[start..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::integrity("recovery body: unterminated string"))?;
        let s = std::str::from_utf8(&body[start..start + rel])
            .map_err(|_| Error::integrity("recovery body is not valid text"))?;
        strings.push(s);
        start += rel + 1;
    }

    let path = strings[3]
        .strip_prefix("PATH:")
        .ok_or_else(|| Error::integrity("recovery body: missing PATH marker"))?;

    Ok(RecoveryFile {
        head: RecoveryHead::parse(strings[0], expected)?,
        ftag: Ftag::parse(strings[1], expected)?,
        post: Post::parse(strings[2], expected)?,
        path: path.to_string(),
    })
}
