//! Reserved xattr string codecs
//!
//! Each reserved attribute has one codec implementing [`AttrCodec`]:
//! encoding is `|`-separated fields in a fixed order, parsing consumes the
//! same order and fails on any missing or malformed field. The config
//! version leads every record; a parse against a non-matching running
//! config fails with `Error::VersionMismatch` before any other field is
//! examined.
//!
//! The namespace id string may itself contain `|`, so it is always the
//! final field of the `marfs_objid` record and parsing takes the
//! remainder of the string.

use marfs_core::error::{Error, Result};
use marfs_core::tag::{ConfigVersion, Ftag, ObjectType, Post, Restart, StreamState};

/// Prefix shared by every reserved attribute. User setxattr/removexattr of
/// any name starting with this is forbidden; listxattr hides them.
pub const ATTR_PREFIX: &str = "marfs_";

/// Attribute holding the serialized [`Ftag`].
pub const ATTR_OBJID: &str = "marfs_objid";

/// Attribute holding the serialized [`Post`] record.
pub const ATTR_POST: &str = "marfs_post";

/// Attribute holding the serialized [`Restart`] marker.
pub const ATTR_RESTART: &str = "marfs_restart";

/// True for attribute names the core reserves for itself.
pub fn is_reserved_attr(name: &str) -> bool {
    name.starts_with(ATTR_PREFIX)
}

/// A self-describing xattr record codec.
pub trait AttrCodec: Sized {
    /// Reserved attribute name this record is stored under.
    const ATTR_NAME: &'static str;

    /// Serialize to the canonical string form.
    fn encode(&self) -> String;

    /// Parse, verifying the leading config version against `expected`.
    fn parse(s: &str, expected: ConfigVersion) -> Result<Self>;
}

fn parse_version_field(field: &str, attr: &str) -> Result<ConfigVersion> {
    let (major, minor) = field
        .split_once('.')
        .ok_or_else(|| Error::integrity(format!("{}: bad version field \"{}\"", attr, field)))?;
    Ok(ConfigVersion::new(
        major
            .parse()
            .map_err(|_| Error::integrity(format!("{}: bad major version", attr)))?,
        minor
            .parse()
            .map_err(|_| Error::integrity(format!("{}: bad minor version", attr)))?,
    ))
}

fn check_version(found: ConfigVersion, expected: ConfigVersion) -> Result<()> {
    if found != expected {
        return Err(Error::VersionMismatch { expected, found });
    }
    Ok(())
}

fn parse_u64(field: &str, attr: &str, what: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| Error::integrity(format!("{}: bad {} field \"{}\"", attr, what, field)))
}

fn encode_state(state: StreamState) -> String {
    let mut s = String::new();
    if state.writing {
        s.push('W');
    }
    if state.finalized {
        s.push('F');
    }
    if state.sized {
        s.push('S');
    }
    if state.deleted {
        s.push('D');
    }
    if s.is_empty() {
        s.push('-');
    }
    s
}

fn parse_state(field: &str, attr: &str) -> Result<StreamState> {
    let mut state = StreamState::default();
    if field == "-" {
        return Ok(state);
    }
    for c in field.chars() {
        match c {
            'W' => state.writing = true,
            'F' => state.finalized = true,
            'S' => state.sized = true,
            'D' => state.deleted = true,
            other => {
                return Err(Error::integrity(format!(
                    "{}: unknown state flag '{}'",
                    attr, other
                )))
            }
        }
    }
    Ok(state)
}

impl AttrCodec for Ftag {
    const ATTR_NAME: &'static str = ATTR_OBJID;

    fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.vers,
            encode_state(self.state),
            self.repo,
            self.chunk_size,
            self.recovery_bytes,
            self.stream_id,
            self.obj_no,
            self.chunk_no,
            self.file_no,
            self.ctime,
            self.unique,
            self.ns_id,
        )
    }

    fn parse(s: &str, expected: ConfigVersion) -> Result<Self> {
        let mut fields = s.splitn(12, '|');
        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| Error::integrity(format!("{}: missing {} field", ATTR_OBJID, what)))
        };

        let vers = parse_version_field(next("version")?, ATTR_OBJID)?;
        check_version(vers, expected)?;

        let state = parse_state(next("state")?, ATTR_OBJID)?;
        let repo = next("repo")?.to_string();
        let chunk_size = parse_u64(next("chunk-size")?, ATTR_OBJID, "chunk-size")?;
        let recovery_bytes = parse_u64(next("recovery-bytes")?, ATTR_OBJID, "recovery-bytes")?;
        let stream_id = next("stream-id")?.to_string();
        let obj_no = parse_u64(next("obj-no")?, ATTR_OBJID, "obj-no")?;
        let chunk_no = parse_u64(next("chunk-no")?, ATTR_OBJID, "chunk-no")?;
        let file_no = parse_u64(next("file-no")?, ATTR_OBJID, "file-no")?;
        let ctime = next("ctime")?
            .parse()
            .map_err(|_| Error::integrity(format!("{}: bad ctime field", ATTR_OBJID)))?;
        let unique = parse_u64(next("unique")?, ATTR_OBJID, "unique")?;
        let ns_id = next("ns-id")?.to_string();
        if repo.is_empty() || stream_id.is_empty() || ns_id.is_empty() {
            return Err(Error::integrity(format!("{}: empty identity field", ATTR_OBJID)));
        }

        Ok(Ftag {
            vers,
            repo,
            ns_id,
            chunk_size,
            recovery_bytes,
            stream_id,
            obj_no,
            chunk_no,
            file_no,
            ctime,
            unique,
            state,
        })
    }
}

impl AttrCodec for Post {
    const ATTR_NAME: &'static str = ATTR_POST;

    fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.vers,
            self.obj_type.code(),
            self.obj_offset,
            self.chunks,
            self.chunk_info_bytes,
            self.correct_info,
            self.encrypt_info,
            if self.trash { "T" } else { "-" },
        )
    }

    fn parse(s: &str, expected: ConfigVersion) -> Result<Self> {
        let fields: Vec<&str> = s.split('|').collect();
        if fields.len() != 8 {
            return Err(Error::integrity(format!(
                "{}: expected 8 fields, found {}",
                ATTR_POST,
                fields.len()
            )));
        }

        let vers = parse_version_field(fields[0], ATTR_POST)?;
        check_version(vers, expected)?;

        let mut type_chars = fields[1].chars();
        let obj_type = type_chars
            .next()
            .and_then(ObjectType::from_code)
            .filter(|_| type_chars.next().is_none())
            .ok_or_else(|| {
                Error::integrity(format!("{}: bad object-type field \"{}\"", ATTR_POST, fields[1]))
            })?;

        let trash = match fields[7] {
            "T" => true,
            "-" => false,
            other => {
                return Err(Error::integrity(format!(
                    "{}: bad trash flag \"{}\"",
                    ATTR_POST, other
                )))
            }
        };

        Ok(Post {
            vers,
            obj_type,
            obj_offset: parse_u64(fields[2], ATTR_POST, "obj-offset")?,
            chunks: parse_u64(fields[3], ATTR_POST, "chunks")?,
            chunk_info_bytes: parse_u64(fields[4], ATTR_POST, "chunk-info-bytes")?,
            correct_info: parse_u64(fields[5], ATTR_POST, "correct-info")?,
            encrypt_info: parse_u64(fields[6], ATTR_POST, "encrypt-info")?,
            trash,
        })
    }
}

impl AttrCodec for Restart {
    const ATTR_NAME: &'static str = ATTR_RESTART;

    fn encode(&self) -> String {
        match self.mode {
            Some(mode) => format!("{:o}", mode),
            None => "-".to_string(),
        }
    }

    fn parse(s: &str, _expected: ConfigVersion) -> Result<Self> {
        // restart carries no version of its own; it never outlives a
        // single write attempt
        if s == "-" {
            return Ok(Restart { mode: None });
        }
        let mode = u32::from_str_radix(s, 8)
            .map_err(|_| Error::integrity(format!("{}: bad mode field \"{}\"", ATTR_RESTART, s)))?;
        Ok(Restart { mode: Some(mode) })
    }
}
