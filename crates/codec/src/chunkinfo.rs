//! MultiChunkInfo binary records
//!
//! One record per chunk object of a Multi stream, appended to the MD file
//! as the chunk seals. Records are a fixed 48 bytes in network byte order:
//!
//! ```text
//! [maj: u32][min: u32][chunk_no: u64][logical_offset: u64]
//! [chunk_data_bytes: u64][correct_info: u64][encrypt_info: u64]
//! ```
//!
//! An all-zero record is a hole: a parallel N:1 writer has not yet filled
//! that slot. Readers must treat holes as sparse regions until release.
//! Counting chunks scans records until EOF or the first hole.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};

use marfs_core::error::{Error, Result};
use marfs_core::tag::ConfigVersion;

/// On-disk size of one record.
pub const CHUNK_INFO_SIZE: usize = 48;

/// Per-chunk journal record of a Multi stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiChunkInfo {
    /// Config version in effect at chunk seal
    pub vers: ConfigVersion,
    /// Chunk number within the stream
    pub chunk_no: u64,
    /// Logical (user-data) offset at which this chunk begins
    pub logical_offset: u64,
    /// User-data bytes stored in this chunk
    pub chunk_data_bytes: u64,
    /// Correctness-info tag
    pub correct_info: u64,
    /// Encryption-info tag
    pub encrypt_info: u64,
}

impl MultiChunkInfo {
    /// Expected logical offset for a chunk: all but the last chunk hold
    /// exactly `chunk_size - recovery` user bytes.
    pub fn expected_offset(chunk_no: u64, chunk_size: u64, recovery_bytes: u64) -> u64 {
        chunk_no * chunk_size.saturating_sub(recovery_bytes)
    }

    /// Serialize into the fixed on-disk form.
    pub fn to_bytes(&self) -> [u8; CHUNK_INFO_SIZE] {
        let mut buf = [0u8; CHUNK_INFO_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.vers.major);
        BigEndian::write_u32(&mut buf[4..8], self.vers.minor);
        BigEndian::write_u64(&mut buf[8..16], self.chunk_no);
        BigEndian::write_u64(&mut buf[16..24], self.logical_offset);
        BigEndian::write_u64(&mut buf[24..32], self.chunk_data_bytes);
        BigEndian::write_u64(&mut buf[32..40], self.correct_info);
        BigEndian::write_u64(&mut buf[40..48], self.encrypt_info);
        buf
    }

    /// Deserialize one record; `Ok(None)` for a hole (all-zero slot).
    ///
    /// The config-version check applies only to filled records; a hole
    /// has no version to check.
    pub fn from_bytes(buf: &[u8], expected: ConfigVersion) -> Result<Option<Self>> {
        if buf.len() < CHUNK_INFO_SIZE {
            return Err(Error::integrity(format!(
                "chunk-info record truncated: {} of {} bytes",
                buf.len(),
                CHUNK_INFO_SIZE
            )));
        }
        let buf = &buf[..CHUNK_INFO_SIZE];
        if buf.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        let vers = ConfigVersion::new(
            BigEndian::read_u32(&buf[0..4]),
            BigEndian::read_u32(&buf[4..8]),
        );
        if vers != expected {
            return Err(Error::VersionMismatch { expected, found: vers });
        }

        Ok(Some(MultiChunkInfo {
            vers,
            chunk_no: BigEndian::read_u64(&buf[8..16]),
            logical_offset: BigEndian::read_u64(&buf[16..24]),
            chunk_data_bytes: BigEndian::read_u64(&buf[24..32]),
            correct_info: BigEndian::read_u64(&buf[32..40]),
            encrypt_info: BigEndian::read_u64(&buf[40..48]),
        }))
    }

    /// Scan records until EOF or the first hole, returning the count of
    /// contiguous valid records from the start.
    pub fn count_chunks(reader: &mut impl Read, expected: ConfigVersion) -> Result<u64> {
        let mut count = 0u64;
        let mut buf = [0u8; CHUNK_INFO_SIZE];
        loop {
            match read_record(reader, &mut buf)? {
                ReadOutcome::Eof => return Ok(count),
                ReadOutcome::Partial => {
                    return Err(Error::integrity(
                        "MD file holds a partial chunk-info record",
                    ))
                }
                ReadOutcome::Full => {}
            }
            match MultiChunkInfo::from_bytes(&buf, expected)? {
                None => return Ok(count),
                Some(_) => count += 1,
            }
        }
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_record(reader: &mut impl Read, buf: &mut [u8; CHUNK_INFO_SIZE]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < CHUNK_INFO_SIZE {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
