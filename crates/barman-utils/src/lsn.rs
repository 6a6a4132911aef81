//! Log sequence numbers and WAL segment naming.
//!
//! A postgres-shaped LSN is a 64 bit byte offset into the write-ahead log,
//! conventionally printed as two hex words separated by a slash
//! (`16/B374D848`). WAL segment file names encode a timeline id and the
//! high bits of an LSN as 24 hex characters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default WAL segment size used throughout the catalog (16 MiB), matching
/// postgres' compiled-in default. Segment size is a server-level knob in
/// real deployments but this crate only ever deals with one value at a
/// time, threaded through explicitly rather than hidden as global state.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The zero-based WAL segment number containing this LSN, given a segment size.
    pub fn segment_number(self, wal_seg_size: u64) -> u64 {
        self.0 / wal_seg_size
    }

    /// The offset of this LSN within its segment.
    pub fn segment_offset(self, wal_seg_size: u64) -> u64 {
        self.0 % wal_seg_size
    }

    pub fn checked_sub(self, other: u64) -> Option<Lsn> {
        self.0.checked_sub(other).map(Lsn)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 & 0xffffffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self)
    }
}

#[derive(Debug, Error)]
pub enum LsnParseError {
    #[error("invalid LSN syntax: {0:?}")]
    BadSyntax(String),
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| LsnParseError::BadSyntax(s.to_string()))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| LsnParseError::BadSyntax(s.to_string()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| LsnParseError::BadSyntax(s.to_string()))?;
        Ok(Lsn((hi << 32) | lo))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl From<Lsn> for u64 {
    fn from(v: Lsn) -> Self {
        v.0
    }
}

/// A timeline id, the leading 8 hex digits of a WAL segment name.
pub type TimelineId = u32;

/// Compute the 24-hex-char canonical name of the WAL segment containing `lsn`.
pub fn xlog_file_name(tli: TimelineId, segno: u64, wal_seg_size: u64) -> String {
    let segs_per_xlogid = 0x1_0000_0000u64 / wal_seg_size;
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        segno / segs_per_xlogid,
        segno % segs_per_xlogid
    )
}

pub fn segment_number_for_name(name: &WalSegmentName, wal_seg_size: u64) -> u64 {
    let segs_per_xlogid = 0x1_0000_0000u64 / wal_seg_size;
    name.log_id as u64 * segs_per_xlogid + name.seg_id as u64
}

/// A parsed, validated WAL segment file name.
///
/// Canonical form is 24 hex characters: `<tli:8><log_id:8><seg_id:8>`. A
/// `.partial` suffix marks a still-growing tail segment written by the
/// streaming receiver; it is never archived under that name; it is renamed
/// to the plain form once a successor confirms it is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalSegmentName {
    pub timeline: TimelineId,
    pub log_id: u32,
    pub seg_id: u32,
    pub partial: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalNameParseError {
    #[error("WAL segment name {0:?} is not 24 hex characters (+ optional .partial)")]
    BadLength(String),
    #[error("WAL segment name {0:?} contains non-hex characters")]
    NotHex(String),
}

impl WalSegmentName {
    pub fn parse(name: &str) -> Result<Self, WalNameParseError> {
        let (core, partial) = match name.strip_suffix(".partial") {
            Some(core) => (core, true),
            None => (name, false),
        };
        if core.len() != 24 {
            return Err(WalNameParseError::BadLength(name.to_string()));
        }
        if !core.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WalNameParseError::NotHex(name.to_string()));
        }
        let timeline = u32::from_str_radix(&core[0..8], 16).unwrap();
        let log_id = u32::from_str_radix(&core[8..16], 16).unwrap();
        let seg_id = u32::from_str_radix(&core[16..24], 16).unwrap();
        Ok(WalSegmentName {
            timeline,
            log_id,
            seg_id,
            partial,
        })
    }

    /// Canonical on-disk / catalog name, without `.partial`.
    pub fn canonical(&self) -> String {
        format!(
            "{:08X}{:08X}{:08X}",
            self.timeline, self.log_id, self.seg_id
        )
    }

    pub fn display_name(&self) -> String {
        if self.partial {
            format!("{}.partial", self.canonical())
        } else {
            self.canonical()
        }
    }

    /// First 16 hex characters, used as the archive subdirectory prefix
    /// (`wals/<prefix>/<name>`).
    pub fn archive_prefix(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.log_id)
    }

    pub fn segment_number(&self, wal_seg_size: u64) -> u64 {
        segment_number_for_name(self, wal_seg_size)
    }
}

impl fmt::Display for WalSegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl PartialOrd for WalSegmentName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WalSegmentName {
    /// Lexicographic order on the canonical name, which matches numeric
    /// order on (timeline, log_id, seg_id) because each field is fixed-width
    /// hex. `.partial`-ness is not part of the order: a partial and its
    /// eventual final name sort identically.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timeline, self.log_id, self.seg_id).cmp(&(
            other.timeline,
            other.log_id,
            other.seg_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_roundtrip() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(format!("{lsn}"), "16/B374D848");
    }

    #[test]
    fn segment_name_roundtrip() {
        let name = "0000000100000002000000A0";
        let parsed = WalSegmentName::parse(name).unwrap();
        assert_eq!(parsed.canonical(), name);
        assert_eq!(parsed.timeline, 1);
        assert_eq!(parsed.log_id, 2);
        assert_eq!(parsed.seg_id, 0xA0);
    }

    #[test]
    fn partial_suffix_preserved_but_not_ordered() {
        let a = WalSegmentName::parse("000000010000000000000001").unwrap();
        let b = WalSegmentName::parse("000000010000000000000002.partial").unwrap();
        assert!(a < b);
        assert!(b.partial);
        assert_eq!(b.canonical(), "000000010000000000000002");
    }

    #[test]
    fn rejects_bad_length() {
        assert!(matches!(
            WalSegmentName::parse("deadbeef"),
            Err(WalNameParseError::BadLength(_))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(
            WalSegmentName::parse("0000000100000000ZZZZZZZZ"),
            Err(WalNameParseError::NotHex(_))
        ));
    }

    #[test]
    fn xlog_file_name_matches_parse() {
        let name = xlog_file_name(1, 0x123, DEFAULT_WAL_SEGMENT_SIZE);
        let parsed = WalSegmentName::parse(&name).unwrap();
        assert_eq!(parsed.segment_number(DEFAULT_WAL_SEGMENT_SIZE), 0x123);
    }
}
