//! Identifiers for servers and backups.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of a configured server, e.g. `main`. Servers are referred to by
/// this name everywhere in the catalog, on the filesystem and on the CLI.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerName(pub String);

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerName {
    fn from(s: &str) -> Self {
        ServerName(s.to_string())
    }
}

impl From<String> for ServerName {
    fn from(s: String) -> Self {
        ServerName(s)
    }
}

/// A backup id: `YYYYMMDDTHHMMSS`, the timestamp at which the backup was
/// started, with second precision. Totally ordered by construction since
/// the format sorts lexicographically the same as chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupId(
    #[serde(with = "backup_id_serde")] NaiveDateTime,
);

mod backup_id_serde {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(v: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&v.format("%Y%m%dT%H%M%S").to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&s, "%Y%m%dT%H%M%S").map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid backup id {0:?}, expected YYYYMMDDTHHMMSS")]
pub struct BackupIdParseError(String);

impl BackupId {
    /// A fresh id for "now", at second precision. Two backups started in
    /// the same second on the same server collide; callers must detect
    /// that (see `Catalog::reserve_backup_id`) and refuse to proceed.
    pub fn now() -> Self {
        BackupId(Utc::now().naive_utc())
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%dT%H%M%S"))
    }
}

impl FromStr for BackupId {
    type Err = BackupIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || s.as_bytes()[8] != b'T' {
            return Err(BackupIdParseError(s.to_string()));
        }
        NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
            .map(BackupId)
            .map_err(|_| BackupIdParseError(s.to_string()))
    }
}

/// Aliases accepted anywhere a `BackupId` is expected on the CLI or in the
/// planner. Resolved against a catalog snapshot, never at parse time, since
/// their meaning depends on which backups currently exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupIdOrAlias {
    Id(BackupId),
    First,
    Last,
    LastFull,
    LastFailed,
    Auto,
}

impl FromStr for BackupIdOrAlias {
    type Err = BackupIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" | "oldest" => Ok(BackupIdOrAlias::First),
            "last" | "latest" => Ok(BackupIdOrAlias::Last),
            "last-full" | "latest-full" => Ok(BackupIdOrAlias::LastFull),
            "last-failed" => Ok(BackupIdOrAlias::LastFailed),
            "auto" => Ok(BackupIdOrAlias::Auto),
            other => other.parse::<BackupId>().map(BackupIdOrAlias::Id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_id_roundtrip() {
        let id: BackupId = "20240115T101500".parse().unwrap();
        assert_eq!(id.to_string(), "20240115T101500");
    }

    #[test]
    fn backup_id_order_matches_chronology() {
        let a: BackupId = "20240115T101500".parse().unwrap();
        let b: BackupId = "20240115T120000".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn rejects_malformed() {
        assert!("not-a-backup-id".parse::<BackupId>().is_err());
        assert!("2024-01-15T10:15:00".parse::<BackupId>().is_err());
    }

    #[test]
    fn aliases_parse() {
        assert_eq!("latest".parse(), Ok(BackupIdOrAlias::Last));
        assert_eq!("last-full".parse(), Ok(BackupIdOrAlias::LastFull));
        assert_eq!("auto".parse(), Ok(BackupIdOrAlias::Auto));
    }
}
