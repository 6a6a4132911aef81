//! `xlog.db`: the append-only journal of WAL segments ingested into the
//! archive, and `rebuild-xlogdb`, which regenerates it from the files
//! actually present under `wals/`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::SystemTime;

use barman_utils::compression::Compression;
use barman_utils::error::BarmanError;
use barman_utils::lsn::WalSegmentName;
use barman_utils::{atomic_file, TimelineId};

/// One line of `xlog.db`: `name<TAB>size<TAB>time<TAB>compression`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub name: String,
    pub size: u64,
    pub time: i64,
    pub compression: Compression,
}

impl WalRecord {
    fn format_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.name,
            self.size,
            self.time,
            self.compression.catalog_name()
        )
    }

    fn parse_line(line: &str) -> Option<WalRecord> {
        let mut parts = line.splitn(4, '\t');
        let name = parts.next()?.to_string();
        let size: u64 = parts.next()?.parse().ok()?;
        let time: i64 = parts.next()?.parse().ok()?;
        let compression = Compression::parse_catalog_name(parts.next()?)?;
        Some(WalRecord {
            name,
            size,
            time,
            compression,
        })
    }

    pub fn timeline(&self) -> Option<TimelineId> {
        WalSegmentName::parse(&self.name).ok().map(|s| s.timeline)
    }
}

/// Read every record currently in `xlog.db`. A malformed line is skipped
/// with a warning rather than failing the whole read: spec.md §7 treats
/// `CatalogCorrupt` during a read as "mark bad and exclude", not abort.
pub fn read_all(xlogdb_path: &Path) -> Result<Vec<WalRecord>, BarmanError> {
    if !xlogdb_path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(xlogdb_path)
        .map_err(|e| BarmanError::FatalInternal(format!("opening {xlogdb_path:?}: {e}")))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| BarmanError::FatalInternal(format!("reading {xlogdb_path:?}: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        match WalRecord::parse_line(&line) {
            Some(r) => records.push(r),
            None => {
                tracing::warn!("skipping malformed xlog.db line {}: {:?}", lineno + 1, line);
            }
        }
    }
    Ok(records)
}

/// Append a single record: the file is fsynced only at a higher level
/// (the caller must have already fsynced the archived segment itself
/// before calling this, per the archiver's durability contract), but the
/// append itself is always immediately fsynced here before returning,
/// satisfying "the record is fsynced before the source file is unlinked".
pub fn append(xlogdb_path: &Path, record: &WalRecord) -> Result<(), BarmanError> {
    if let Some(parent) = xlogdb_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BarmanError::FatalInternal(format!("creating {parent:?}: {e}")))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(xlogdb_path)
        .map_err(|e| BarmanError::FatalInternal(format!("opening {xlogdb_path:?}: {e}")))?;
    writeln!(file, "{}", record.format_line())
        .map_err(|e| BarmanError::FatalInternal(format!("appending to {xlogdb_path:?}: {e}")))?;
    file.sync_all()
        .map_err(|e| BarmanError::FatalInternal(format!("fsyncing {xlogdb_path:?}: {e}")))?;
    Ok(())
}

/// Rewrite the whole file atomically (temp + rename), used by both
/// `rebuild-xlogdb` and retention's WAL pruning.
pub fn rewrite_atomic(xlogdb_path: &Path, records: &[WalRecord]) -> Result<(), BarmanError> {
    let mut contents = String::new();
    for r in records {
        contents.push_str(&r.format_line());
        contents.push('\n');
    }
    atomic_file::write_atomic(xlogdb_path, contents.as_bytes())
}

/// Regenerate `xlog.db` from the files actually present under `wals_dir`.
/// Sorted by (timeline, name) ascending — a deterministic order independent
/// of ingestion history, which is what makes two consecutive rebuilds
/// byte-identical (spec.md §8, invariant 6).
pub fn rebuild(wals_dir: &Path, xlogdb_path: &Path) -> Result<Vec<WalRecord>, BarmanError> {
    let mut by_timeline: BTreeMap<TimelineId, Vec<WalRecord>> = BTreeMap::new();

    if wals_dir.exists() {
        for entry in walkdir::WalkDir::new(wals_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let (core, compression) = strip_known_extension(&file_name);
            let Ok(parsed) = WalSegmentName::parse(&core) else {
                tracing::warn!("ignoring non-WAL file in archive: {:?}", entry.path());
                continue;
            };
            if parsed.partial {
                // .partial files never live under wals/; ignore defensively.
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| BarmanError::FatalInternal(format!("stat {:?}: {e}", entry.path())))?;
            let time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            by_timeline.entry(parsed.timeline).or_default().push(WalRecord {
                name: parsed.canonical(),
                size: metadata.len(),
                time,
                compression,
            });
        }
    }

    let mut records = Vec::new();
    for (_tli, mut recs) in by_timeline {
        recs.sort_by(|a, b| a.name.cmp(&b.name));
        records.extend(recs);
    }

    rewrite_atomic(xlogdb_path, &records)?;
    Ok(records)
}

fn strip_known_extension(file_name: &str) -> (String, Compression) {
    for c in [Compression::Gzip, Compression::Zstd] {
        if let Some(core) = file_name.strip_suffix(c.extension()) {
            return (core.to_string(), c);
        }
    }
    (file_name.to_string(), Compression::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> WalRecord {
        WalRecord {
            name: name.to_string(),
            size: 16 * 1024 * 1024,
            time: 1_700_000_000,
            compression: Compression::None,
        }
    }

    #[test]
    fn append_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlog.db");
        append(&path, &record("000000010000000000000001")).unwrap();
        append(&path, &record("000000010000000000000002")).unwrap();
        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "000000010000000000000001");
        assert_eq!(records[1].name, "000000010000000000000002");
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlog.db");
        fs::write(&path, "garbage line with no tabs\n000000010000000000000001\t16777216\t1700000000\tnone\n").unwrap();
        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let wals_dir = dir.path().join("wals");
        let prefix_dir = wals_dir.join("0000000100000000");
        fs::create_dir_all(&prefix_dir).unwrap();
        fs::write(prefix_dir.join("000000010000000000000001"), b"x".repeat(100)).unwrap();
        fs::write(prefix_dir.join("000000010000000000000002"), b"y".repeat(200)).unwrap();

        let xlogdb_path = dir.path().join("xlog.db");
        let first = rebuild(&wals_dir, &xlogdb_path).unwrap();
        let first_bytes = fs::read(&xlogdb_path).unwrap();
        let second = rebuild(&wals_dir, &xlogdb_path).unwrap();
        let second_bytes = fs::read(&xlogdb_path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_bytes, second_bytes);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "000000010000000000000001");
    }

    #[test]
    fn rebuild_picks_up_compression_extension() {
        let dir = tempfile::tempdir().unwrap();
        let wals_dir = dir.path().join("wals");
        let prefix_dir = wals_dir.join("0000000100000000");
        fs::create_dir_all(&prefix_dir).unwrap();
        fs::write(prefix_dir.join("000000010000000000000001.gz"), b"z").unwrap();

        let xlogdb_path = dir.path().join("xlog.db");
        let records = rebuild(&wals_dir, &xlogdb_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].compression, Compression::Gzip);
        assert_eq!(records[0].name, "000000010000000000000001");
    }
}
