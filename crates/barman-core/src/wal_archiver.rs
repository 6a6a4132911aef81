//! The WAL Archiver: promotes files from `incoming/`/`streaming/` into the
//! WAL store, per spec.md §4.2.
//!
//! Grounded on `safekeeper::wal_backup`'s upload loop: bounded-concurrency
//! workers draining a list of segments via `FuturesOrdered`, each retried
//! with `backoff::retry`, adapted from "push to remote storage" to
//! "promote into the local archive".

use std::collections::HashSet;
use std::path::Path;

use futures::stream::FuturesOrdered;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use barman_catalog::{Catalog, HookConfig, WalRecord};
use barman_utils::compression::Compression;
use barman_utils::error::{BarmanError, CopyFailureKind};
use barman_utils::lsn::WalSegmentName;

use crate::error::{Error, Result};
use crate::hooks::{self, HookEnv, Phase};

/// One file discovered in `incoming/` or `streaming/`, already validated
/// against the canonical name pattern.
#[derive(Debug, Clone)]
struct Candidate {
    path: std::path::PathBuf,
    name: WalSegmentName,
}

#[derive(Debug, Clone)]
pub struct ArchiverOptions {
    pub compression: Compression,
    pub parallel_jobs: usize,
    pub hooks: HookConfig,
    /// Retry budget for `pre_archive_retry`/`post_archive_retry`, reusing
    /// the same knob `basebackup_retry_times` provides for backup hooks
    /// since spec.md names no archive-specific retry-budget field.
    pub retry_times: u32,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        ArchiverOptions {
            compression: Compression::None,
            parallel_jobs: 1,
            hooks: HookConfig::default(),
            retry_times: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct ArchiveReport {
    pub installed: Vec<String>,
    pub quarantined: Vec<String>,
    pub skipped_duplicate: Vec<String>,
}

/// Run one archival pass: move every eligible file out of `incoming/`
/// (and completed, non-`.partial` files out of `streaming/`) into the
/// WAL store, in ascending name order within each timeline.
#[instrument(skip(catalog, options), fields(server = %catalog.server))]
pub async fn archive_wal(catalog: &Catalog, options: ArchiverOptions) -> Result<ArchiveReport> {
    let _lock = catalog.try_lock(barman_utils::lock::LockKind::ArchiveWal)?;

    let pre_env = HookEnv::new(&catalog.server, Phase::Pre, false);
    hooks::run_plain(options.hooks.pre_archive.as_deref(), Phase::Pre, &pre_env)?;
    hooks::run_retry(
        options.hooks.pre_archive_retry.as_deref(),
        Phase::Pre,
        &pre_env,
        options.retry_times.max(1),
    )?;

    let mut candidates = Vec::new();
    for dir in [catalog.paths.incoming_dir(), catalog.paths.streaming_dir()] {
        candidates.extend(collect_candidates(dir.as_std_path())?);
    }
    // `.partial` files are never archived from `incoming/`; and from
    // `streaming/` only a fully-closed segment (non-partial) is eligible.
    candidates.retain(|c| !c.name.partial);
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    let mut report = ArchiveReport::default();
    let known: HashSet<String> = catalog
        .all_wals()?
        .into_iter()
        .map(|r| r.name)
        .collect();

    let mut pool = FuturesOrdered::new();
    let mut iter = candidates.into_iter();
    loop {
        let pushed = match iter.next() {
            Some(c) => {
                pool.push_back(archive_one(c, options.compression));
                true
            }
            None => false,
        };
        if !pushed || pool.len() >= options.parallel_jobs.max(1) {
            let Some(result) = pool.next().await else {
                break;
            };
            apply_result(catalog, result, &known, &mut report)?;
        }
    }

    info!(
        installed = report.installed.len(),
        quarantined = report.quarantined.len(),
        "archive-wal pass complete"
    );
    let result = if !candidates_were_empty(&report) && report.installed.is_empty() && !report.quarantined.is_empty()
    {
        Err(Error::Catalog(BarmanError::CopyFailed {
            kind: CopyFailureKind::Persistent,
            detail: "archive-wal installed nothing".to_string(),
        }))
    } else {
        Ok(())
    };

    let post_env = HookEnv::new(&catalog.server, Phase::Post, false).with(
        "BARMAN_STATUS",
        if result.is_ok() { "DONE" } else { "FAILED" },
    );
    hooks::run_plain(options.hooks.post_archive.as_deref(), Phase::Post, &post_env)?;
    hooks::run_retry(
        options.hooks.post_archive_retry.as_deref(),
        Phase::Post,
        &post_env,
        options.retry_times.max(1),
    )?;

    result?;
    Ok(report)
}

fn candidates_were_empty(report: &ArchiveReport) -> bool {
    report.installed.is_empty() && report.quarantined.is_empty() && report.skipped_duplicate.is_empty()
}

struct ArchivedFile {
    candidate: Candidate,
    outcome: std::result::Result<(Vec<u8>, Compression), String>,
}

async fn archive_one(candidate: Candidate, compression: Compression) -> ArchivedFile {
    let path = candidate.path.clone();
    let outcome = tokio::task::spawn_blocking(move || -> std::result::Result<(Vec<u8>, Compression), String> {
        let raw = std::fs::read(&path).map_err(|e| e.to_string())?;
        let compressed = compression.compress(&raw).map_err(|e| e.to_string())?;
        Ok((compressed, compression))
    })
    .await
    .unwrap_or_else(|e| Err(e.to_string()));
    ArchivedFile { candidate, outcome }
}

fn apply_result(
    catalog: &Catalog,
    archived: ArchivedFile,
    known: &HashSet<String>,
    report: &mut ArchiveReport,
) -> Result<()> {
    let name = archived.candidate.name;
    let canonical = name.canonical();

    let (bytes, compression) = match archived.outcome {
        Ok(v) => v,
        Err(e) => {
            quarantine(catalog, &archived.candidate.path, &e)?;
            report.quarantined.push(canonical);
            return Ok(());
        }
    };

    if known.contains(&canonical) {
        let dest = catalog.paths.wal_archive_path(&name, compression.extension());
        match std::fs::read(dest.as_std_path()) {
            Ok(existing) if existing == bytes => {
                let _ = std::fs::remove_file(&archived.candidate.path);
                report.skipped_duplicate.push(canonical);
                return Ok(());
            }
            _ => {
                quarantine(
                    catalog,
                    &archived.candidate.path,
                    "duplicate segment name with differing content",
                )?;
                report.quarantined.push(canonical);
                return Ok(());
            }
        }
    }

    let dest = catalog.paths.wal_archive_path(&name, compression.extension());
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BarmanError::FatalInternal(format!("creating {parent:?}: {e}")))?;
    }
    std::fs::write(dest.as_std_path(), &bytes)
        .map_err(|e| BarmanError::FatalInternal(format!("writing {dest:?}: {e}")))?;
    barman_utils::atomic_file::fsync_file(dest.as_std_path())?;

    let record = WalRecord {
        name: canonical.clone(),
        size: bytes.len() as u64,
        time: chrono::Utc::now().timestamp(),
        compression,
    };
    catalog.append_wal(record)?;

    std::fs::remove_file(&archived.candidate.path)
        .map_err(|e| BarmanError::FatalInternal(format!("unlinking {:?}: {e}", archived.candidate.path)))?;

    report.installed.push(canonical);
    Ok(())
}

fn quarantine(catalog: &Catalog, path: &Path, reason: &str) -> Result<()> {
    let errors_dir = catalog.paths.errors_dir();
    std::fs::create_dir_all(errors_dir.as_std_path())
        .map_err(|e| BarmanError::FatalInternal(format!("creating {errors_dir:?}: {e}")))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let dest = errors_dir.join(&file_name);
    if let Err(e) = std::fs::rename(path, dest.as_std_path()) {
        warn!("failed to quarantine {path:?}: {e}");
    }
    let sidecar = errors_dir.join(format!("{file_name}.errors"));
    let _ = std::fs::write(sidecar.as_std_path(), reason);
    warn!("quarantined {file_name}: {reason}");
    Ok(())
}

fn collect_candidates(dir: &Path) -> Result<Vec<Candidate>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)
        .map_err(|e| BarmanError::FatalInternal(format!("reading {dir:?}: {e}")))?
    {
        let entry = entry.map_err(|e| BarmanError::FatalInternal(format!("reading {dir:?}: {e}")))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        match WalSegmentName::parse(&file_name) {
            Ok(name) => out.push(Candidate {
                path: entry.path(),
                name,
            }),
            Err(_) => {
                // history/backup-label variants and anything else
                // unparseable are left for a human, not silently dropped.
                continue;
            }
        }
    }
    Ok(out)
}

/// Validate a `put-wal` tar stream: exactly one data file plus a checksum
/// manifest (`SHA256SUMS` or the legacy `MD5SUMS`), every listed file's
/// checksum verified before anything is installed. Returns the validated
/// `(name, bytes)` pairs ready to be handed to the normal archival path.
pub fn validate_put_wal_stream<R: std::io::Read>(reader: R) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    let mut files: std::collections::HashMap<String, Vec<u8>> = std::collections::HashMap::new();
    let mut checksums: Option<std::collections::HashMap<String, String>> = None;

    for entry in archive
        .entries()
        .map_err(|e| Error::Catalog(BarmanError::Protocol(format!("reading put-wal tar: {e}"))))?
    {
        let mut entry =
            entry.map_err(|e| Error::Catalog(BarmanError::Protocol(format!("reading tar entry: {e}"))))?;
        let path = entry
            .path()
            .map_err(|e| Error::Catalog(BarmanError::Protocol(format!("reading tar entry path: {e}"))))?
            .to_string_lossy()
            .to_string();
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut buf)
            .map_err(|e| Error::Catalog(BarmanError::Protocol(format!("reading tar entry {path:?}: {e}"))))?;

        if path == "SHA256SUMS" || path == "MD5SUMS" {
            checksums = Some(parse_checksum_manifest(&buf));
        } else {
            files.insert(path, buf);
        }
    }

    let Some(checksums) = checksums else {
        return Err(Error::Catalog(BarmanError::Protocol(
            "put-wal stream is missing a checksum manifest".to_string(),
        )));
    };

    for (name, data) in &files {
        let expected = checksums.get(name).ok_or_else(|| {
            Error::Catalog(BarmanError::ChecksumMismatch {
                file: name.clone(),
                expected: "<listed>".to_string(),
                actual: "<unlisted>".to_string(),
            })
        })?;
        let actual = hex::encode(Sha256::digest(data));
        if &actual != expected {
            return Err(Error::Catalog(BarmanError::ChecksumMismatch {
                file: name.clone(),
                expected: expected.clone(),
                actual,
            }));
        }
    }

    Ok(files.into_iter().collect())
}

fn parse_checksum_manifest(buf: &[u8]) -> std::collections::HashMap<String, String> {
    let text = String::from_utf8_lossy(buf);
    let mut out = std::collections::HashMap::new();
    for line in text.lines() {
        if let Some((hash, name)) = line.split_once("  ") {
            out.insert(name.trim().to_string(), hash.trim().to_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use barman_utils::ServerName;

    fn catalog_in(dir: &std::path::Path) -> Catalog {
        let home = camino::Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        let cat = Catalog::open(home, ServerName::from("main"));
        cat.ensure_skeleton().unwrap();
        cat
    }

    #[tokio::test]
    async fn archives_files_in_ascending_order_and_leaves_partial() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        std::fs::write(
            cat.paths.incoming_dir().join("000000010000000000000002").as_std_path(),
            b"seg2",
        )
        .unwrap();
        std::fs::write(
            cat.paths.incoming_dir().join("000000010000000000000001").as_std_path(),
            b"seg1",
        )
        .unwrap();
        std::fs::write(
            cat.paths
                .incoming_dir()
                .join("000000010000000000000003.partial")
                .as_std_path(),
            b"partial",
        )
        .unwrap();

        let report = archive_wal(&cat, ArchiverOptions::default()).await.unwrap();
        assert_eq!(
            report.installed,
            vec![
                "000000010000000000000001".to_string(),
                "000000010000000000000002".to_string(),
            ]
        );
        assert!(cat
            .paths
            .incoming_dir()
            .join("000000010000000000000003.partial")
            .exists());
        let wals = cat.all_wals().unwrap();
        assert_eq!(wals.len(), 2);
    }

    #[tokio::test]
    async fn reingesting_identical_content_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let path = cat.paths.incoming_dir().join("000000010000000000000001");
        std::fs::write(path.as_std_path(), b"seg1").unwrap();
        archive_wal(&cat, ArchiverOptions::default()).await.unwrap();

        std::fs::write(path.as_std_path(), b"seg1").unwrap();
        let report = archive_wal(&cat, ArchiverOptions::default()).await.unwrap();
        assert!(report.installed.is_empty());
        assert_eq!(report.skipped_duplicate, vec!["000000010000000000000001".to_string()]);
        assert_eq!(cat.all_wals().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn differing_content_same_name_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let path = cat.paths.incoming_dir().join("000000010000000000000001");
        std::fs::write(path.as_std_path(), b"seg1").unwrap();
        archive_wal(&cat, ArchiverOptions::default()).await.unwrap();

        std::fs::write(path.as_std_path(), b"different bytes").unwrap();
        let report = archive_wal(&cat, ArchiverOptions::default()).await.unwrap();
        assert_eq!(report.quarantined, vec!["000000010000000000000001".to_string()]);
        assert!(cat
            .paths
            .errors_dir()
            .join("000000010000000000000001")
            .exists());
    }

    #[test]
    fn put_wal_rejects_bad_checksum() {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            let data = b"segment bytes";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, "000000010000000000000005", &data[..])
                .unwrap();

            let manifest = b"deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef  000000010000000000000005\n";
            let mut mheader = tar::Header::new_gnu();
            mheader.set_size(manifest.len() as u64);
            mheader.set_cksum();
            builder
                .append_data(&mut mheader, "SHA256SUMS", &manifest[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let err = validate_put_wal_stream(buf.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            Error::Catalog(BarmanError::ChecksumMismatch { .. })
        ));
    }
}
