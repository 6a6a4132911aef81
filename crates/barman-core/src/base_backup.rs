//! The Base Backup Executor, per spec.md §4.4.
//!
//! Grounded on `pageserver::basebackup`'s "walk a directory tree, copy
//! every regular file and tablespace specially" shape, and on
//! `safekeeper::wal_backup`'s bounded-parallelism copy-pool pattern
//! (batched starts, retry per file) for the parallel-copy step.

use std::path::Path;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::{instrument, warn};
use walkdir::WalkDir;

use barman_catalog::{Backup, BackupMethod, Catalog, ServerConfig, Tablespace};
use barman_utils::error::{BarmanError, CopyFailureKind};
use barman_utils::lock::LockKind;
use barman_utils::BackupId;

use crate::copy_driver::CopyDriver;
use crate::error::{Error, Result};
use crate::hooks::{self, HookEnv, Phase};

/// A stand-in for the database management connection spec.md §4.4 step 2
/// opens. Out of scope per spec.md §1 ("the physical transport tools...
/// treated as pluggable drivers"); this trait is the narrow seam a real
/// client implementation plugs into.
#[async_trait::async_trait]
pub trait ManagementConnection: Send + Sync {
    async fn begin_backup(&self, immediate_checkpoint: bool) -> Result<BeginBackupInfo>;
    async fn end_backup(&self) -> Result<EndBackupInfo>;
    async fn data_directory(&self) -> Result<(String, Vec<Tablespace>)>;
    async fn system_info(&self) -> Result<(String, String)>;

    /// Step 5 of spec.md §4.4 for replicas: when `primary_conninfo` is
    /// set, trigger a WAL switch on the primary at end-of-backup and wait
    /// up to `checkpoint_timeout` for a new WAL if the standby is idle.
    /// A real client overrides this; the default is a no-op since this
    /// trait has no transport to reach the primary with (spec.md §1).
    async fn trigger_primary_wal_switch(&self, _checkpoint_timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BeginBackupInfo {
    pub begin_lsn: barman_utils::Lsn,
    pub begin_wal: String,
    pub begin_time: chrono::NaiveDateTime,
    pub timeline: barman_utils::TimelineId,
}

#[derive(Debug, Clone)]
pub struct EndBackupInfo {
    pub end_lsn: barman_utils::Lsn,
    pub end_wal: String,
    pub end_time: chrono::NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub incremental_parent: Option<BackupId>,
    pub name: Option<String>,
    pub reuse_backup: barman_catalog::ReuseBackup,
    pub immediate_checkpoint: bool,
    pub keep_partial_on_failure: bool,
    pub generate_manifest: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            incremental_parent: None,
            name: None,
            reuse_backup: barman_catalog::ReuseBackup::Off,
            immediate_checkpoint: false,
            keep_partial_on_failure: false,
            generate_manifest: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

/// Run a full `rsync-like` base backup end to end, per spec.md §4.4's
/// numbered protocol. `native-basebackup` and `snapshot` share this
/// envelope but swap step 4; they are not yet implemented here (see
/// DESIGN.md) since no example in the reference pack exercises a native
/// streaming base-backup client to ground them against.
#[instrument(skip(catalog, config, conn, options), fields(server = %catalog.server))]
pub async fn run_backup(
    catalog: &Catalog,
    config: &ServerConfig,
    conn: &dyn ManagementConnection,
    options: BackupOptions,
) -> Result<Backup> {
    if !matches!(config.backup_method, BackupMethod::RsyncLike | BackupMethod::LocalRsync) {
        return Err(Error::Catalog(BarmanError::Unsupported(format!(
            "backup_method {:?} has no transport driver in this build; only rsync-like and \
             local-rsync are implemented",
            config.backup_method
        ))));
    }

    let _lock = catalog.try_lock(LockKind::Backup)?;

    let backup_id = catalog.reserve_backup_id()?;
    let mut backup = Backup::new_started(
        backup_id,
        catalog.server.clone(),
        config.backup_method,
        options.incremental_parent,
    );
    backup.name = options.name.clone();
    catalog.write_backup(&backup)?;

    let env = HookEnv::new(&catalog.server, Phase::Pre, false).with("BARMAN_BACKUP_ID", backup_id);
    hooks::run_plain(config.hooks.pre_backup.as_deref(), Phase::Pre, &env)?;
    hooks::run_retry(
        config.hooks.pre_backup_retry.as_deref(),
        Phase::Pre,
        &env,
        config.basebackup_retry_times.max(1),
    )?;

    let result = run_backup_body(catalog, config, conn, &options, &mut backup).await;

    let (status, error) = match &result {
        Ok(()) => (barman_catalog::BackupStatus::Done, None),
        Err(e) => (barman_catalog::BackupStatus::Failed, Some(e.to_string())),
    };
    backup.status = status;
    backup.error = error.clone();
    catalog.write_backup(&backup)?;

    if result.is_err() && !options.keep_partial_on_failure {
        let _ = std::fs::remove_dir_all(catalog.paths.backup_data_dir(backup_id).as_std_path());
    }

    let post_env = HookEnv::new(&catalog.server, Phase::Post, false)
        .with("BARMAN_BACKUP_ID", backup_id)
        .with(
            "BARMAN_STATUS",
            if result.is_ok() { "DONE" } else { "FAILED" },
        )
        .with_opt("BARMAN_ERROR", error);
    hooks::run_plain(config.hooks.post_backup.as_deref(), Phase::Post, &post_env)?;
    hooks::run_retry(
        config.hooks.post_backup_retry.as_deref(),
        Phase::Post,
        &post_env,
        config.basebackup_retry_times.max(1),
    )?;

    result?;
    Ok(backup)
}

async fn run_backup_body(
    catalog: &Catalog,
    config: &ServerConfig,
    conn: &dyn ManagementConnection,
    options: &BackupOptions,
    backup: &mut Backup,
) -> Result<()> {
    let (version, system_identifier) = conn.system_info().await?;
    backup.version = Some(version);
    backup.system_identifier = Some(system_identifier);

    let (pgdata, tablespaces) = conn.data_directory().await?;
    backup.pgdata = Some(pgdata.clone());
    backup.tablespaces = tablespaces.clone();

    let begin = conn.begin_backup(config.immediate_checkpoint).await?;
    backup.begin_lsn = Some(begin.begin_lsn);
    backup.begin_wal = Some(begin.begin_wal);
    backup.begin_time = Some(begin.begin_time);
    backup.timeline = begin.timeline;
    backup.status = barman_catalog::BackupStatus::Copying;
    catalog.write_backup(backup)?;

    let dest = catalog.paths.backup_data_dir(backup.backup_id);
    let driver = CopyDriver::RsyncLike;
    driver.prepare(&dest)?;

    let source = Path::new(&pgdata);
    let reuse_dir = options
        .incremental_parent
        .map(|p| catalog.paths.backup_data_dir(p));
    let link_reuse = options.reuse_backup == barman_catalog::ReuseBackup::Link;
    let copy_reuse = options.reuse_backup != barman_catalog::ReuseBackup::Off;

    let total_size = copy_tree(
        source,
        dest.as_std_path(),
        reuse_dir.as_deref().map(|p| p.as_std_path()),
        copy_reuse,
        link_reuse,
        driver,
        config.parallel_jobs.max(1),
        config.basebackup_retry_times,
        config.basebackup_retry_sleep,
        config.parallel_jobs_start_batch_size,
        config.parallel_jobs_start_batch_period,
    )
    .await?;
    backup.size = Some(total_size);

    for ts in &tablespaces {
        let ts_dest = catalog.paths.backup_dir(backup.backup_id).join(ts.oid.to_string());
        driver.prepare(&ts_dest)?;
        copy_tree(
            Path::new(&ts.location),
            ts_dest.as_std_path(),
            None,
            false,
            false,
            driver,
            config.parallel_jobs.max(1),
            config.basebackup_retry_times,
            config.basebackup_retry_sleep,
            config.parallel_jobs_start_batch_size,
            config.parallel_jobs_start_batch_period,
        )
        .await?;
    }

    let end = conn.end_backup().await?;
    backup.end_lsn = Some(end.end_lsn);
    backup.end_wal = Some(end.end_wal);
    backup.end_time = Some(end.end_time);

    if config.primary_conninfo.is_some() {
        conn.trigger_primary_wal_switch(Duration::from_secs(config.primary_checkpoint_timeout))
            .await?;
    }

    if options.generate_manifest || config.autogenerate_manifest {
        let manifest = generate_manifest(dest.as_std_path())?;
        let manifest_path = catalog.paths.backup_manifest_path(backup.backup_id);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Catalog(BarmanError::FatalInternal(format!("serializing manifest: {e}"))))?;
        barman_utils::atomic_file::write_atomic(manifest_path.as_std_path(), &json)?;
    }

    driver.finalize(&dest)?;
    Ok(())
}

/// Copy every regular file under `source` into `dest`, bounded by
/// `parallel_jobs` concurrent workers, each file retried up to
/// `retry_times` with `retry_sleep` seconds between attempts. New copies
/// are started in batches of at most `batch_size`, one batch every
/// `batch_period` seconds, per spec.md §4.4 step 4 (`batch_size` of `0`
/// disables the throttle). Returns the total bytes copied (copies only;
/// hardlinked reuse is free).
#[allow(clippy::too_many_arguments)]
async fn copy_tree(
    source: &Path,
    dest: &Path,
    reuse_from: Option<&Path>,
    copy_reuse: bool,
    link_reuse: bool,
    driver: CopyDriver,
    parallel_jobs: usize,
    retry_times: u32,
    retry_sleep: u64,
    batch_size: usize,
    batch_period: u64,
) -> Result<u64> {
    if !source.exists() {
        return Err(Error::Catalog(BarmanError::CopyFailed {
            kind: CopyFailureKind::Persistent,
            detail: format!("source directory {source:?} does not exist"),
        }));
    }

    let files: Vec<_> = WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();

    let mut total = 0u64;
    let mut pool = FuturesUnordered::new();
    let mut iter = files.into_iter();
    let mut started_in_batch = 0usize;

    loop {
        let pushed = match iter.next() {
            Some(src) => {
                if batch_size > 0 && started_in_batch >= batch_size {
                    tokio::time::sleep(Duration::from_secs(batch_period)).await;
                    started_in_batch = 0;
                }
                let rel = src.strip_prefix(source).unwrap().to_path_buf();
                let dest_file = dest.join(&rel);
                let reuse_file = reuse_from.map(|r| r.join(&rel));
                pool.push(copy_one_with_retry(
                    src,
                    dest_file,
                    if copy_reuse { reuse_file } else { None },
                    link_reuse,
                    driver,
                    retry_times,
                    retry_sleep,
                ));
                started_in_batch += 1;
                true
            }
            None => false,
        };
        if !pushed || pool.len() >= parallel_jobs {
            match pool.next().await {
                Some(result) => total += result?,
                None => break,
            }
        }
    }
    Ok(total)
}

async fn copy_one_with_retry(
    src: std::path::PathBuf,
    dest: std::path::PathBuf,
    reuse_from: Option<std::path::PathBuf>,
    link_reuse: bool,
    driver: CopyDriver,
    retry_times: u32,
    retry_sleep: u64,
) -> Result<u64> {
    barman_utils::backoff::retry(
        || {
            let src = src.clone();
            let dest = dest.clone();
            let reuse_from = reuse_from.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    driver.copy_file(&src, &dest, reuse_from.as_deref(), link_reuse)?;
                    std::fs::metadata(&dest).map(|m| m.len()).map_err(|e| {
                        BarmanError::FatalInternal(format!("stat {dest:?}: {e}"))
                    })
                })
                .await
                .unwrap_or_else(|e| {
                    Err(BarmanError::FatalInternal(format!("copy task panicked: {e}")))
                })
            }
        },
        |e: &BarmanError| !e.is_transient_copy_failure(),
        retry_times.max(1),
        (retry_sleep.max(1) * 1000),
        (retry_sleep.max(1) * 1000 * 10),
        "base backup file copy",
    )
    .await
    .map_err(Error::Catalog)
}

pub fn generate_manifest(root: &Path) -> Result<Vec<ManifestEntry>> {
    use sha2::{Digest, Sha256};
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let data = std::fs::read(entry.path())
            .map_err(|e| Error::Catalog(BarmanError::FatalInternal(format!("reading {:?}: {e}", entry.path()))))?;
        let checksum = hex::encode(Sha256::digest(&data));
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        entries.push(ManifestEntry {
            path: rel.to_string_lossy().to_string(),
            size: data.len() as u64,
            checksum,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// `--wait`: block until every WAL in `[begin_wal, end_wal]` is present
/// in the Catalog, or `timeout` elapses.
pub async fn wait_for_wal_archival(
    catalog: &Catalog,
    begin_wal: &str,
    end_wal: &str,
    timeout: Duration,
) -> Result<()> {
    let begin = barman_utils::WalSegmentName::parse(begin_wal)
        .map_err(|e| Error::Catalog(BarmanError::Unsupported(format!("bad begin_wal: {e}"))))?;
    let end = barman_utils::WalSegmentName::parse(end_wal)
        .map_err(|e| Error::Catalog(BarmanError::Unsupported(format!("bad end_wal: {e}"))))?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let wals = catalog.list_wals(Some(&begin), None, None)?;
        if wals.iter().any(|w| w.name == end.canonical()) || begin == end {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("timed out waiting for WAL archival up to {end_wal}");
            return Err(Error::Catalog(BarmanError::Timeout(format!(
                "WAL {end_wal} not archived within timeout"
            ))));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barman_utils::ServerName;

    struct FakeConn;

    #[async_trait::async_trait]
    impl ManagementConnection for FakeConn {
        async fn begin_backup(&self, _immediate_checkpoint: bool) -> Result<BeginBackupInfo> {
            Ok(BeginBackupInfo {
                begin_lsn: barman_utils::Lsn(100),
                begin_wal: "000000010000000000000001".to_string(),
                begin_time: chrono::Utc::now().naive_utc(),
                timeline: 1,
            })
        }
        async fn end_backup(&self) -> Result<EndBackupInfo> {
            Ok(EndBackupInfo {
                end_lsn: barman_utils::Lsn(200),
                end_wal: "000000010000000000000002".to_string(),
                end_time: chrono::Utc::now().naive_utc(),
            })
        }
        async fn data_directory(&self) -> Result<(String, Vec<Tablespace>)> {
            Ok((self.pgdata_path(), Vec::new()))
        }
        async fn system_info(&self) -> Result<(String, String)> {
            Ok(("16.2".to_string(), "6953729163782456789".to_string()))
        }
    }

    impl FakeConn {
        fn pgdata_path(&self) -> String {
            PGDATA_DIR.with(|d| d.borrow().clone())
        }
    }

    thread_local! {
        static PGDATA_DIR: std::cell::RefCell<String> = std::cell::RefCell::new(String::new());
    }

    fn catalog_in(dir: &std::path::Path) -> Catalog {
        let home = camino::Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        let cat = Catalog::open(home, ServerName::from("main"));
        cat.ensure_skeleton().unwrap();
        cat
    }

    fn default_config(home: &str) -> ServerConfig {
        ServerConfig {
            name: ServerName::from("main"),
            description: None,
            conninfo: None,
            streaming_conninfo: None,
            primary_conninfo: None,
            backup_method: BackupMethod::RsyncLike,
            archiver: true,
            streaming_archiver: false,
            retention_policy: None,
            minimum_redundancy: 0,
            compression: None,
            reuse_backup: barman_catalog::ReuseBackup::Off,
            parallel_jobs: 2,
            parallel_jobs_start_batch_size: 10,
            parallel_jobs_start_batch_period: 1,
            basebackup_retry_times: 1,
            basebackup_retry_sleep: 1,
            immediate_checkpoint: false,
            bandwidth_limit: None,
            network_compression: false,
            primary_checkpoint_timeout: 30,
            autogenerate_manifest: false,
            staging_path: None,
            active: true,
            passive: false,
            hooks: Default::default(),
            home: home.to_string(),
            last_backup_maximum_age: None,
            last_backup_minimum_size: None,
        }
    }

    #[tokio::test]
    async fn full_backup_produces_done_entry_with_copied_tree() {
        let barman_dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(barman_dir.path());

        let pgdata_dir = tempfile::tempdir().unwrap();
        std::fs::write(pgdata_dir.path().join("PG_VERSION"), b"16").unwrap();
        std::fs::create_dir_all(pgdata_dir.path().join("base")).unwrap();
        std::fs::write(pgdata_dir.path().join("base").join("1"), b"data").unwrap();
        PGDATA_DIR.with(|d| *d.borrow_mut() = pgdata_dir.path().to_string_lossy().to_string());

        let config = default_config(&cat.paths.home.to_string());
        let backup = run_backup(&cat, &config, &FakeConn, BackupOptions::default())
            .await
            .unwrap();

        assert_eq!(backup.status, barman_catalog::BackupStatus::Done);
        assert!(cat
            .paths
            .backup_data_dir(backup.backup_id)
            .join("PG_VERSION")
            .exists());
        assert!(cat
            .paths
            .backup_data_dir(backup.backup_id)
            .join("base")
            .join("1")
            .exists());

        let stored = cat.read_backup(backup.backup_id).unwrap();
        assert_eq!(stored.status, barman_catalog::BackupStatus::Done);
        assert_eq!(stored.begin_wal.as_deref(), Some("000000010000000000000001"));
    }
}
