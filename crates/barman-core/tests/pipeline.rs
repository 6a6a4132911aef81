//! Cross-module scenarios that no single module's unit tests exercise on
//! their own: a full backup followed by archiving, retention, and
//! recovery planning against the same catalog.

use std::collections::HashMap;

use barman_catalog::{BackupMethod, Catalog, HookConfig, ReuseBackup, ServerConfig, Tablespace};
use barman_core::base_backup::{self, BackupOptions, BeginBackupInfo, EndBackupInfo, ManagementConnection};
use barman_core::recovery::{self, RecoveryOptions, RecoveryTarget};
use barman_core::retention::{self, RetentionPolicy};
use barman_core::wal_archiver::{self, ArchiverOptions};
use barman_utils::{BackupIdOrAlias, Lsn, ServerName};

struct FakeConn {
    pgdata: camino::Utf8PathBuf,
}

#[async_trait::async_trait]
impl ManagementConnection for FakeConn {
    async fn begin_backup(&self, _immediate_checkpoint: bool) -> barman_core::Result<BeginBackupInfo> {
        Ok(BeginBackupInfo {
            begin_lsn: Lsn(100),
            begin_wal: "000000010000000000000001".to_string(),
            begin_time: chrono::Utc::now().naive_utc(),
            timeline: 1,
        })
    }
    async fn end_backup(&self) -> barman_core::Result<EndBackupInfo> {
        Ok(EndBackupInfo {
            end_lsn: Lsn(200),
            end_wal: "000000010000000000000001".to_string(),
            end_time: chrono::Utc::now().naive_utc(),
        })
    }
    async fn data_directory(&self) -> barman_core::Result<(String, Vec<Tablespace>)> {
        Ok((self.pgdata.to_string(), Vec::new()))
    }
    async fn system_info(&self) -> barman_core::Result<(String, String)> {
        Ok(("16.2".to_string(), "7000000000000000000".to_string()))
    }
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
        reuse_backup: ReuseBackup::Off,
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
        hooks: HookConfig::default(),
        home: home.to_string(),
        last_backup_maximum_age: None,
        last_backup_minimum_size: None,
    }
}

fn make_pgdata() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("PG_VERSION"), b"16").unwrap();
    std::fs::create_dir_all(dir.path().join("base").join("1")).unwrap();
    std::fs::write(dir.path().join("base").join("1").join("16384"), b"row bytes").unwrap();
    dir
}

/// A backup runs, its WALs land in the archive, retention keeps only the
/// newest of two full backups, and the survivor still has a working
/// recovery plan afterwards.
#[tokio::test]
async fn backup_archive_retention_and_recovery_pipeline() {
    let barman_dir = tempfile::tempdir().unwrap();
    let cat = catalog_in(barman_dir.path());
    let config = default_config(&cat.paths.home.to_string());

    let pgdata = make_pgdata();
    let conn = FakeConn {
        pgdata: camino::Utf8PathBuf::from_path_buf(pgdata.path().to_path_buf()).unwrap(),
    };

    let first = base_backup::run_backup(&cat, &config, &conn, BackupOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, barman_catalog::BackupStatus::Done);

    // A second backup's begin/end WAL segments are what the archiver and
    // retention's WAL-pruning step below both need present in xlog.db.
    std::fs::write(
        cat.paths.incoming_dir().join("000000010000000000000001").as_std_path(),
        b"segment-1",
    )
    .unwrap();
    let archived = wal_archiver::archive_wal(&cat, ArchiverOptions::default()).await.unwrap();
    assert_eq!(archived.installed, vec!["000000010000000000000001".to_string()]);

    let second = base_backup::run_backup(&cat, &config, &conn, BackupOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, barman_catalog::BackupStatus::Done);
    assert_ne!(first.backup_id, second.backup_id);

    let now = chrono::Utc::now().naive_utc();
    let plan = retention::evaluate(&cat, Some(RetentionPolicy::Redundancy(1)), 0, |_| None, now).unwrap();
    let obsolete = plan.obsolete_ids();
    assert_eq!(obsolete, vec![first.backup_id]);

    let deleted = retention::enforce(&cat, &config.hooks, &plan).unwrap();
    assert_eq!(deleted, vec![first.backup_id]);
    assert!(cat.read_backup(first.backup_id).is_err());
    assert!(cat.read_backup(second.backup_id).is_ok());

    let destination = tempfile::tempdir().unwrap();
    let recovery_plan = recovery::build_plan(
        &cat,
        BackupIdOrAlias::Id(second.backup_id),
        RecoveryOptions {
            target: RecoveryTarget::Latest,
            destination: destination.path().to_string_lossy().to_string(),
            remote_staging_path: None,
            tablespace_relocations: HashMap::new(),
            target_inclusive: true,
        },
    )
    .unwrap();
    recovery::execute(&cat, &config, &recovery_plan).await.unwrap();

    assert!(destination.path().join("PG_VERSION").exists());
    assert!(destination.path().join("base").join("1").join("16384").exists());
}

/// Recovering an incremental backup overlays both layers onto the
/// destination, newer files winning where both chains touch the same path.
#[tokio::test]
async fn recovery_overlays_incremental_chain_in_order() {
    let barman_dir = tempfile::tempdir().unwrap();
    let cat = catalog_in(barman_dir.path());
    let config = default_config(&cat.paths.home.to_string());

    let base_pgdata = make_pgdata();
    let base_conn = FakeConn {
        pgdata: camino::Utf8PathBuf::from_path_buf(base_pgdata.path().to_path_buf()).unwrap(),
    };
    let full = base_backup::run_backup(&cat, &config, &base_conn, BackupOptions::default())
        .await
        .unwrap();

    let incr_pgdata = tempfile::tempdir().unwrap();
    std::fs::write(incr_pgdata.path().join("PG_VERSION"), b"16").unwrap();
    std::fs::create_dir_all(incr_pgdata.path().join("base").join("1")).unwrap();
    std::fs::write(incr_pgdata.path().join("base").join("1").join("16384"), b"updated row").unwrap();
    std::fs::write(incr_pgdata.path().join("base").join("1").join("16385"), b"new row").unwrap();
    let incr_conn = FakeConn {
        pgdata: camino::Utf8PathBuf::from_path_buf(incr_pgdata.path().to_path_buf()).unwrap(),
    };
    let incr_options = BackupOptions {
        incremental_parent: Some(full.backup_id),
        ..BackupOptions::default()
    };
    let incremental = base_backup::run_backup(&cat, &config, &incr_conn, incr_options)
        .await
        .unwrap();
    assert_eq!(incremental.parent_backup_id, Some(full.backup_id));

    let destination = tempfile::tempdir().unwrap();
    let plan = recovery::build_plan(
        &cat,
        BackupIdOrAlias::Id(incremental.backup_id),
        RecoveryOptions {
            target: RecoveryTarget::Latest,
            destination: destination.path().to_string_lossy().to_string(),
            remote_staging_path: None,
            tablespace_relocations: HashMap::new(),
            target_inclusive: true,
        },
    )
    .unwrap();
    assert_eq!(plan.chain.backups.len(), 2);
    recovery::execute(&cat, &config, &plan).await.unwrap();

    let row = std::fs::read(destination.path().join("base").join("1").join("16384")).unwrap();
    assert_eq!(row, b"updated row");
    let new_row = std::fs::read(destination.path().join("base").join("1").join("16385")).unwrap();
    assert_eq!(new_row, b"new row");
}

/// `put-wal`'s checksum-validated stream feeds the same archival path
/// `archive-wal` uses, landing in `xlog.db` identically either way.
#[tokio::test]
async fn put_wal_stream_archives_through_the_normal_path() {
    use sha2::{Digest, Sha256};

    let barman_dir = tempfile::tempdir().unwrap();
    let cat = catalog_in(barman_dir.path());

    let data = b"wal segment payload";
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "000000010000000000000007", &data[..])
            .unwrap();

        let checksum = hex::encode(Sha256::digest(data));
        let manifest = format!("{checksum}  000000010000000000000007\n");
        let mut mheader = tar::Header::new_gnu();
        mheader.set_size(manifest.len() as u64);
        mheader.set_cksum();
        builder.append_data(&mut mheader, "SHA256SUMS", manifest.as_bytes()).unwrap();
        builder.finish().unwrap();
    }

    let files = wal_archiver::validate_put_wal_stream(buf.as_slice()).unwrap();
    assert_eq!(files.len(), 1);
    for (name, bytes) in files {
        std::fs::write(cat.paths.incoming_dir().join(&name).as_std_path(), &bytes).unwrap();
    }

    let report = wal_archiver::archive_wal(&cat, ArchiverOptions::default()).await.unwrap();
    assert_eq!(report.installed, vec!["000000010000000000000007".to_string()]);
    assert_eq!(cat.all_wals().unwrap().len(), 1);
}
