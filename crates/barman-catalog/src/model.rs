//! The data model of spec.md §3: servers, backups and WAL segments.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use barman_utils::{BackupId, Lsn, ServerName, TimelineId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMethod {
    RsyncLike,
    NativeBasebackup,
    LocalRsync,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
    Rsync,
    Snapshot,
}

/// Backup lifecycle state, per spec.md §3. `Copying` is transient: it is
/// visible to a concurrent reader while the executor runs but is never
/// itself written to `backup.info` at rest (a crash mid-copy leaves the
/// entry at `Started`, which the next `check-backup` reconciles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Started,
    Empty,
    Failed,
    Done,
    Syncing,
    WaitingForWals,
    Copying,
}

impl BackupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackupStatus::Done | BackupStatus::Failed | BackupStatus::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepTarget {
    Full,
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablespace {
    pub name: String,
    pub oid: u32,
    pub location: String,
}

/// A single base backup, the in-memory counterpart of an on-disk
/// `backup.info` file (see `backup_info.rs` for the text encoding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub backup_id: BackupId,
    pub server_name: ServerName,
    pub status: BackupStatus,
    pub method: BackupMethod,
    pub backup_type: BackupType,
    pub system_identifier: Option<String>,
    pub version: Option<String>,
    pub pgdata: Option<String>,
    pub begin_wal: Option<String>,
    pub end_wal: Option<String>,
    pub begin_lsn: Option<Lsn>,
    pub end_lsn: Option<Lsn>,
    pub begin_time: Option<chrono::NaiveDateTime>,
    pub end_time: Option<chrono::NaiveDateTime>,
    pub timeline: TimelineId,
    pub tablespaces: Vec<Tablespace>,
    pub size: Option<u64>,
    pub deduplicated_size: Option<u64>,
    pub wal_size: Option<u64>,
    pub compression: Option<String>,
    pub parent_backup_id: Option<BackupId>,
    pub keep_target: Option<KeepTarget>,
    pub name: Option<String>,
    pub error: Option<String>,
    /// opaque provider metadata for `snapshot`-method backups.
    pub snapshots_info: Option<serde_json::Value>,
}

impl Backup {
    pub fn new_started(
        backup_id: BackupId,
        server_name: ServerName,
        method: BackupMethod,
        parent_backup_id: Option<BackupId>,
    ) -> Self {
        Backup {
            backup_id,
            server_name,
            status: BackupStatus::Started,
            method,
            backup_type: if parent_backup_id.is_some() {
                BackupType::Incremental
            } else {
                match method {
                    BackupMethod::Snapshot => BackupType::Snapshot,
                    BackupMethod::RsyncLike | BackupMethod::LocalRsync => BackupType::Rsync,
                    BackupMethod::NativeBasebackup => BackupType::Full,
                }
            },
            system_identifier: None,
            version: None,
            pgdata: None,
            begin_wal: None,
            end_wal: None,
            begin_lsn: None,
            end_lsn: None,
            begin_time: None,
            end_time: None,
            timeline: 1,
            tablespaces: Vec::new(),
            size: None,
            deduplicated_size: None,
            wal_size: None,
            compression: None,
            parent_backup_id,
            keep_target: None,
            name: None,
            error: None,
            snapshots_info: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == BackupStatus::Done
    }

    pub fn is_incremental(&self) -> bool {
        self.parent_backup_id.is_some()
    }

    /// Check the invariants spec.md §3 places on a `Backup` record.
    /// Does not check catalog-external facts (e.g. "begin_wal is present
    /// in the WAL store"); see `Catalog::check_backup_invariants`.
    pub fn check_local_invariants(&self) -> Result<(), String> {
        if let (Some(begin), Some(end)) = (self.begin_lsn, self.end_lsn) {
            if begin > end {
                return Err(format!(
                    "backup {}: begin_lsn {begin} > end_lsn {end}",
                    self.backup_id
                ));
            }
        }
        if let (Some(begin), Some(end)) = (self.begin_time, self.end_time) {
            if end < begin {
                return Err(format!(
                    "backup {}: end_time {end} < begin_time {begin}",
                    self.backup_id
                ));
            }
        }
        Ok(())
    }
}

/// Server-level backup method configuration, per spec.md §3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: ServerName,
    pub description: Option<String>,
    pub conninfo: Option<String>,
    pub streaming_conninfo: Option<String>,
    pub primary_conninfo: Option<String>,
    pub backup_method: BackupMethod,
    pub archiver: bool,
    pub streaming_archiver: bool,
    pub retention_policy: Option<String>,
    pub minimum_redundancy: usize,
    pub compression: Option<String>,
    pub reuse_backup: ReuseBackup,
    pub parallel_jobs: usize,
    pub parallel_jobs_start_batch_size: usize,
    pub parallel_jobs_start_batch_period: u64,
    pub basebackup_retry_times: u32,
    pub basebackup_retry_sleep: u64,
    pub immediate_checkpoint: bool,
    pub bandwidth_limit: Option<u64>,
    pub network_compression: bool,
    pub primary_checkpoint_timeout: u64,
    pub autogenerate_manifest: bool,
    pub staging_path: Option<String>,
    pub active: bool,
    pub passive: bool,
    pub hooks: HookConfig,
    /// Home directory root; `barman_home/<name>`.
    pub home: String,
    /// `check`'s WAL-archiving-lag threshold, seconds. `None` disables
    /// the check.
    pub last_backup_maximum_age: Option<u64>,
    /// `check`'s minimum acceptable size, bytes, for the latest DONE
    /// backup. `None` disables the check.
    pub last_backup_minimum_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseBackup {
    Off,
    Copy,
    Link,
}

impl Default for ReuseBackup {
    fn default() -> Self {
        ReuseBackup::Off
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    pub pre_backup: Option<String>,
    pub post_backup: Option<String>,
    pub pre_backup_retry: Option<String>,
    pub post_backup_retry: Option<String>,
    pub pre_archive: Option<String>,
    pub post_archive: Option<String>,
    pub pre_archive_retry: Option<String>,
    pub post_archive_retry: Option<String>,
    pub pre_recovery: Option<String>,
    pub post_recovery: Option<String>,
    pub pre_recovery_retry: Option<String>,
    pub post_recovery_retry: Option<String>,
    pub pre_delete_script: Option<String>,
    pub post_delete_script: Option<String>,
}

impl ServerConfig {
    pub fn extra_env(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}
