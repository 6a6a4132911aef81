//! The Catalog: per-server registry of backups and WAL segments.
//!
//! Grounded on `safekeeper::control_file::FileStorage` (atomic
//! read/modify/persist of one record per entity) and
//! `safekeeper::timelines_global_map` (a directory of per-entity handles
//! gated by locks), adapted from "one timeline's control file" to "one
//! server's fleet of backup.info files plus its xlog.db journal".

use std::time::Duration;

use barman_utils::error::BarmanError;
use barman_utils::lock::{self, LockGuard, LockKind};
use barman_utils::{BackupId, BackupIdOrAlias, ServerName, TimelineId, WalSegmentName};

use crate::backup_info;
use crate::model::{Backup, BackupStatus};
use crate::paths::ServerPaths;
use crate::xlogdb::{self, WalRecord};

pub struct Catalog {
    pub server: ServerName,
    pub paths: ServerPaths,
}

impl Catalog {
    pub fn open(barman_home: impl Into<camino::Utf8PathBuf>, server: ServerName) -> Self {
        let home = crate::paths::server_home(&barman_home.into(), &server.0);
        Catalog {
            server,
            paths: ServerPaths::new(home),
        }
    }

    pub fn ensure_skeleton(&self) -> Result<(), BarmanError> {
        self.paths
            .ensure_skeleton()
            .map_err(|e| BarmanError::FatalInternal(format!("creating server home: {e}")))
    }

    // ---- locks ----------------------------------------------------

    pub fn try_lock(&self, kind: LockKind) -> Result<LockGuard, BarmanError> {
        lock::try_acquire(self.paths.home.as_std_path(), &self.server, kind)
    }

    pub fn lock_with_timeout(
        &self,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<LockGuard, BarmanError> {
        lock::acquire_with_timeout(
            self.paths.home.as_std_path(),
            &self.server,
            kind,
            timeout,
            Duration::from_millis(200),
        )
    }

    // ---- backups ----------------------------------------------------

    /// All backups, chronological (ascending by id). Entries whose
    /// `backup.info` fails to parse are logged and excluded, per spec.md
    /// §7's read-time `CatalogCorrupt` policy.
    pub fn list_backups(&self) -> Result<Vec<Backup>, BarmanError> {
        let base_dir = self.paths.base_dir();
        if !base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&base_dir)
            .map_err(|e| BarmanError::FatalInternal(format!("reading {base_dir:?}: {e}")))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(id) = name.parse::<BackupId>() else {
                continue;
            };
            match self.read_backup(id) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    tracing::warn!("excluding corrupt backup {id} for server {}: {e}", self.server);
                }
            }
        }
        backups.sort_by_key(|b| b.backup_id);
        Ok(backups)
    }

    pub fn read_backup(&self, id: BackupId) -> Result<Backup, BarmanError> {
        let path = self.paths.backup_info_path(id);
        let contents = std::fs::read_to_string(&path).map_err(|_| {
            BarmanError::NotFound(format!("backup {id} not found for server {}", self.server))
        })?;
        backup_info::parse(&contents).map_err(|e| BarmanError::CatalogCorrupt {
            server: self.server.clone(),
            detail: format!("backup.info for {id}: {e}"),
        })
    }

    pub fn write_backup(&self, backup: &Backup) -> Result<(), BarmanError> {
        let path = self.paths.backup_info_path(backup.backup_id);
        barman_utils::atomic_file::write_atomic(
            path.as_std_path(),
            backup_info::serialize(backup).as_bytes(),
        )
    }

    /// Reserve a fresh id for a new backup, refusing to collide with one
    /// that already exists (spec.md §4.1's tie-break rule).
    pub fn reserve_backup_id(&self) -> Result<BackupId, BarmanError> {
        let id = BackupId::now();
        if self.paths.backup_dir(id).exists() {
            return Err(BarmanError::FatalInternal(format!(
                "backup id {id} already exists for server {} (clock collision)",
                self.server
            )));
        }
        Ok(id)
    }

    /// Remove a backup's catalog entry and on-disk tree. Because
    /// `reuse_backup=link` backups share file content via hardlinks,
    /// removing this tree only ever drops this backup's links; files
    /// still referenced by another backup's hardlinks survive because
    /// the filesystem itself keeps them alive by link count (spec.md §9).
    pub fn delete_backup(&self, id: BackupId) -> Result<(), BarmanError> {
        let dir = self.paths.backup_dir(id);
        if !dir.exists() {
            return Err(BarmanError::NotFound(format!(
                "backup {id} not found for server {}",
                self.server
            )));
        }
        std::fs::remove_dir_all(&dir)
            .map_err(|e| BarmanError::FatalInternal(format!("deleting {dir:?}: {e}")))
    }

    /// Resolve an id or alias against the current catalog contents.
    /// `auto` is resolved the same as `last` here; the Recovery Planner
    /// refines it further by checking backup usability for a given target.
    pub fn resolve_alias(&self, alias: BackupIdOrAlias) -> Result<Backup, BarmanError> {
        let backups = self.list_backups()?;
        let not_found = || {
            BarmanError::NotFound(format!(
                "no backup matching {alias:?} for server {}",
                self.server
            ))
        };
        match alias {
            BackupIdOrAlias::Id(id) => self.read_backup(id),
            BackupIdOrAlias::First => backups.into_iter().next().ok_or_else(not_found),
            BackupIdOrAlias::Last | BackupIdOrAlias::Auto => {
                backups.into_iter().last().ok_or_else(not_found)
            }
            BackupIdOrAlias::LastFull => backups
                .into_iter()
                .rev()
                .find(|b| !b.is_incremental())
                .ok_or_else(not_found),
            BackupIdOrAlias::LastFailed => backups
                .into_iter()
                .rev()
                .find(|b| b.status == BackupStatus::Failed)
                .ok_or_else(not_found),
        }
    }

    // ---- WAL store ----------------------------------------------------

    pub fn append_wal(&self, record: WalRecord) -> Result<(), BarmanError> {
        xlogdb::append(self.paths.xlogdb_path().as_std_path(), &record)
    }

    pub fn rebuild_xlogdb(&self) -> Result<Vec<WalRecord>, BarmanError> {
        xlogdb::rebuild(
            self.paths.wals_dir().as_std_path(),
            self.paths.xlogdb_path().as_std_path(),
        )
    }

    pub fn all_wals(&self) -> Result<Vec<WalRecord>, BarmanError> {
        xlogdb::read_all(self.paths.xlogdb_path().as_std_path())
    }

    /// WAL segments in the half-open range `[from, to)`, optionally
    /// restricted to one timeline, per spec.md §4.1.
    pub fn list_wals(
        &self,
        from: Option<&WalSegmentName>,
        to: Option<&WalSegmentName>,
        timeline: Option<TimelineId>,
    ) -> Result<Vec<WalRecord>, BarmanError> {
        let all = self.all_wals()?;
        Ok(all
            .into_iter()
            .filter(|r| {
                let Ok(name) = WalSegmentName::parse(&r.name) else {
                    return false;
                };
                if let Some(tli) = timeline {
                    if name.timeline != tli {
                        return false;
                    }
                }
                if let Some(from) = from {
                    if name < *from {
                        return false;
                    }
                }
                if let Some(to) = to {
                    if name >= *to {
                        return false;
                    }
                }
                true
            })
            .collect())
    }

    pub fn wal_exists(&self, name: &WalSegmentName) -> Result<bool, BarmanError> {
        Ok(self
            .all_wals()?
            .iter()
            .any(|r| r.name == name.canonical()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Backup, BackupMethod};
    use barman_utils::lock::LockKind;

    fn catalog_in(dir: &std::path::Path) -> Catalog {
        let home = camino::Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        let cat = Catalog::open(home, ServerName::from("main"));
        cat.ensure_skeleton().unwrap();
        cat
    }

    #[test]
    fn empty_catalog_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        assert!(cat.list_backups().unwrap().is_empty());
    }

    #[test]
    fn write_then_list_then_resolve_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());

        let mut b1 = Backup::new_started(
            "20240101T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::RsyncLike,
            None,
        );
        b1.status = BackupStatus::Done;
        let mut b2 = Backup::new_started(
            "20240102T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::RsyncLike,
            None,
        );
        b2.status = BackupStatus::Done;

        cat.write_backup(&b1).unwrap();
        cat.write_backup(&b2).unwrap();

        let backups = cat.list_backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].backup_id, b1.backup_id);

        let last = cat.resolve_alias(BackupIdOrAlias::Last).unwrap();
        assert_eq!(last.backup_id, b2.backup_id);
        let first = cat.resolve_alias(BackupIdOrAlias::First).unwrap();
        assert_eq!(first.backup_id, b1.backup_id);
    }

    #[test]
    fn last_full_excludes_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());

        let mut full = Backup::new_started(
            "20240101T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::NativeBasebackup,
            None,
        );
        full.status = BackupStatus::Done;
        cat.write_backup(&full).unwrap();

        let mut incr = Backup::new_started(
            "20240102T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::NativeBasebackup,
            Some(full.backup_id),
        );
        incr.status = BackupStatus::Done;
        cat.write_backup(&incr).unwrap();

        let last_full = cat.resolve_alias(BackupIdOrAlias::LastFull).unwrap();
        assert_eq!(last_full.backup_id, full.backup_id);
    }

    #[test]
    fn delete_removes_backup_and_not_found_after() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let backup = Backup::new_started(
            "20240101T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::RsyncLike,
            None,
        );
        cat.write_backup(&backup).unwrap();
        cat.delete_backup(backup.backup_id).unwrap();
        assert!(matches!(
            cat.read_backup(backup.backup_id),
            Err(BarmanError::NotFound(_))
        ));
    }

    #[test]
    fn locks_are_per_server_per_operation() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let _backup_lock = cat.try_lock(LockKind::Backup).unwrap();
        assert!(matches!(
            cat.try_lock(LockKind::Backup),
            Err(BarmanError::LockBusy { .. })
        ));
        assert!(cat.try_lock(LockKind::ArchiveWal).is_ok());
    }

    #[test]
    fn wal_range_is_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        for n in 1..=3u32 {
            let name = format!("00000001{:08X}{:08X}", 0, n);
            cat.append_wal(WalRecord {
                name,
                size: 16 * 1024 * 1024,
                time: 0,
                compression: barman_utils::compression::Compression::None,
            })
            .unwrap();
        }
        let from = WalSegmentName::parse("000000010000000000000001").unwrap();
        let to = WalSegmentName::parse("000000010000000000000003").unwrap();
        let range = cat.list_wals(Some(&from), Some(&to), None).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].name, "000000010000000000000001");
        assert_eq!(range[1].name, "000000010000000000000002");
    }
}
