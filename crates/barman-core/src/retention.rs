//! Retention policy evaluation and enforcement, per spec.md §4.5.
//!
//! No teacher analog exists for this component — neither the pageserver
//! nor the safekeeper retain anything on a calendar/redundancy policy, they
//! retain everything until a timeline is explicitly deleted. Built fresh in
//! the teacher's idiom: typed inputs/outputs, `tracing` spans, and the same
//! "compute a plan, then a separate step applies it" shape `wal_archiver`
//! uses (collect candidates, then act).

use std::str::FromStr;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use tracing::{info, instrument, warn};

use barman_catalog::{Backup, BackupStatus, Catalog, HookConfig, KeepTarget};
use barman_utils::error::BarmanError;
use barman_utils::lock::LockKind;
use barman_utils::{BackupId, WalSegmentName};

use crate::error::{Error, Result};
use crate::hooks::{self, HookEnv, Phase};

/// A parsed `retention_policy` server setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    Redundancy(usize),
    RecoveryWindow { value: i64, unit: RecoveryWindowUnit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryWindowUnit {
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicyParseError;

impl std::fmt::Display for RetentionPolicyParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid retention_policy syntax, expected \"REDUNDANCY n\" or \"RECOVERY WINDOW OF n {{DAYS|WEEKS|MONTHS}}\"")
    }
}
impl std::error::Error for RetentionPolicyParseError {}

impl FromStr for RetentionPolicy {
    type Err = RetentionPolicyParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        match tokens.as_slice() {
            ["REDUNDANCY", n] => {
                let n: usize = n.parse().map_err(|_| RetentionPolicyParseError)?;
                Ok(RetentionPolicy::Redundancy(n))
            }
            ["RECOVERY", "WINDOW", "OF", n, unit] => {
                let value: i64 = n.parse().map_err(|_| RetentionPolicyParseError)?;
                let unit = match unit.to_ascii_uppercase().as_str() {
                    "DAY" | "DAYS" => RecoveryWindowUnit::Days,
                    "WEEK" | "WEEKS" => RecoveryWindowUnit::Weeks,
                    "MONTH" | "MONTHS" => RecoveryWindowUnit::Months,
                    _ => return Err(RetentionPolicyParseError),
                };
                Ok(RetentionPolicy::RecoveryWindow { value, unit })
            }
            _ => Err(RetentionPolicyParseError),
        }
    }
}

impl RetentionPolicy {
    fn window_start(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            RetentionPolicy::Redundancy(_) => None,
            RetentionPolicy::RecoveryWindow { value, unit } => {
                let days = match unit {
                    RecoveryWindowUnit::Days => value,
                    RecoveryWindowUnit::Weeks => value * 7,
                    RecoveryWindowUnit::Months => value * 30,
                };
                Some(now - ChronoDuration::days(days))
            }
        }
    }
}

/// Per-backup retention classification, mirroring the `VALID`/`OBSOLETE`
/// labels `barman list-backups` prints alongside each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionStatus {
    Valid,
    Obsolete,
    Keep,
}

#[derive(Debug, Clone)]
pub struct RetentionDecision {
    pub backup_id: BackupId,
    pub status: RetentionStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub decisions: Vec<RetentionDecision>,
}

impl RetentionPlan {
    pub fn obsolete_ids(&self) -> Vec<BackupId> {
        self.decisions
            .iter()
            .filter(|d| d.status == RetentionStatus::Obsolete)
            .map(|d| d.backup_id)
            .collect()
    }
}

/// Evaluate `policy` against every DONE backup in the catalog, newest
/// first, honoring `minimum_redundancy` as a floor and `keep` annotations
/// as an override, per spec.md §4.5.
///
/// `keep=full` pins a backup VALID forever and excludes it from the
/// redundancy/window count entirely; `keep=standalone` does the same but
/// additionally forbids treating it as a parent for incremental chains
/// (enforced by the caller, not this function — see spec.md §9, Open
/// Question a).
#[instrument(skip(catalog, keeps), fields(server = %catalog.server))]
pub fn evaluate(
    catalog: &Catalog,
    policy: Option<RetentionPolicy>,
    minimum_redundancy: usize,
    keeps: impl Fn(BackupId) -> Option<KeepTarget>,
    now: NaiveDateTime,
) -> Result<RetentionPlan> {
    let mut backups = catalog.list_backups()?;
    backups.retain(|b| b.status == BackupStatus::Done);
    backups.sort_by_key(|b| std::cmp::Reverse(b.backup_id));

    let mut decisions = Vec::with_capacity(backups.len());
    let mut counted = 0usize;
    let window_start = policy.and_then(|p| p.window_start(now));

    for backup in &backups {
        if let Some(target) = keeps(backup.backup_id) {
            info!(backup_id = %backup.backup_id, ?target, "backup kept by annotation");
            decisions.push(RetentionDecision {
                backup_id: backup.backup_id,
                status: RetentionStatus::Keep,
            });
            continue;
        }

        let is_valid = match policy {
            None => true,
            Some(RetentionPolicy::Redundancy(n)) => counted < n,
            Some(RetentionPolicy::RecoveryWindow { .. }) => {
                let window_start = window_start.expect("recovery window policy always has a start");
                match backup.end_time {
                    Some(end_time) => end_time >= window_start,
                    None => true,
                }
            }
        };
        counted += 1;

        let status = if is_valid || counted <= minimum_redundancy {
            RetentionStatus::Valid
        } else {
            RetentionStatus::Obsolete
        };
        decisions.push(RetentionDecision {
            backup_id: backup.backup_id,
            status,
        });
    }

    enforce_minimum_redundancy(&mut decisions, minimum_redundancy);
    protect_incremental_parents(&mut decisions, &backups);

    Ok(RetentionPlan { decisions })
}

/// No matter what the policy computed, the `minimum_redundancy` most
/// recent DONE backups (excluding `keep`-annotated ones, which don't
/// count towards or against it) are never marked obsolete.
fn enforce_minimum_redundancy(decisions: &mut [RetentionDecision], minimum_redundancy: usize) {
    let mut protected = 0usize;
    for d in decisions.iter_mut() {
        if d.status == RetentionStatus::Keep {
            continue;
        }
        if protected < minimum_redundancy {
            d.status = RetentionStatus::Valid;
            protected += 1;
        }
    }
}

/// A backup that is some other (still VALID) backup's incremental parent
/// can never be deleted out from under it: deleting a parent would orphan
/// the chain. Per DESIGN.md's Open Question (a) decision, a parent whose
/// own retention status would otherwise be OBSOLETE is promoted back to
/// VALID as long as it has a VALID or KEEP descendant.
fn protect_incremental_parents(decisions: &mut [RetentionDecision], backups: &[Backup]) {
    loop {
        let mut changed = false;
        let valid_or_kept: std::collections::HashSet<BackupId> = decisions
            .iter()
            .filter(|d| d.status != RetentionStatus::Obsolete)
            .map(|d| d.backup_id)
            .collect();

        for backup in backups {
            let Some(parent) = backup.parent_backup_id else {
                continue;
            };
            if !valid_or_kept.contains(&backup.backup_id) {
                continue;
            }
            if let Some(parent_decision) = decisions.iter_mut().find(|d| d.backup_id == parent) {
                if parent_decision.status == RetentionStatus::Obsolete {
                    parent_decision.status = RetentionStatus::Valid;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Apply a retention plan: delete every OBSOLETE backup's on-disk tree
/// and catalog entry, then remove any WAL segment now older than the
/// oldest remaining backup's `begin_wal` on every timeline (spec.md
/// §4.5's "WAL obsolescence" step). Dispatches `pre_delete_script` /
/// `post_delete_script` around each deletion, per spec.md §4.7 — this is
/// the only place those hooks run for retention-driven deletes; the CLI's
/// manual `delete` command dispatches its own pair around a single id.
#[instrument(skip(catalog, hooks_config, plan), fields(server = %catalog.server))]
pub fn enforce(catalog: &Catalog, hooks_config: &HookConfig, plan: &RetentionPlan) -> Result<Vec<BackupId>> {
    let _lock = catalog.try_lock(LockKind::Delete)?;
    let mut deleted = Vec::new();

    for id in plan.obsolete_ids() {
        let pre_env = HookEnv::new(&catalog.server, Phase::Pre, false).with("BARMAN_BACKUP_ID", id);
        hooks::run_plain(hooks_config.pre_delete_script.as_deref(), Phase::Pre, &pre_env)?;

        let result = catalog.delete_backup(id);

        let status = match &result {
            Ok(()) | Err(BarmanError::NotFound(_)) => "DONE",
            Err(_) => "FAILED",
        };
        let post_env = HookEnv::new(&catalog.server, Phase::Post, false)
            .with("BARMAN_BACKUP_ID", id)
            .with("BARMAN_STATUS", status);
        hooks::run_plain(hooks_config.post_delete_script.as_deref(), Phase::Post, &post_env)?;

        match result {
            Ok(()) => {
                info!(backup_id = %id, "deleted obsolete backup");
                deleted.push(id);
            }
            Err(BarmanError::NotFound(_)) => {
                warn!(backup_id = %id, "obsolete backup already absent, skipping");
            }
            Err(e) => return Err(Error::Catalog(e)),
        }
    }

    prune_obsolete_wals(catalog)?;
    Ok(deleted)
}

/// WAL segments older than the oldest remaining backup's begin_wal, on
/// any timeline, are no longer needed to recover any retained backup and
/// are safe to remove.
fn prune_obsolete_wals(catalog: &Catalog) -> Result<()> {
    let remaining = catalog.list_backups()?;
    let oldest_begin = remaining
        .iter()
        .filter(|b| b.status == BackupStatus::Done)
        .filter_map(|b| b.begin_wal.as_deref())
        .filter_map(|w| WalSegmentName::parse(w).ok())
        .min();

    let Some(cutoff) = oldest_begin else {
        return Ok(());
    };

    let wals = catalog.all_wals()?;
    for record in wals {
        let Ok(name) = WalSegmentName::parse(&record.name) else {
            continue;
        };
        if name < cutoff {
            for ext in ["", ".gz", ".bz2", ".zst"] {
                let candidate = catalog.paths.wal_archive_path(&name, ext);
                if candidate.exists() {
                    let _ = std::fs::remove_file(candidate);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use barman_catalog::BackupMethod;
    use barman_utils::ServerName;

    fn catalog_in(dir: &std::path::Path) -> Catalog {
        let home = camino::Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        let cat = Catalog::open(home, ServerName::from("main"));
        cat.ensure_skeleton().unwrap();
        cat
    }

    fn done_backup(id: &str, cat: &Catalog, end_time: NaiveDateTime) -> Backup {
        let mut b = Backup::new_started(id.parse().unwrap(), cat.server.clone(), BackupMethod::RsyncLike, None);
        b.status = BackupStatus::Done;
        b.end_time = Some(end_time);
        b.begin_wal = Some("000000010000000000000001".to_string());
        cat.write_backup(&b).unwrap();
        b
    }

    #[test]
    fn redundancy_keeps_only_n_newest() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let now = Utc::now().naive_utc();
        done_backup("20240101T000000", &cat, now);
        done_backup("20240102T000000", &cat, now);
        done_backup("20240103T000000", &cat, now);

        let plan = evaluate(&cat, Some(RetentionPolicy::Redundancy(2)), 0, |_| None, now).unwrap();
        let obsolete = plan.obsolete_ids();
        assert_eq!(obsolete.len(), 1);
        assert_eq!(obsolete[0].to_string(), "20240101T000000");
    }

    #[test]
    fn minimum_redundancy_overrides_window() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let now = Utc::now().naive_utc();
        let old = now - ChronoDuration::days(100);
        done_backup("20240101T000000", &cat, old);

        let policy = RetentionPolicy::RecoveryWindow {
            value: 7,
            unit: RecoveryWindowUnit::Days,
        };
        let plan = evaluate(&cat, Some(policy), 1, |_| None, now).unwrap();
        assert!(plan.obsolete_ids().is_empty());
    }

    #[test]
    fn keep_full_pins_backup_valid() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let now = Utc::now().naive_utc();
        let old = now - ChronoDuration::days(100);
        let kept = done_backup("20240101T000000", &cat, old);
        done_backup("20240102T000000", &cat, now);
        done_backup("20240103T000000", &cat, now);

        let plan = evaluate(
            &cat,
            Some(RetentionPolicy::Redundancy(1)),
            0,
            move |id| if id == kept.backup_id { Some(KeepTarget::Full) } else { None },
            now,
        )
        .unwrap();
        assert!(plan.obsolete_ids().is_empty() || !plan.obsolete_ids().contains(&kept.backup_id));
        let kept_decision = plan
            .decisions
            .iter()
            .find(|d| d.backup_id == kept.backup_id)
            .unwrap();
        assert_eq!(kept_decision.status, RetentionStatus::Keep);
    }

    #[test]
    fn obsolete_parent_of_valid_incremental_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let now = Utc::now().naive_utc();

        let mut full = Backup::new_started(
            "20240101T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::NativeBasebackup,
            None,
        );
        full.status = BackupStatus::Done;
        full.end_time = Some(now);
        full.begin_wal = Some("000000010000000000000001".to_string());
        cat.write_backup(&full).unwrap();

        let mut incr = Backup::new_started(
            "20240102T000000".parse().unwrap(),
            cat.server.clone(),
            BackupMethod::NativeBasebackup,
            Some(full.backup_id),
        );
        incr.status = BackupStatus::Done;
        incr.end_time = Some(now);
        incr.begin_wal = Some("000000010000000000000002".to_string());
        cat.write_backup(&incr).unwrap();

        let plan = evaluate(&cat, Some(RetentionPolicy::Redundancy(1)), 0, |_| None, now).unwrap();
        assert!(plan.obsolete_ids().is_empty());
    }

    #[test]
    fn parse_policy_variants() {
        assert_eq!(
            "REDUNDANCY 3".parse::<RetentionPolicy>().unwrap(),
            RetentionPolicy::Redundancy(3)
        );
        assert_eq!(
            "RECOVERY WINDOW OF 2 WEEKS".parse::<RetentionPolicy>().unwrap(),
            RetentionPolicy::RecoveryWindow {
                value: 2,
                unit: RecoveryWindowUnit::Weeks
            }
        );
        assert!("garbage".parse::<RetentionPolicy>().is_err());
    }

    #[test]
    fn enforce_deletes_obsolete_backups() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog_in(dir.path());
        let now = Utc::now().naive_utc();
        done_backup("20240101T000000", &cat, now);
        let keep = done_backup("20240102T000000", &cat, now);

        let plan = evaluate(&cat, Some(RetentionPolicy::Redundancy(1)), 0, |_| None, now).unwrap();
        let deleted = enforce(&cat, &HookConfig::default(), &plan).unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].to_string(), "20240101T000000");
        assert!(cat.read_backup(keep.backup_id).is_ok());
    }
}
