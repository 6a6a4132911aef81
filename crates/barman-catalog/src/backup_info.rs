//! `backup.info`: a key=value UTF-8 text file, one `Backup` per file.
//!
//! The key set is stable (spec.md §6) so that external tooling built
//! against older versions keeps working; unknown keys on read are
//! ignored rather than rejected, and missing optional keys simply leave
//! the corresponding field `None`.

use std::collections::HashMap;

use barman_utils::{BackupId, Lsn, ServerName};

use crate::model::{Backup, BackupMethod, BackupStatus, BackupType, KeepTarget, Tablespace};

pub fn serialize(backup: &Backup) -> String {
    let mut out = String::new();
    macro_rules! kv {
        ($key:expr, $val:expr) => {
            out.push_str($key);
            out.push('=');
            out.push_str(&$val);
            out.push('\n');
        };
    }
    kv!("backup_id", backup.backup_id.to_string());
    kv!("server_name", backup.server_name.to_string());
    kv!("status", status_to_str(backup.status).to_string());
    kv!("mode", method_to_str(backup.method).to_string());
    kv!("backup_type", backup_type_to_str(backup.backup_type).to_string());
    kv!("timeline", backup.timeline.to_string());
    if let Some(v) = &backup.system_identifier {
        kv!("system_identifier", v.clone());
    }
    if let Some(v) = &backup.version {
        kv!("version", v.clone());
    }
    if let Some(v) = &backup.pgdata {
        kv!("pgdata", v.clone());
    }
    if let Some(v) = &backup.begin_wal {
        kv!("begin_wal", v.clone());
    }
    if let Some(v) = &backup.end_wal {
        kv!("end_wal", v.clone());
    }
    if let Some(v) = backup.begin_lsn {
        kv!("begin_xlog", v.to_string());
    }
    if let Some(v) = backup.end_lsn {
        kv!("end_xlog", v.to_string());
    }
    if let Some(v) = backup.begin_time {
        kv!("begin_time", v.and_utc().timestamp().to_string());
    }
    if let Some(v) = backup.end_time {
        kv!("end_time", v.and_utc().timestamp().to_string());
    }
    if let Some(v) = backup.size {
        kv!("size", v.to_string());
    }
    if let Some(v) = backup.deduplicated_size {
        kv!("deduplicated_size", v.to_string());
    }
    if let Some(v) = backup.wal_size {
        kv!("wal_size", v.to_string());
    }
    if let Some(v) = &backup.compression {
        kv!("compression", v.clone());
    }
    if let Some(v) = &backup.parent_backup_id {
        kv!("parent_backup_id", v.to_string());
    }
    if let Some(v) = backup.keep_target {
        kv!("keep_target", keep_target_to_str(v).to_string());
    }
    if let Some(v) = &backup.name {
        kv!("name", v.clone());
    }
    if let Some(v) = &backup.error {
        kv!("error", v.clone());
    }
    if !backup.tablespaces.is_empty() {
        kv!(
            "tablespaces",
            serde_json::to_string(&backup.tablespaces).unwrap_or_default()
        );
    }
    if let Some(v) = &backup.snapshots_info {
        kv!("snapshots_info", v.to_string());
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("backup.info missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("backup.info has invalid value for {key:?}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

pub fn parse(contents: &str) -> Result<Backup, ParseError> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in contents.lines() {
        if let Some((k, v)) = line.split_once('=') {
            fields.insert(k.trim(), v.trim());
        }
    }

    let get = |key: &'static str| fields.get(key).copied();
    let require = |key: &'static str| get(key).ok_or(ParseError::MissingKey(key));
    let parse_field = |key: &'static str, v: &str| -> Result<_, ParseError> {
        v.parse().map_err(|_| ParseError::InvalidValue {
            key,
            value: v.to_string(),
        })
    };

    let backup_id: BackupId = parse_field("backup_id", require("backup_id")?)?;
    let server_name = ServerName::from(require("server_name")?);
    let status = status_from_str(require("status")?).ok_or(ParseError::InvalidValue {
        key: "status",
        value: require("status")?.to_string(),
    })?;
    let method = method_from_str(require("mode")?).ok_or(ParseError::InvalidValue {
        key: "mode",
        value: require("mode")?.to_string(),
    })?;
    let backup_type = get("backup_type")
        .and_then(backup_type_from_str)
        .unwrap_or(BackupType::Full);
    let timeline = get("timeline")
        .map(|v| parse_field("timeline", v))
        .transpose()?
        .unwrap_or(1);

    Ok(Backup {
        backup_id,
        server_name,
        status,
        method,
        backup_type,
        system_identifier: get("system_identifier").map(String::from),
        version: get("version").map(String::from),
        pgdata: get("pgdata").map(String::from),
        begin_wal: get("begin_wal").map(String::from),
        end_wal: get("end_wal").map(String::from),
        begin_lsn: get("begin_xlog")
            .map(|v| parse_field("begin_xlog", v))
            .transpose()?,
        end_lsn: get("end_xlog")
            .map(|v| parse_field("end_xlog", v))
            .transpose()?,
        begin_time: get("begin_time")
            .map(|v| parse_field::<i64>("begin_time", v))
            .transpose()?
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.naive_utc()),
        end_time: get("end_time")
            .map(|v| parse_field::<i64>("end_time", v))
            .transpose()?
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.naive_utc()),
        tablespaces: get("tablespaces")
            .map(|v| serde_json::from_str::<Vec<Tablespace>>(v))
            .transpose()
            .map_err(|_| ParseError::InvalidValue {
                key: "tablespaces",
                value: get("tablespaces").unwrap_or_default().to_string(),
            })?
            .unwrap_or_default(),
        size: get("size").map(|v| parse_field("size", v)).transpose()?,
        deduplicated_size: get("deduplicated_size")
            .map(|v| parse_field("deduplicated_size", v))
            .transpose()?,
        wal_size: get("wal_size").map(|v| parse_field("wal_size", v)).transpose()?,
        compression: get("compression").map(String::from),
        parent_backup_id: get("parent_backup_id")
            .map(|v| parse_field("parent_backup_id", v))
            .transpose()?,
        keep_target: get("keep_target").and_then(keep_target_from_str),
        name: get("name").map(String::from),
        error: get("error").map(String::from),
        snapshots_info: get("snapshots_info").and_then(|v| serde_json::from_str(v).ok()),
    })
}

fn status_to_str(s: BackupStatus) -> &'static str {
    match s {
        BackupStatus::Started => "STARTED",
        BackupStatus::Empty => "EMPTY",
        BackupStatus::Failed => "FAILED",
        BackupStatus::Done => "DONE",
        BackupStatus::Syncing => "SYNCING",
        BackupStatus::WaitingForWals => "WAITING_FOR_WALS",
        BackupStatus::Copying => "COPYING",
    }
}

fn status_from_str(s: &str) -> Option<BackupStatus> {
    Some(match s {
        "STARTED" => BackupStatus::Started,
        "EMPTY" => BackupStatus::Empty,
        "FAILED" => BackupStatus::Failed,
        "DONE" => BackupStatus::Done,
        "SYNCING" => BackupStatus::Syncing,
        "WAITING_FOR_WALS" => BackupStatus::WaitingForWals,
        "COPYING" => BackupStatus::Copying,
        _ => return None,
    })
}

fn method_to_str(m: BackupMethod) -> &'static str {
    match m {
        BackupMethod::RsyncLike => "rsync",
        BackupMethod::NativeBasebackup => "postgres",
        BackupMethod::LocalRsync => "local-rsync",
        BackupMethod::Snapshot => "snapshot",
    }
}

fn method_from_str(s: &str) -> Option<BackupMethod> {
    Some(match s {
        "rsync" => BackupMethod::RsyncLike,
        "postgres" => BackupMethod::NativeBasebackup,
        "local-rsync" => BackupMethod::LocalRsync,
        "snapshot" => BackupMethod::Snapshot,
        _ => return None,
    })
}

fn backup_type_to_str(t: BackupType) -> &'static str {
    match t {
        BackupType::Full => "full",
        BackupType::Incremental => "incremental",
        BackupType::Rsync => "rsync",
        BackupType::Snapshot => "snapshot",
    }
}

fn backup_type_from_str(s: &str) -> Option<BackupType> {
    Some(match s {
        "full" => BackupType::Full,
        "incremental" => BackupType::Incremental,
        "rsync" => BackupType::Rsync,
        "snapshot" => BackupType::Snapshot,
        _ => return None,
    })
}

fn keep_target_to_str(k: KeepTarget) -> &'static str {
    match k {
        KeepTarget::Full => "full",
        KeepTarget::Standalone => "standalone",
    }
}

fn keep_target_from_str(s: &str) -> Option<KeepTarget> {
    Some(match s {
        "full" => KeepTarget::Full,
        "standalone" => KeepTarget::Standalone,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupMethod;

    #[test]
    fn roundtrip_minimal() {
        let backup = Backup::new_started(
            "20240101T000000".parse().unwrap(),
            ServerName::from("main"),
            BackupMethod::RsyncLike,
            None,
        );
        let text = serialize(&backup);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.backup_id, backup.backup_id);
        assert_eq!(parsed.server_name, backup.server_name);
        assert_eq!(parsed.status, backup.status);
        assert_eq!(parsed.method, backup.method);
    }

    #[test]
    fn roundtrip_full_done_backup() {
        let mut backup = Backup::new_started(
            "20240101T000000".parse().unwrap(),
            ServerName::from("main"),
            BackupMethod::RsyncLike,
            None,
        );
        backup.status = BackupStatus::Done;
        backup.begin_lsn = Some(Lsn(100));
        backup.end_lsn = Some(Lsn(200));
        backup.begin_wal = Some("000000010000000000000001".to_string());
        backup.end_wal = Some("000000010000000000000002".to_string());
        backup.size = Some(12345);
        backup.tablespaces = vec![Tablespace {
            name: "ts1".to_string(),
            oid: 16400,
            location: "/data/ts1".to_string(),
        }];
        let text = serialize(&backup);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.begin_lsn, backup.begin_lsn);
        assert_eq!(parsed.end_lsn, backup.end_lsn);
        assert_eq!(parsed.tablespaces, backup.tablespaces);
        assert_eq!(parsed.status, BackupStatus::Done);
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let err = parse("server_name=main\n").unwrap_err();
        assert!(matches!(err, ParseError::MissingKey("backup_id")));
    }
}
