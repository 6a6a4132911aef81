//! `barman.toml` + per-server configuration-files directory, merged with a
//! writable overlay file.
//!
//! Grounded on `pageserver::config`'s pattern of parsing a `toml_edit`
//! document first (to support partial, order-preserving rewrites for
//! `config-update`) and deserializing a typed overlay with `serde` for
//! everything else, and on `SafeKeeperConf`, a plain config struct that
//! every component borrows from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use barman_catalog::{BackupMethod, HookConfig, ReuseBackup, ServerConfig};
use barman_utils::ServerName;

use crate::error::{Error, Result};

/// Raw, mostly-optional view of a server stanza as it appears in TOML,
/// before defaults are applied. Mirrors `PageServerConf`'s split between
/// "what's literally written" and "the effective struct" used at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigToml {
    pub description: Option<String>,
    pub conninfo: Option<String>,
    pub streaming_conninfo: Option<String>,
    pub primary_conninfo: Option<String>,
    pub backup_method: Option<String>,
    pub archiver: Option<bool>,
    pub streaming_archiver: Option<bool>,
    pub retention_policy: Option<String>,
    pub minimum_redundancy: Option<usize>,
    pub compression: Option<String>,
    pub reuse_backup: Option<String>,
    pub parallel_jobs: Option<usize>,
    pub parallel_jobs_start_batch_size: Option<usize>,
    pub parallel_jobs_start_batch_period: Option<u64>,
    pub basebackup_retry_times: Option<u32>,
    pub basebackup_retry_sleep: Option<u64>,
    pub immediate_checkpoint: Option<bool>,
    pub bandwidth_limit: Option<u64>,
    pub network_compression: Option<bool>,
    pub primary_checkpoint_timeout: Option<u64>,
    pub autogenerate_manifest: Option<bool>,
    pub staging_path: Option<String>,
    pub active: Option<bool>,
    pub passive: Option<bool>,
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
    pub last_backup_maximum_age: Option<u64>,
    pub last_backup_minimum_size: Option<u64>,
}

impl ServerConfigToml {
    /// Layer `other` on top of `self`: any field `other` sets wins. Used to
    /// apply the global `[server_template]` defaults, then a per-server
    /// `.conf` file, then the `.barman.auto.conf` overlay, in ascending
    /// precedence, per spec.md §9's config-layering design note.
    fn merged_over(self, base: ServerConfigToml) -> ServerConfigToml {
        ServerConfigToml {
            description: self.description.or(base.description),
            conninfo: self.conninfo.or(base.conninfo),
            streaming_conninfo: self.streaming_conninfo.or(base.streaming_conninfo),
            primary_conninfo: self.primary_conninfo.or(base.primary_conninfo),
            backup_method: self.backup_method.or(base.backup_method),
            archiver: self.archiver.or(base.archiver),
            streaming_archiver: self.streaming_archiver.or(base.streaming_archiver),
            retention_policy: self.retention_policy.or(base.retention_policy),
            minimum_redundancy: self.minimum_redundancy.or(base.minimum_redundancy),
            compression: self.compression.or(base.compression),
            reuse_backup: self.reuse_backup.or(base.reuse_backup),
            parallel_jobs: self.parallel_jobs.or(base.parallel_jobs),
            parallel_jobs_start_batch_size: self
                .parallel_jobs_start_batch_size
                .or(base.parallel_jobs_start_batch_size),
            parallel_jobs_start_batch_period: self
                .parallel_jobs_start_batch_period
                .or(base.parallel_jobs_start_batch_period),
            basebackup_retry_times: self.basebackup_retry_times.or(base.basebackup_retry_times),
            basebackup_retry_sleep: self.basebackup_retry_sleep.or(base.basebackup_retry_sleep),
            immediate_checkpoint: self.immediate_checkpoint.or(base.immediate_checkpoint),
            bandwidth_limit: self.bandwidth_limit.or(base.bandwidth_limit),
            network_compression: self.network_compression.or(base.network_compression),
            primary_checkpoint_timeout: self
                .primary_checkpoint_timeout
                .or(base.primary_checkpoint_timeout),
            autogenerate_manifest: self.autogenerate_manifest.or(base.autogenerate_manifest),
            staging_path: self.staging_path.or(base.staging_path),
            active: self.active.or(base.active),
            passive: self.passive.or(base.passive),
            pre_backup: self.pre_backup.or(base.pre_backup),
            post_backup: self.post_backup.or(base.post_backup),
            pre_backup_retry: self.pre_backup_retry.or(base.pre_backup_retry),
            post_backup_retry: self.post_backup_retry.or(base.post_backup_retry),
            pre_archive: self.pre_archive.or(base.pre_archive),
            post_archive: self.post_archive.or(base.post_archive),
            pre_archive_retry: self.pre_archive_retry.or(base.pre_archive_retry),
            post_archive_retry: self.post_archive_retry.or(base.post_archive_retry),
            pre_recovery: self.pre_recovery.or(base.pre_recovery),
            post_recovery: self.post_recovery.or(base.post_recovery),
            pre_recovery_retry: self.pre_recovery_retry.or(base.pre_recovery_retry),
            post_recovery_retry: self.post_recovery_retry.or(base.post_recovery_retry),
            pre_delete_script: self.pre_delete_script.or(base.pre_delete_script),
            post_delete_script: self.post_delete_script.or(base.post_delete_script),
            last_backup_maximum_age: self.last_backup_maximum_age.or(base.last_backup_maximum_age),
            last_backup_minimum_size: self
                .last_backup_minimum_size
                .or(base.last_backup_minimum_size),
        }
    }

    fn into_server_config(self, name: ServerName, barman_home: &str) -> Result<ServerConfig> {
        let backup_method = match self.backup_method.as_deref() {
            None | Some("rsync") => BackupMethod::RsyncLike,
            Some("postgres") => BackupMethod::NativeBasebackup,
            Some("local-rsync") => BackupMethod::LocalRsync,
            Some("snapshot") => BackupMethod::Snapshot,
            Some(other) => {
                return Err(Error::Config(format!(
                    "server {name}: unknown backup_method {other:?}"
                )))
            }
        };
        let reuse_backup = match self.reuse_backup.as_deref() {
            None | Some("off") => ReuseBackup::Off,
            Some("copy") => ReuseBackup::Copy,
            Some("link") => ReuseBackup::Link,
            Some(other) => {
                return Err(Error::Config(format!(
                    "server {name}: unknown reuse_backup {other:?}"
                )))
            }
        };
        Ok(ServerConfig {
            home: format!("{barman_home}/{name}"),
            name,
            description: self.description,
            conninfo: self.conninfo,
            streaming_conninfo: self.streaming_conninfo,
            primary_conninfo: self.primary_conninfo,
            backup_method,
            archiver: self.archiver.unwrap_or(true),
            streaming_archiver: self.streaming_archiver.unwrap_or(false),
            retention_policy: self.retention_policy,
            minimum_redundancy: self.minimum_redundancy.unwrap_or(0),
            compression: self.compression,
            reuse_backup,
            parallel_jobs: self.parallel_jobs.unwrap_or(1),
            parallel_jobs_start_batch_size: self.parallel_jobs_start_batch_size.unwrap_or(10),
            parallel_jobs_start_batch_period: self.parallel_jobs_start_batch_period.unwrap_or(1),
            basebackup_retry_times: self.basebackup_retry_times.unwrap_or(0),
            basebackup_retry_sleep: self.basebackup_retry_sleep.unwrap_or(30),
            immediate_checkpoint: self.immediate_checkpoint.unwrap_or(false),
            bandwidth_limit: self.bandwidth_limit,
            network_compression: self.network_compression.unwrap_or(false),
            primary_checkpoint_timeout: self.primary_checkpoint_timeout.unwrap_or(30),
            autogenerate_manifest: self.autogenerate_manifest.unwrap_or(false),
            staging_path: self.staging_path,
            active: self.active.unwrap_or(true),
            passive: self.passive.unwrap_or(false),
            hooks: HookConfig {
                pre_backup: self.pre_backup,
                post_backup: self.post_backup,
                pre_backup_retry: self.pre_backup_retry,
                post_backup_retry: self.post_backup_retry,
                pre_archive: self.pre_archive,
                post_archive: self.post_archive,
                pre_archive_retry: self.pre_archive_retry,
                post_archive_retry: self.post_archive_retry,
                pre_recovery: self.pre_recovery,
                post_recovery: self.post_recovery,
                pre_recovery_retry: self.pre_recovery_retry,
                post_recovery_retry: self.post_recovery_retry,
                pre_delete_script: self.pre_delete_script,
                post_delete_script: self.post_delete_script,
            },
            last_backup_maximum_age: self.last_backup_maximum_age,
            last_backup_minimum_size: self.last_backup_minimum_size,
        })
    }
}

/// The top-level `barman.toml` document: global defaults plus the
/// `configuration_files_directory` barman walks for per-server `.conf`
/// files, one server stanza per file (`[server_name]`-less, filename is
/// the server name), matching the original project's directory-of-files
/// convention rather than one giant `[servers.x]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GlobalConfigToml {
    pub barman_home: Option<String>,
    pub configuration_files_directory: Option<String>,
    #[serde(flatten)]
    pub server_template: ServerConfigToml,
}

pub struct Config {
    pub barman_home: PathBuf,
    pub servers: BTreeMap<ServerName, ServerConfig>,
}

impl Config {
    /// Load `barman_home/barman.toml`, every `.conf` file in its
    /// `configuration_files_directory`, and `barman_home/.barman.auto.conf`
    /// (if present) as the highest-precedence overlay written by
    /// `config-update`.
    pub fn load(barman_toml_path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(barman_toml_path)?;
        let global: GlobalConfigToml = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("parsing {barman_toml_path:?}: {e}")))?;

        let barman_home = PathBuf::from(
            global
                .barman_home
                .clone()
                .unwrap_or_else(|| "/var/lib/barman".to_string()),
        );

        let mut servers = BTreeMap::new();
        if let Some(dir) = &global.configuration_files_directory {
            let dir = Path::new(dir);
            if dir.is_dir() {
                let mut entries: Vec<_> = std::fs::read_dir(dir)?
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().map(|x| x == "conf").unwrap_or(false))
                    .collect();
                entries.sort_by_key(|e| e.file_name());
                for entry in entries {
                    let name = entry
                        .path()
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    let server_name = ServerName::from(name.clone());
                    let text = std::fs::read_to_string(entry.path())?;
                    let mut stanza: ServerConfigToml = toml::from_str(&text)
                        .map_err(|e| Error::Config(format!("parsing {:?}: {e}", entry.path())))?;
                    stanza = stanza.merged_over(global.server_template.clone());
                    stanza = apply_overlay(stanza, &barman_home, &name)?;
                    let effective = stanza.into_server_config(server_name.clone(), &barman_home.to_string_lossy())?;
                    servers.insert(server_name, effective);
                }
            }
        }

        Ok(Config {
            barman_home,
            servers,
        })
    }

    pub fn server(&self, name: &ServerName) -> Result<&ServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown server {name}")))
    }
}

/// The per-server `.barman.auto.conf` overlay written by `config-update`,
/// highest precedence, as spec.md §9 requires ("merges on load,
/// higher-precedence than includes").
fn overlay_path(barman_home: &Path, server: &str) -> PathBuf {
    barman_home.join(server).join(".barman.auto.conf")
}

fn apply_overlay(
    stanza: ServerConfigToml,
    barman_home: &Path,
    server: &str,
) -> Result<ServerConfigToml> {
    let path = overlay_path(barman_home, server);
    if !path.exists() {
        return Ok(stanza);
    }
    let text = std::fs::read_to_string(&path)?;
    let overlay: ServerConfigToml =
        toml::from_str(&text).map_err(|e| Error::Config(format!("parsing {path:?}: {e}")))?;
    Ok(overlay.merged_over(stanza))
}

/// `config-update`: merge `changes` (a flat JSON object of option/value
/// pairs) into the overlay file for `server`, using `toml_edit` so any
/// manually-added comments/formatting in an existing overlay survive,
/// mirroring `pageserver::config`'s use of `toml_edit` for in-place
/// config rewrites.
pub fn config_update(
    barman_home: &Path,
    server: &str,
    changes: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let path = overlay_path(barman_home, server);
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    let mut doc = existing
        .parse::<toml_edit::Document>()
        .map_err(|e| Error::Config(format!("parsing existing overlay {path:?}: {e}")))?;

    for (key, value) in changes {
        let toml_value = json_to_toml_item(value)?;
        doc[key.as_str()] = toml_value;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, doc.to_string())?;
    Ok(())
}

fn json_to_toml_item(value: &serde_json::Value) -> Result<toml_edit::Item> {
    use toml_edit::{value as tval, Item};
    Ok(match value {
        serde_json::Value::String(s) => tval(s.as_str()),
        serde_json::Value::Bool(b) => tval(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                tval(i)
            } else if let Some(f) = n.as_f64() {
                tval(f)
            } else {
                return Err(Error::Config(format!("unsupported number {n}")));
            }
        }
        serde_json::Value::Null => Item::None,
        other => {
            return Err(Error::Config(format!(
                "config-update only accepts scalar values, got {other}"
            )))
        }
    })
}
