//! `barman`: the command-line entrypoint, per spec.md §6.
//!
//! Grounded on `compute_tools::compute_ctl`'s `main()` shape (init
//! tracing, parse args, dispatch to a library crate, translate the
//! result into a process exit code) adapted from `clap`'s builder API
//! to the derive API `pagectl` uses, since every subcommand here has a
//! fixed shape known at compile time.

mod cli;

use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use barman_catalog::{BackupStatus, Catalog, KeepTarget, ServerConfig};
use barman_core::base_backup::{self, BackupOptions, ManagementConnection};
use barman_core::config::Config;
use barman_core::error::Error as CoreError;
use barman_core::recovery::{self, RecoveryOptions, RecoveryTarget};
use barman_core::{orchestrator, wal_archiver, wal_streamer};
use barman_utils::error::BarmanError;
use barman_utils::{BackupIdOrAlias, Lsn, ServerName};
use sha2::Digest;

use cli::{Cli, Command, OutputFormat};

fn main() {
    let cli = Cli::parse();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let format = cli.format;
    let runtime = tokio::runtime::Runtime::new().expect("building tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report_error(format, &e);
            std::process::exit(1);
        }
    }
}

fn report_error(format: OutputFormat, err: &anyhow::Error) {
    match format {
        OutputFormat::Text => eprintln!("ERROR: {err}"),
        OutputFormat::Json => {
            let kind = err
                .downcast_ref::<CoreError>()
                .map(|e| e.kind_tag())
                .unwrap_or("Error");
            let obj = serde_json::json!({ "kind": kind, "message": err.to_string() });
            println!("{obj}");
        }
    }
}

fn print_value(format: OutputFormat, value: &impl serde::Serialize, text: impl FnOnce() -> String) {
    match format {
        OutputFormat::Text => println!("{}", text()),
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("ERROR: serializing output: {e}"),
        },
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    Config::load(cli.config.as_std_path())
        .with_context(|| format!("loading configuration from {}", cli.config))
}

fn open_server(config: &Config, server: &str) -> anyhow::Result<(Catalog, ServerConfig)> {
    let name = ServerName::from(server);
    let server_config = config
        .server(&name)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("unknown server {server:?}"))?
        .clone();
    let home = camino::Utf8PathBuf::from_path_buf(config.barman_home.clone())
        .map_err(|p| anyhow!("barman_home {p:?} is not valid UTF-8"))?;
    let catalog = Catalog::open(home, name);
    catalog.ensure_skeleton().map_err(CoreError::Catalog)?;
    Ok((catalog, server_config))
}

/// Stands in for a real client connection to the managed database, per
/// spec.md §1's "transport tools are pluggable drivers, not this crate's
/// job" boundary: every operation that would require one fails cleanly
/// instead of silently doing nothing.
struct UnconfiguredConnection;

#[async_trait::async_trait]
impl ManagementConnection for UnconfiguredConnection {
    async fn begin_backup(&self, _immediate_checkpoint: bool) -> barman_core::Result<base_backup::BeginBackupInfo> {
        Err(unconfigured())
    }
    async fn end_backup(&self) -> barman_core::Result<base_backup::EndBackupInfo> {
        Err(unconfigured())
    }
    async fn data_directory(&self) -> barman_core::Result<(String, Vec<barman_catalog::Tablespace>)> {
        Err(unconfigured())
    }
    async fn system_info(&self) -> barman_core::Result<(String, String)> {
        Err(unconfigured())
    }
    async fn trigger_primary_wal_switch(&self, _checkpoint_timeout: Duration) -> barman_core::Result<()> {
        Err(unconfigured())
    }
}

fn unconfigured() -> CoreError {
    CoreError::Catalog(BarmanError::Unsupported(
        "no management connection is configured for this build; plug in a real client via \
         ManagementConnection before running live backups"
            .to_string(),
    ))
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let format = cli.format;
    match &cli.command {
        Command::ArchiveWal { server } => {
            let config = load_config(&cli)?;
            let (catalog, server_config) = open_server(&config, server)?;
            let compression = server_config
                .compression
                .as_deref()
                .and_then(barman_utils::compression::Compression::parse_catalog_name)
                .unwrap_or_default();
            let report = wal_archiver::archive_wal(
                &catalog,
                wal_archiver::ArchiverOptions {
                    compression,
                    parallel_jobs: server_config.parallel_jobs,
                    hooks: server_config.hooks.clone(),
                    retry_times: server_config.basebackup_retry_times,
                },
            )
            .await?;
            print_value(format, &report_to_json(&report), || {
                format!(
                    "installed {} quarantined {} duplicate {}",
                    report.installed.len(),
                    report.quarantined.len(),
                    report.skipped_duplicate.len()
                )
            });
            Ok(0)
        }

        Command::Backup {
            server,
            incremental,
            name,
            reuse_backup,
            immediate_checkpoint,
            wait,
            wait_timeout,
            jobs: _,
            retry_times: _,
            retry_sleep: _,
            manifest,
            bwlimit: _,
        } => {
            let config = load_config(&cli)?;
            let (catalog, mut server_config) = open_server(&config, server)?;
            server_config.immediate_checkpoint = server_config.immediate_checkpoint || *immediate_checkpoint;
            let reuse = match reuse_backup.as_deref() {
                None | Some("off") => barman_catalog::ReuseBackup::Off,
                Some("copy") => barman_catalog::ReuseBackup::Copy,
                Some("link") => barman_catalog::ReuseBackup::Link,
                Some(other) => return Err(anyhow!("unknown --reuse-backup value {other:?}")),
            };
            let options = BackupOptions {
                incremental_parent: *incremental,
                name: name.clone(),
                reuse_backup: reuse,
                immediate_checkpoint: server_config.immediate_checkpoint,
                keep_partial_on_failure: false,
                generate_manifest: *manifest,
            };
            let conn = UnconfiguredConnection;
            let backup = base_backup::run_backup(&catalog, &server_config, &conn, options).await?;
            if *wait {
                if let (Some(begin), Some(end)) = (&backup.begin_wal, &backup.end_wal) {
                    base_backup::wait_for_wal_archival(
                        &catalog,
                        begin,
                        end,
                        Duration::from_secs(wait_timeout.unwrap_or(3600)),
                    )
                    .await?;
                }
            }
            print_value(format, &backup, || format!("backup {} done", backup.backup_id));
            Ok(0)
        }

        Command::Check { server, nagios } => {
            let config = load_config(&cli)?;
            let now = chrono::Utc::now().naive_utc();
            let mut all_passed = true;
            let mut reports = Vec::new();
            let names: Vec<String> = match server {
                Some(s) => vec![s.clone()],
                None => config.servers.keys().map(|n| n.0.clone()).collect(),
            };
            for name in names {
                let (catalog, server_config) = open_server(&config, &name)?;
                let diag = orchestrator::check(&catalog, &server_config, None, now);
                all_passed &= diag.passed();
                reports.push(diag);
            }
            if *nagios {
                if all_passed {
                    println!("BARMAN OK - all servers passed all checks");
                } else {
                    println!("BARMAN CRITICAL - one or more servers failed a check");
                }
            } else {
                for diag in &reports {
                    println!("Server {}:", diag.server);
                    for item in &diag.checks {
                        println!(
                            "  {}: {:?}{}",
                            item.name,
                            item.status,
                            item.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
                        );
                    }
                }
            }
            Ok(if all_passed { 0 } else { 1 })
        }

        Command::CheckBackup { server, backup_id } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let _ = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            let ok = orchestrator::check_backup(&catalog)?;
            println!("{}", if ok { "OK" } else { "FAILED" });
            Ok(if ok { 0 } else { 1 })
        }

        Command::CheckWalArchive { server, timeline } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let wals = catalog.list_wals(None, None, *timeline).map_err(CoreError::Catalog)?;
            let mut ok = true;
            for pair in wals.windows(2) {
                let a = barman_utils::WalSegmentName::parse(&pair[0].name);
                let b = barman_utils::WalSegmentName::parse(&pair[1].name);
                if let (Ok(a), Ok(b)) = (a, b) {
                    if a >= b {
                        ok = false;
                        eprintln!("out-of-order WAL entries: {} then {}", pair[0].name, pair[1].name);
                    }
                }
            }
            println!("{}", if ok { "OK" } else { "INCONSISTENT" });
            Ok(if ok { 0 } else { 1 })
        }

        Command::ConfigSwitch { server, model, reset } => {
            let config = load_config(&cli)?;
            let _ = open_server(&config, server)?;
            if *reset {
                let path = config.barman_home.join(server).join(".barman.auto.conf");
                let _ = std::fs::remove_file(path);
                println!("configuration reset for {server}");
            } else if let Some(model) = model {
                barman_core::config::config_update(
                    &config.barman_home,
                    server,
                    serde_json::json!({ "active_model": model })
                        .as_object()
                        .expect("object literal"),
                )?;
                println!("switched {server} to model {model}");
            } else {
                return Err(anyhow!("config-switch requires either a MODEL or --reset"));
            }
            Ok(0)
        }

        Command::ConfigUpdate { server, json } => {
            let config = load_config(&cli)?;
            let _ = open_server(&config, server)?;
            let value: serde_json::Value = serde_json::from_str(json).context("parsing config-update JSON")?;
            let obj = value.as_object().ok_or_else(|| anyhow!("config-update JSON must be an object"))?;
            barman_core::config::config_update(&config.barman_home, server, obj)?;
            println!("updated configuration overlay for {server}");
            Ok(0)
        }

        Command::Cron { keep_descriptors: _ } => {
            let config = load_config(&cli)?;
            let now = chrono::Utc::now().naive_utc();
            let home = camino::Utf8PathBuf::from_path_buf(config.barman_home.clone())
                .map_err(|p| anyhow!("barman_home {p:?} is not valid UTF-8"))?;
            let results = orchestrator::cron(&home, &config.servers, now).await;
            let mut any_failed = false;
            for (name, result) in &results {
                match result {
                    Ok(report) => println!(
                        "{name}: archived={} retention_deleted={} check_backup_ok={}",
                        report.archived.as_ref().map(|r| r.installed.len()).unwrap_or(0),
                        report.retention_obsolete.len(),
                        report.check_backup_ok
                    ),
                    Err(e) => {
                        any_failed = true;
                        eprintln!("{name}: cron failed: {e}");
                    }
                }
            }
            Ok(if any_failed { 1 } else { 0 })
        }

        Command::Delete { server, backup_id } => {
            let config = load_config(&cli)?;
            let (catalog, server_config) = open_server(&config, server)?;
            let backup = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            let env = barman_core::hooks::HookEnv::new(&catalog.server, barman_core::hooks::Phase::Pre, false)
                .with("BARMAN_BACKUP_ID", backup.backup_id);
            barman_core::hooks::run_plain(server_config.hooks.pre_delete_script.as_deref(), barman_core::hooks::Phase::Pre, &env)?;
            catalog.delete_backup(backup.backup_id).map_err(CoreError::Catalog)?;
            let post_env = barman_core::hooks::HookEnv::new(&catalog.server, barman_core::hooks::Phase::Post, false)
                .with("BARMAN_BACKUP_ID", backup.backup_id)
                .with("BARMAN_STATUS", "DONE");
            barman_core::hooks::run_plain(server_config.hooks.post_delete_script.as_deref(), barman_core::hooks::Phase::Post, &post_env)?;
            println!("deleted backup {}", backup.backup_id);
            Ok(0)
        }

        Command::Diagnose { show_config_source } => {
            let config = load_config(&cli)?;
            #[derive(serde::Serialize)]
            struct ServerDiag {
                name: String,
                backups: usize,
                wals: usize,
            }
            let mut servers = Vec::new();
            for name in config.servers.keys() {
                let (catalog, _) = open_server(&config, &name.0)?;
                servers.push(ServerDiag {
                    name: name.0.clone(),
                    backups: catalog.list_backups().map_err(CoreError::Catalog)?.len(),
                    wals: catalog.all_wals().map_err(CoreError::Catalog)?.len(),
                });
            }
            if *show_config_source {
                println!("config source: {}", cli.config);
            }
            print_value(format, &servers, || format!("{} servers configured", servers.len()));
            Ok(0)
        }

        Command::GenerateManifest { server, backup_id } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let backup = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            let data_dir = catalog.paths.backup_data_dir(backup.backup_id);
            let manifest = base_backup::generate_manifest(data_dir.as_std_path())?;
            let manifest_path = catalog.paths.backup_manifest_path(backup.backup_id);
            let json = serde_json::to_vec_pretty(&manifest).context("serializing manifest")?;
            barman_utils::atomic_file::write_atomic(manifest_path.as_std_path(), &json)
                .map_err(CoreError::Catalog)?;
            println!("wrote manifest for backup {} ({} files)", backup.backup_id, manifest.len());
            Ok(0)
        }

        Command::GetWal { server, wal, gzip: _, keep_compression, output_dir, partial, test } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let name = barman_utils::WalSegmentName::parse(wal).map_err(|e| anyhow!("{e}"))?;
            let mut found = None;
            for ext in ["", ".gz", ".zst"] {
                let path = catalog.paths.wal_archive_path(&name, ext);
                if path.exists() {
                    found = Some((path, ext));
                    break;
                }
            }
            let Some((path, ext)) = found else {
                if *partial {
                    let partial_path = catalog.paths.streaming_dir().join(format!("{wal}.partial"));
                    if partial_path.exists() {
                        let bytes = std::fs::read(partial_path.as_std_path())?;
                        if *test {
                            println!("{} bytes available (partial)", bytes.len());
                            return Ok(0);
                        }
                        std::io::Write::write_all(&mut std::io::stdout(), &bytes)?;
                        return Ok(0);
                    }
                }
                return Err(anyhow!("WAL segment {wal} not found in archive"));
            };
            if *test {
                println!("WAL {wal} found ({path})");
                return Ok(0);
            }
            let raw = std::fs::read(path.as_std_path())?;
            let compression = barman_utils::compression::Compression::parse_catalog_name(match ext {
                ".gz" => "gzip",
                ".zst" => "zstd",
                _ => "none",
            })
            .unwrap_or_default();
            let bytes = if *keep_compression { raw } else { compression.decompress(&raw)? };
            match output_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir.as_std_path())?;
                    std::fs::write(dir.join(wal).as_std_path(), &bytes)?;
                }
                None => {
                    std::io::Write::write_all(&mut std::io::stdout(), &bytes)?;
                }
            }
            Ok(0)
        }

        Command::Keep { server, backup_id, target, status, release } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let mut backup = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            if *status {
                match backup.keep_target {
                    Some(KeepTarget::Full) => println!("keep: full"),
                    Some(KeepTarget::Standalone) => println!("keep: standalone"),
                    None => println!("keep: none"),
                }
                return Ok(0);
            }
            if *release {
                backup.keep_target = None;
            } else if let Some(target) = target {
                backup.keep_target = Some(match target.as_str() {
                    "full" => KeepTarget::Full,
                    "standalone" => KeepTarget::Standalone,
                    other => return Err(anyhow!("unknown --target {other:?}, expected full or standalone")),
                });
            } else {
                return Err(anyhow!("keep requires --target, --status, or --release"));
            }
            catalog.write_backup(&backup).map_err(CoreError::Catalog)?;
            Ok(0)
        }

        Command::ListBackups { server, minimal } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let backups = catalog.list_backups().map_err(CoreError::Catalog)?;
            if *minimal {
                for b in &backups {
                    println!("{}", b.backup_id);
                }
            } else {
                print_value(format, &backups, || {
                    backups
                        .iter()
                        .map(|b| format!("{} {:?}", b.backup_id, b.status))
                        .collect::<Vec<_>>()
                        .join("\n")
                });
            }
            Ok(0)
        }

        Command::ListFiles { server, backup_id, target } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let backup = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            let want_data = target.as_deref() != Some("wal");
            if want_data {
                let root = catalog.paths.backup_data_dir(backup.backup_id);
                if root.exists() {
                    for entry in walkdir::WalkDir::new(root.as_std_path())
                        .into_iter()
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_file())
                    {
                        println!("{}", entry.path().display());
                    }
                }
            }
            if target.as_deref() == Some("wal") || target.as_deref() == Some("full") {
                if let Some(begin) = &backup.begin_wal {
                    let begin = barman_utils::WalSegmentName::parse(begin).map_err(|e| anyhow!("{e}"))?;
                    for record in catalog.list_wals(Some(&begin), None, Some(backup.timeline)).map_err(CoreError::Catalog)? {
                        println!("{}", record.name);
                    }
                }
            }
            Ok(0)
        }

        Command::ListServers { minimal } => {
            let config = load_config(&cli)?;
            for name in config.servers.keys() {
                if *minimal {
                    println!("{name}");
                } else {
                    let server_config = &config.servers[name];
                    println!("{name} - {}", server_config.description.clone().unwrap_or_default());
                }
            }
            Ok(0)
        }

        Command::ListProcesses { server } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            for p in orchestrator::list_processes(&catalog) {
                println!("{} {} pid={}", p.server, p.task, p.pid);
            }
            Ok(0)
        }

        Command::PutWal { server, test } => {
            let config = load_config(&cli)?;
            let (catalog, server_config) = open_server(&config, server)?;
            let stdin = std::io::stdin();
            let files = wal_archiver::validate_put_wal_stream(stdin.lock())?;
            if *test {
                println!("put-wal stream valid, {} file(s)", files.len());
                return Ok(0);
            }
            for (name, bytes) in files {
                let dest = catalog.paths.incoming_dir().join(&name);
                std::fs::write(dest.as_std_path(), &bytes)?;
            }
            let compression = server_config
                .compression
                .as_deref()
                .and_then(barman_utils::compression::Compression::parse_catalog_name)
                .unwrap_or_default();
            wal_archiver::archive_wal(
                &catalog,
                wal_archiver::ArchiverOptions {
                    compression,
                    parallel_jobs: server_config.parallel_jobs,
                    hooks: server_config.hooks.clone(),
                    retry_times: server_config.basebackup_retry_times,
                },
            )
            .await?;
            Ok(0)
        }

        Command::RebuildXlogdb { server } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let records = catalog.rebuild_xlogdb().map_err(CoreError::Catalog)?;
            println!("rebuilt xlog.db with {} entries", records.len());
            Ok(0)
        }

        Command::ReceiveWal { server, create_slot: _, if_not_exists: _, drop_slot: _, reset, stop } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let supervisor = wal_streamer::Supervisor::new(&catalog);
            if *stop {
                supervisor.stop(Duration::from_secs(30))?;
                println!("receiver stopped");
            } else if *reset {
                supervisor.reset(Duration::from_secs(30))?;
                println!("receiver reset");
            } else {
                return Err(unconfigured_receiver());
            }
            Ok(0)
        }

        Command::Recover {
            server,
            backup_id,
            destination,
            target_time,
            target_lsn,
            target_name,
            target_immediate,
            exclusive,
            remote_staging_path,
        } => {
            let config = load_config(&cli)?;
            let (catalog, server_config) = open_server(&config, server)?;
            let target = if *target_immediate {
                RecoveryTarget::Immediate
            } else if let Some(t) = target_time {
                RecoveryTarget::Time(
                    chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S")
                        .context("parsing --target-time, expected \"YYYY-MM-DD HH:MM:SS\"")?,
                )
            } else if let Some(l) = target_lsn {
                RecoveryTarget::Lsn(l.parse::<Lsn>().map_err(|e| anyhow!("parsing --target-lsn: {e}"))?)
            } else if let Some(n) = target_name {
                RecoveryTarget::Name(n.clone())
            } else {
                RecoveryTarget::Latest
            };
            let options = RecoveryOptions {
                target,
                destination: destination.to_string(),
                remote_staging_path: remote_staging_path.clone(),
                tablespace_relocations: std::collections::HashMap::new(),
                target_inclusive: !exclusive,
            };
            let plan = recovery::build_plan(&catalog, *backup_id, options)?;
            recovery::execute(&catalog, &server_config, &plan).await?;
            println!("recovered to {}", plan.destination);
            Ok(0)
        }

        Command::ReplicationStatus { server, source: _, target: _, minimal: _ } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let wals = catalog.all_wals().map_err(CoreError::Catalog)?;
            println!(
                "local catalog only (no live connection configured): {} WAL segments archived",
                wals.len()
            );
            Ok(0)
        }

        Command::ShowBackup { server, backup_id } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let backup = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            print_value(format, &backup, || format!("{backup:#?}"));
            Ok(0)
        }

        Command::ShowServers { server } => {
            let config = load_config(&cli)?;
            let names: Vec<String> = match server {
                Some(s) => vec![s.clone()],
                None => config.servers.keys().map(|n| n.0.clone()).collect(),
            };
            for name in names {
                let server_config = config.server(&ServerName::from(name.as_str()))?;
                print_value(format, server_config, || format!("{server_config:#?}"));
            }
            Ok(0)
        }

        Command::Status { server } => {
            let config = load_config(&cli)?;
            let (catalog, server_config) = open_server(&config, server)?;
            let backups = catalog.list_backups().map_err(CoreError::Catalog)?;
            let last_done = backups.iter().rev().find(|b| b.status == BackupStatus::Done);
            println!("server: {server}");
            println!("  archiver: {}", server_config.archiver);
            println!("  streaming_archiver: {}", server_config.streaming_archiver);
            println!(
                "  last backup: {}",
                last_done.map(|b| b.backup_id.to_string()).unwrap_or_else(|| "none".to_string())
            );
            Ok(0)
        }

        Command::SwitchWal { server, force: _, archive, archive_timeout: _ } => {
            let config = load_config(&cli)?;
            let (catalog, server_config) = open_server(&config, server)?;
            if *archive {
                let compression = server_config
                    .compression
                    .as_deref()
                    .and_then(barman_utils::compression::Compression::parse_catalog_name)
                    .unwrap_or_default();
                wal_archiver::archive_wal(
                    &catalog,
                    wal_archiver::ArchiverOptions {
                        compression,
                        parallel_jobs: server_config.parallel_jobs,
                        hooks: server_config.hooks.clone(),
                        retry_times: server_config.basebackup_retry_times,
                    },
                )
                .await?;
                println!("archived pending WAL files; requesting an actual segment switch needs a live connection");
                Ok(0)
            } else {
                Err(unconfigured().into())
            }
        }

        Command::SyncBackup { .. } | Command::SyncWals { .. } => Err(anyhow!(
            "sync-backup/sync-wals require a configured remote transport, which this build does not provide"
        )),

        Command::SyncInfo { server } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let backups = catalog.list_backups().map_err(CoreError::Catalog)?;
            let wals = catalog.all_wals().map_err(CoreError::Catalog)?;
            #[derive(serde::Serialize)]
            struct SyncInfo {
                backups: usize,
                wals: usize,
                last_backup: Option<String>,
            }
            let info = SyncInfo {
                backups: backups.len(),
                wals: wals.len(),
                last_backup: backups.last().map(|b| b.backup_id.to_string()),
            };
            print_value(format, &info, || format!("{} backups, {} wals", info.backups, info.wals));
            Ok(0)
        }

        Command::TerminateProcess { server, task } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            orchestrator::terminate_process(&catalog, task, Duration::from_secs(30))?;
            println!("{task} terminated");
            Ok(0)
        }

        Command::LockDirectoryCleanup => {
            let config = load_config(&cli)?;
            let mut total = 0;
            for name in config.servers.keys() {
                let (catalog, _) = open_server(&config, &name.0)?;
                total += orchestrator::lock_directory_cleanup(&catalog)?;
            }
            println!("removed {total} stale lock file(s)");
            Ok(0)
        }

        Command::VerifyBackup { server, backup_id } => {
            let config = load_config(&cli)?;
            let (catalog, _) = open_server(&config, server)?;
            let backup = catalog.resolve_alias(*backup_id).map_err(CoreError::Catalog)?;
            let manifest_path = catalog.paths.backup_manifest_path(backup.backup_id);
            let text = std::fs::read_to_string(manifest_path.as_std_path())
                .with_context(|| format!("backup {} has no manifest; run generate-manifest first", backup.backup_id))?;
            let manifest: Vec<base_backup::ManifestEntry> =
                serde_json::from_str(&text).context("parsing backup_manifest")?;
            let data_dir = catalog.paths.backup_data_dir(backup.backup_id);
            let mut failures = 0;
            for entry in &manifest {
                let path = data_dir.join(&entry.path);
                match std::fs::read(path.as_std_path()) {
                    Ok(bytes) => {
                        let checksum = hex::encode(sha2::Sha256::digest(&bytes));
                        if checksum != entry.checksum {
                            failures += 1;
                            eprintln!("checksum mismatch: {}", entry.path);
                        }
                    }
                    Err(_) => {
                        failures += 1;
                        eprintln!("missing file: {}", entry.path);
                    }
                }
            }
            println!("{} files checked, {failures} failure(s)", manifest.len());
            Ok(if failures == 0 { 0 } else { 1 })
        }
    }
}

fn unconfigured_receiver() -> anyhow::Error {
    anyhow!(
        "starting the streaming receiver requires a configured receiver command for this build; \
         only --stop and --reset are available without one"
    )
}

fn report_to_json(report: &wal_archiver::ArchiveReport) -> serde_json::Value {
    serde_json::json!({
        "installed": report.installed,
        "quarantined": report.quarantined,
        "skipped_duplicate": report.skipped_duplicate,
    })
}
