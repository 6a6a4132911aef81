//! The CLI surface, per spec.md §6. One `clap::Subcommand` variant per
//! stable subcommand name, mirroring `pagectl`'s `#[derive(clap::Subcommand)]`
//! style rather than `pageserver`'s builder-API `clap::Command`, since every
//! subcommand here takes a fixed, known shape (no plugin-registered
//! commands the builder API exists to support).

use barman_utils::{BackupId, BackupIdOrAlias};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "barman", about = "Backup and recovery manager for PostgreSQL-family servers")]
pub struct Cli {
    /// Path to the top-level configuration file.
    #[arg(long, global = true, default_value = "/etc/barman/barman.toml")]
    pub config: Utf8PathBuf,

    #[arg(long, value_enum, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Promote files out of `incoming/`/`streaming/` into the WAL store.
    ArchiveWal { server: String },

    /// Run a full or incremental base backup.
    Backup {
        server: String,
        #[arg(long)]
        incremental: Option<BackupId>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        reuse_backup: Option<String>,
        #[arg(long)]
        immediate_checkpoint: bool,
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        wait_timeout: Option<u64>,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        retry_times: Option<u32>,
        #[arg(long)]
        retry_sleep: Option<u64>,
        #[arg(long)]
        manifest: bool,
        #[arg(long)]
        bwlimit: Option<u64>,
    },

    /// Aggregate per-server diagnostics; exits non-zero on any failure.
    Check {
        server: Option<String>,
        #[arg(long)]
        nagios: bool,
    },

    /// Verify the latest DONE backup's local invariants still hold.
    CheckBackup {
        server: String,
        #[arg(default_value = "last")]
        backup_id: BackupIdOrAlias,
    },

    /// Verify the WAL archive's internal consistency (ordering, gaps).
    CheckWalArchive {
        server: String,
        #[arg(long)]
        timeline: Option<u32>,
    },

    /// Switch a server to a named configuration model, or reset to base.
    ConfigSwitch {
        server: String,
        model: Option<String>,
        #[arg(long)]
        reset: bool,
    },

    /// Merge a flat JSON object of option/value pairs into a server's overlay.
    ConfigUpdate { server: String, json: String },

    /// Run the scheduled maintenance pass over every active server.
    Cron {
        #[arg(long)]
        keep_descriptors: bool,
    },

    /// Remove a backup and its catalog entry.
    Delete {
        server: String,
        backup_id: BackupIdOrAlias,
    },

    /// Dump full server configuration and catalog state.
    Diagnose {
        #[arg(long)]
        show_config_source: bool,
    },

    /// Write (or rewrite) a backup's file manifest.
    GenerateManifest {
        server: String,
        #[arg(default_value = "last")]
        backup_id: BackupIdOrAlias,
    },

    /// Fetch one WAL segment from the archive, decompressing by default.
    GetWal {
        server: String,
        wal: String,
        #[arg(short = 'z', long)]
        gzip: bool,
        #[arg(long)]
        keep_compression: bool,
        #[arg(short = 'o', long = "output-directory")]
        output_dir: Option<Utf8PathBuf>,
        #[arg(short = 'p', long)]
        partial: bool,
        #[arg(short = 't', long)]
        test: bool,
    },

    /// Annotate a backup as exempt from retention (`full` or `standalone`),
    /// query its keep status, or release a previous annotation.
    Keep {
        server: String,
        backup_id: BackupIdOrAlias,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        status: bool,
        #[arg(long)]
        release: bool,
    },

    /// List a server's backups, newest last.
    ListBackups {
        server: String,
        #[arg(long)]
        minimal: bool,
    },

    /// List the files that make up one backup.
    ListFiles {
        server: String,
        backup_id: BackupIdOrAlias,
        #[arg(long)]
        target: Option<String>,
    },

    /// List every configured server.
    ListServers {
        #[arg(long)]
        minimal: bool,
    },

    /// List every barman-managed child process for a server.
    ListProcesses { server: String },

    /// Accept a `put-wal` tar stream on stdin and archive it.
    PutWal {
        server: String,
        #[arg(short = 't', long)]
        test: bool,
    },

    /// Regenerate `xlog.db` from the files present in the archive.
    RebuildXlogdb { server: String },

    /// Start, stop or reset the long-lived WAL streaming receiver.
    ReceiveWal {
        server: String,
        #[arg(long)]
        create_slot: bool,
        #[arg(long)]
        if_not_exists: bool,
        #[arg(long)]
        drop_slot: bool,
        #[arg(long)]
        reset: bool,
        #[arg(long)]
        stop: bool,
    },

    /// Restore a backup (plus WAL replay) to a destination directory.
    Recover {
        server: String,
        backup_id: BackupIdOrAlias,
        destination: Utf8PathBuf,
        #[arg(long)]
        target_time: Option<String>,
        #[arg(long)]
        target_lsn: Option<String>,
        #[arg(long)]
        target_name: Option<String>,
        #[arg(long)]
        target_immediate: bool,
        #[arg(long)]
        exclusive: bool,
        #[arg(long)]
        remote_staging_path: Option<String>,
    },

    /// Report streaming/hot-standby replication status.
    ReplicationStatus {
        server: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        minimal: bool,
    },

    /// Print one backup's full catalog entry.
    ShowBackup {
        server: String,
        backup_id: BackupIdOrAlias,
    },

    /// Print one server's effective configuration.
    ShowServers { server: Option<String> },

    /// Print one server's current status summary.
    Status { server: String },

    /// Force the connected server to switch to a new WAL segment.
    SwitchWal {
        server: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        archive: bool,
        #[arg(long)]
        archive_timeout: Option<u64>,
    },

    /// Reconcile the catalog's backup records against a remote copy.
    SyncBackup { server: String, backup_id: BackupIdOrAlias },
    /// Reconcile the catalog's xlog.db against a remote copy.
    SyncWals { server: String },
    /// Print the facts a `sync-backup`/`sync-wals` peer would need.
    SyncInfo { server: String },

    /// Ask a managed child process to stop.
    TerminateProcess { server: String, task: String },

    /// Remove an advisory lock file with no live holder.
    LockDirectoryCleanup,

    /// Verify a backup's manifest checksums against the files on disk.
    VerifyBackup {
        server: String,
        backup_id: BackupIdOrAlias,
    },
}
