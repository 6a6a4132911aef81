//! The on-disk catalog: servers, their backups, and their WAL archives.
//!
//! Grounded on the teacher's `safekeeper` crate, which owns an analogous
//! problem (a directory of durable, lock-guarded per-entity state backed
//! by plain files) one layer further down the stack than a distributed
//! consensus log.

pub mod backup_info;
pub mod catalog;
pub mod model;
pub mod paths;
pub mod xlogdb;

pub use catalog::Catalog;
pub use model::{
    Backup, BackupMethod, BackupStatus, BackupType, HookConfig, KeepTarget, ReuseBackup,
    ServerConfig, Tablespace,
};
pub use paths::ServerPaths;
pub use xlogdb::WalRecord;
