//! Advisory file locks over `{server, operation}` pairs.
//!
//! Mirrors the teacher's single-writer-per-resource discipline (the
//! catalog directory tree is the only shared state; every mutation sits
//! behind an advisory lock) but implemented with plain `fs2` file locks
//! rather than a distributed coordination service, since spec.md §9
//! states the catalog is assumed to live on one host.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::BarmanError;
use crate::ids::ServerName;

/// The operation kinds that may hold a lock on a given server, per
/// spec.md §3 ("Catalog locks"). For any (server, operation) pair there
/// exists at most one holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Backup,
    ArchiveWal,
    ReceiveWal,
    Delete,
    Recover,
    ServerXlogDb,
}

impl LockKind {
    fn file_name(self) -> &'static str {
        match self {
            LockKind::Backup => ".backup.lock",
            LockKind::ArchiveWal => ".archive-wal.lock",
            LockKind::ReceiveWal => ".receive-wal.lock",
            LockKind::Delete => ".delete.lock",
            LockKind::Recover => ".recover.lock",
            LockKind::ServerXlogDb => ".server-xlogdb.lock",
        }
    }

    pub fn operation_name(self) -> &'static str {
        match self {
            LockKind::Backup => "backup",
            LockKind::ArchiveWal => "archive-wal",
            LockKind::ReceiveWal => "receive-wal",
            LockKind::Delete => "delete",
            LockKind::Recover => "recover",
            LockKind::ServerXlogDb => "server-xlogdb",
        }
    }
}

/// A held advisory lock. Dropping it releases the lock; there is no
/// explicit `release()` needed, matching RAII file-lock idiom used
/// throughout the teacher's storage code.
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Attempt to acquire `kind` for `server` rooted at `server_home`,
/// non-blocking. Returns `BarmanError::LockBusy` immediately if another
/// process holds it.
pub fn try_acquire(
    server_home: &Path,
    server: &ServerName,
    kind: LockKind,
) -> Result<LockGuard, BarmanError> {
    let path = server_home.join(kind.file_name());
    let file = open_lock_file(&path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            write_holder_info(&file);
            Ok(LockGuard { _file: file, path })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(BarmanError::LockBusy {
            server: server.clone(),
            operation: kind.operation_name().to_string(),
            held_since: read_holder_info(&path).unwrap_or_else(|| "unknown".to_string()),
        }),
        Err(e) => Err(BarmanError::FatalInternal(format!(
            "failed to lock {path:?}: {e}"
        ))),
    }
}

/// Same as [`try_acquire`], but polls until `timeout` elapses instead of
/// failing immediately. Used by the timed-lock variant spec.md §3 allows.
pub fn acquire_with_timeout(
    server_home: &Path,
    server: &ServerName,
    kind: LockKind,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<LockGuard, BarmanError> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_acquire(server_home, server, kind) {
            Ok(guard) => return Ok(guard),
            Err(BarmanError::LockBusy { .. }) if Instant::now() < deadline => {
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(e),
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, BarmanError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BarmanError::FatalInternal(format!("creating lock directory {parent:?}: {e}"))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(|e| BarmanError::FatalInternal(format!("opening lock file {path:?}: {e}")))
}

fn write_holder_info(file: &File) {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    let _ = f.set_len(0);
    let _ = f.seek(SeekFrom::Start(0));
    let now = chrono::Utc::now().to_rfc3339();
    let _ = write!(f, "pid={} since={now}", std::process::id());
}

fn read_holder_info(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerName::from("main");
        let _first = try_acquire(dir.path(), &server, LockKind::Backup).unwrap();
        let second = try_acquire(dir.path(), &server, LockKind::Backup);
        assert!(matches!(second, Err(BarmanError::LockBusy { .. })));
    }

    #[test]
    fn distinct_operations_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerName::from("main");
        let _backup = try_acquire(dir.path(), &server, LockKind::Backup).unwrap();
        let archive = try_acquire(dir.path(), &server, LockKind::ArchiveWal);
        assert!(archive.is_ok());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerName::from("main");
        {
            let _guard = try_acquire(dir.path(), &server, LockKind::Delete).unwrap();
        }
        let again = try_acquire(dir.path(), &server, LockKind::Delete);
        assert!(again.is_ok());
    }
}
