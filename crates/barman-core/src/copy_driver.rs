//! Copy drivers: the pluggable transport behind a base backup.
//!
//! Sealed tagged variants rather than dynamic dispatch, per spec.md §9.
//! Each variant exposes the same narrow capability surface
//! (`prepare`/`copy_tree`/`finalize`/`supports`) that spec.md §1 calls
//! out of scope for this crate to implement for real — here they are
//! stubbed with the local-filesystem behavior a single-host test
//! environment needs, grounded on `pageserver::basebackup`'s
//! walk-and-copy-a-directory-tree shape.

use std::path::Path;

use camino::Utf8Path;

use barman_utils::error::{BarmanError, CopyFailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Incremental,
    ConcurrentBackup,
    NetworkCompression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDriver {
    RsyncLike,
    NativeBasebackup,
    LocalRsync,
    Snapshot,
}

impl CopyDriver {
    pub fn supports(self, feature: Feature) -> bool {
        match (self, feature) {
            (CopyDriver::NativeBasebackup, Feature::Incremental) => true,
            (CopyDriver::RsyncLike | CopyDriver::LocalRsync, Feature::ConcurrentBackup) => true,
            (CopyDriver::NativeBasebackup, Feature::ConcurrentBackup) => true,
            (CopyDriver::RsyncLike, Feature::NetworkCompression) => true,
            _ => false,
        }
    }

    /// Prepare the destination tree (create directories, nothing more).
    pub fn prepare(self, dest: &Utf8Path) -> Result<(), BarmanError> {
        std::fs::create_dir_all(dest)
            .map_err(|e| BarmanError::FatalInternal(format!("preparing {dest:?}: {e}")))
    }

    /// Copy one file from `src` to `dest`, optionally reusing `reuse_from`
    /// (a file from a parent/previous backup) via byte-compare (`copy`
    /// mode, handled by the caller before invoking this) or hardlink
    /// (`link` mode).
    pub fn copy_file(
        self,
        src: &Path,
        dest: &Path,
        reuse_from: Option<&Path>,
        link_reuse: bool,
    ) -> Result<CopyOutcome, BarmanError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BarmanError::FatalInternal(format!("creating {parent:?}: {e}")))?;
        }

        if let Some(prev) = reuse_from {
            if link_reuse && files_identical(src, prev)? {
                match std::fs::hard_link(prev, dest) {
                    Ok(()) => return Ok(CopyOutcome::ReusedByLink),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Ok(CopyOutcome::ReusedByLink)
                    }
                    Err(_) => { /* fall through to a real copy */ }
                }
            }
        }

        copy_retryable(src, dest)?;
        Ok(CopyOutcome::Copied)
    }

    pub fn finalize(self, _dest: &Utf8Path) -> Result<(), BarmanError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    ReusedByLink,
}

fn files_identical(a: &Path, b: &Path) -> Result<bool, BarmanError> {
    let (ma, mb) = match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => (ma, mb),
        _ => return Ok(false),
    };
    if ma.len() != mb.len() {
        return Ok(false);
    }
    let (ca, cb) = (
        std::fs::read(a).map_err(|e| BarmanError::CopyFailed {
            kind: CopyFailureKind::Transient,
            detail: format!("reading {a:?}: {e}"),
        })?,
        std::fs::read(b).map_err(|e| BarmanError::CopyFailed {
            kind: CopyFailureKind::Transient,
            detail: format!("reading {b:?}: {e}"),
        })?,
    );
    Ok(ca == cb)
}

fn copy_retryable(src: &Path, dest: &Path) -> Result<(), BarmanError> {
    std::fs::copy(src, dest)
        .map(|_| ())
        .map_err(|e| BarmanError::CopyFailed {
            kind: if e.kind() == std::io::ErrorKind::NotFound {
                CopyFailureKind::Persistent
            } else {
                CopyFailureKind::Transient
            },
            detail: format!("copying {src:?} -> {dest:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_basebackup_supports_incremental() {
        assert!(CopyDriver::NativeBasebackup.supports(Feature::Incremental));
        assert!(!CopyDriver::RsyncLike.supports(Feature::Incremental));
    }

    #[test]
    fn copy_file_without_reuse_copies() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dest = dir.path().join("dest.txt");
        let outcome = CopyDriver::RsyncLike
            .copy_file(&src, &dest, None, false)
            .unwrap();
        assert_eq!(outcome, CopyOutcome::Copied);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn copy_file_reuses_identical_via_hardlink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"same bytes").unwrap();
        let prev = dir.path().join("prev.txt");
        std::fs::write(&prev, b"same bytes").unwrap();
        let dest = dir.path().join("dest.txt");
        let outcome = CopyDriver::RsyncLike
            .copy_file(&src, &dest, Some(prev.as_path()), true)
            .unwrap();
        assert_eq!(outcome, CopyOutcome::ReusedByLink);
        assert_eq!(std::fs::read(&dest).unwrap(), b"same bytes");
    }

    #[test]
    fn copy_file_changed_content_does_not_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"new bytes").unwrap();
        let prev = dir.path().join("prev.txt");
        std::fs::write(&prev, b"old bytes").unwrap();
        let dest = dir.path().join("dest.txt");
        let outcome = CopyDriver::RsyncLike
            .copy_file(&src, &dest, Some(prev.as_path()), true)
            .unwrap();
        assert_eq!(outcome, CopyOutcome::Copied);
        assert_eq!(std::fs::read(&dest).unwrap(), b"new bytes");
    }
}
