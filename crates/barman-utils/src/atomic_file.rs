//! Crash-safe "write it fully, fsync, then rename into place" helper.
//!
//! Every mutation of catalog state (backup.info, xlog.db) goes through
//! this so a process killed mid-write never leaves a half-written file
//! where a reader expects a complete one.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::BarmanError;

pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), BarmanError> {
    let parent = path.parent().ok_or_else(|| {
        BarmanError::FatalInternal(format!("path {path:?} has no parent directory"))
    })?;
    fs::create_dir_all(parent)
        .map_err(|e| BarmanError::FatalInternal(format!("creating {parent:?}: {e}")))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("atomic"),
        std::process::id()
    ));

    let mut tmp_file = File::create(&tmp_path)
        .map_err(|e| BarmanError::FatalInternal(format!("creating {tmp_path:?}: {e}")))?;
    tmp_file
        .write_all(contents)
        .map_err(|e| BarmanError::FatalInternal(format!("writing {tmp_path:?}: {e}")))?;
    tmp_file
        .sync_all()
        .map_err(|e| BarmanError::FatalInternal(format!("fsyncing {tmp_path:?}: {e}")))?;
    drop(tmp_file);

    fs::rename(&tmp_path, path)
        .map_err(|e| BarmanError::FatalInternal(format!("renaming {tmp_path:?} -> {path:?}: {e}")))?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// fsync a regular file that has already been written by someone else
/// (e.g. a copy driver), before its catalog record is appended.
pub fn fsync_file(path: &Path) -> Result<(), BarmanError> {
    let f = File::open(path)
        .map_err(|e| BarmanError::FatalInternal(format!("opening {path:?} for fsync: {e}")))?;
    f.sync_all()
        .map_err(|e| BarmanError::FatalInternal(format!("fsyncing {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.txt");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn overwrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }
}
