//! The on-disk layout of a server's home directory, per spec.md §6.

use camino::{Utf8Path, Utf8PathBuf};

use barman_utils::{BackupId, WalSegmentName};

#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub home: Utf8PathBuf,
}

impl ServerPaths {
    pub fn new(home: impl Into<Utf8PathBuf>) -> Self {
        ServerPaths { home: home.into() }
    }

    pub fn base_dir(&self) -> Utf8PathBuf {
        self.home.join("base")
    }

    pub fn backup_dir(&self, id: BackupId) -> Utf8PathBuf {
        self.base_dir().join(id.to_string())
    }

    pub fn backup_info_path(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join("backup.info")
    }

    pub fn backup_data_dir(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join("data")
    }

    pub fn backup_manifest_path(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join("backup_manifest")
    }

    pub fn wals_dir(&self) -> Utf8PathBuf {
        self.home.join("wals")
    }

    pub fn wal_archive_path(&self, name: &WalSegmentName, ext: &str) -> Utf8PathBuf {
        self.wals_dir()
            .join(name.archive_prefix())
            .join(format!("{}{}", name.canonical(), ext))
    }

    pub fn incoming_dir(&self) -> Utf8PathBuf {
        self.home.join("incoming")
    }

    pub fn streaming_dir(&self) -> Utf8PathBuf {
        self.home.join("streaming")
    }

    pub fn errors_dir(&self) -> Utf8PathBuf {
        self.home.join("errors")
    }

    pub fn xlogdb_path(&self) -> Utf8PathBuf {
        self.home.join("xlog.db")
    }

    pub fn receiver_pidfile(&self) -> Utf8PathBuf {
        self.home.join(".receive-wal.pid")
    }

    pub fn ensure_skeleton(&self) -> std::io::Result<()> {
        for dir in [
            self.base_dir(),
            self.wals_dir(),
            self.incoming_dir(),
            self.streaming_dir(),
            self.errors_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// root of the catalog across all servers: `<barman_home>/<server>/...`.
pub fn server_home(barman_home: &Utf8Path, server: &str) -> Utf8PathBuf {
    barman_home.join(server)
}
