//! The stable error taxonomy shared by every component.
//!
//! Each kind here is surfaced to the CLI boundary, given a non-zero exit
//! code and, under `--format json`, serialized into a structured object.
//! Propagation rules (which kinds retry, which escalate, which are
//! terminal) live with the callers that know the context; this module only
//! defines the vocabulary.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::ids::ServerName;

/// `ABORT_CONTINUE`, the soft-abort hook exit code.
pub const HOOK_ABORT_CONTINUE: i32 = 62;
/// `ABORT_STOP`, the hard-abort hook exit code.
pub const HOOK_ABORT_STOP: i32 = 63;

#[derive(Debug, Error)]
pub enum BarmanError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{operation} is locked for server {server} (held since {held_since})")]
    LockBusy {
        server: ServerName,
        operation: String,
        held_since: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("catalog corrupt for server {server}: {detail}")]
    CatalogCorrupt { server: ServerName, detail: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("copy failed ({kind:?}): {detail}")]
    CopyFailed { kind: CopyFailureKind, detail: String },

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("retention plan for server {server} would breach minimum_redundancy={minimum}: {detail}")]
    RetentionViolation {
        server: ServerName,
        minimum: usize,
        detail: String,
    },

    #[error("hook requested abort-continue")]
    HookAbortContinue,

    #[error("hook requested abort-stop")]
    HookAbortStop,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    FatalInternal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopyFailureKind {
    Transient,
    Persistent,
}

impl BarmanError {
    /// Stable, machine-readable tag for `--format json` and for log filtering.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            BarmanError::Config(_) => "ConfigError",
            BarmanError::LockBusy { .. } => "LockBusy",
            BarmanError::NotFound(_) => "NotFound",
            BarmanError::CatalogCorrupt { .. } => "CatalogCorrupt",
            BarmanError::Connection(_) => "ConnectionError",
            BarmanError::CopyFailed { .. } => "CopyFailed",
            BarmanError::ChecksumMismatch { .. } => "ChecksumMismatch",
            BarmanError::Protocol(_) => "ProtocolError",
            BarmanError::RetentionViolation { .. } => "RetentionViolation",
            BarmanError::HookAbortContinue => "HookAbortContinue",
            BarmanError::HookAbortStop => "HookAbortStop",
            BarmanError::Timeout(_) => "Timeout",
            BarmanError::Cancelled => "Cancelled",
            BarmanError::Unsupported(_) => "Unsupported",
            BarmanError::FatalInternal(_) => "FatalInternal",
        }
    }

    pub fn is_transient_copy_failure(&self) -> bool {
        matches!(
            self,
            BarmanError::CopyFailed {
                kind: CopyFailureKind::Transient,
                ..
            }
        )
    }
}

/// Structured representation emitted under `--format json`, mirroring the
/// shape spec.md §6 requires: kind, server, backup/WAL ids (if applicable),
/// and a human message.
#[derive(Debug, Serialize)]
pub struct JsonError {
    pub kind: &'static str,
    pub server: Option<String>,
    pub backup_id: Option<String>,
    pub wal: Option<String>,
    pub message: String,
}

impl JsonError {
    pub fn from_error(err: &BarmanError) -> Self {
        let server = match err {
            BarmanError::LockBusy { server, .. } | BarmanError::CatalogCorrupt { server, .. } => {
                Some(server.to_string())
            }
            BarmanError::RetentionViolation { server, .. } => Some(server.to_string()),
            _ => None,
        };
        JsonError {
            kind: err.kind_tag(),
            server,
            backup_id: None,
            wal: None,
            message: err.to_string(),
        }
    }

    pub fn with_backup_id(mut self, backup_id: impl fmt::Display) -> Self {
        self.backup_id = Some(backup_id.to_string());
        self
    }

    pub fn with_wal(mut self, wal: impl fmt::Display) -> Self {
        self.wal = Some(wal.to_string());
        self
    }
}

pub type Result<T> = std::result::Result<T, BarmanError>;
