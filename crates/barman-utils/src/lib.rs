//! Shared primitives used by every `barman-rs` component: LSNs and WAL
//! segment names, server/backup identifiers, the stable error taxonomy,
//! advisory file locks, retry/backoff helpers, atomic file writes and
//! compression schemes.
//!
//! Grounded on `libs/utils` in the teacher workspace: a dependency-free
//! (within the workspace) leaf crate that every other crate builds on.

pub mod atomic_file;
pub mod backoff;
pub mod compression;
pub mod error;
pub mod ids;
pub mod lock;
pub mod lsn;

pub use error::{BarmanError, Result};
pub use ids::{BackupId, BackupIdOrAlias, ServerName};
pub use lsn::{Lsn, TimelineId, WalSegmentName};
