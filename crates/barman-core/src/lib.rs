//! The backup/recovery engine: everything above the catalog's plain
//! file format and below the CLI's argument parsing, per spec.md §4.
//!
//! Each module here is grounded on a distinct piece of the teacher's
//! `safekeeper`/`pageserver` stack; see each module's own doc comment
//! and `DESIGN.md` for the full grounding ledger.

pub mod base_backup;
pub mod config;
pub mod copy_driver;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod recovery;
pub mod retention;
pub mod wal_archiver;
pub mod wal_streamer;

pub use error::{Error, Result};
