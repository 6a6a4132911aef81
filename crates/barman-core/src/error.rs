//! The top-level error type every CLI command returns.
//!
//! Composes `barman_catalog`/`barman_utils`'s [`BarmanError`] with the
//! config- and hook-layer failures that only exist above the catalog,
//! the same way the teacher's HTTP layer composes heterogeneous failures
//! into one `ApiError` at its boundary — here the boundary is the CLI
//! exit code instead of an HTTP status.

use barman_utils::BarmanError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] BarmanError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("hook {script:?} requested abort-stop")]
    HookAbortStop { script: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Error::Catalog(e) => e.kind_tag(),
            Error::Config(_) => "ConfigError",
            Error::HookAbortStop { .. } => "HookAbortStop",
            Error::Io(_) => "FatalInternal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
