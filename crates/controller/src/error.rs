use polrep_core::BuildError;
use thiserror::Error;

/// Failure of a single sync pass; always eligible for retry.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("unable to build report change request: {0}")]
    Build(#[from] BuildError),
    #[error("report request handler panicked: {0}")]
    Panicked(String),
}
