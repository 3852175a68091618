//! Error surface shared by the whole crate.

use std::io;

use thiserror::Error;

/// Result type for synchronizer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the synchronizer and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A handle, mode, or combination of arguments is not acceptable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A write-once field is already configured, or a value is not ready to
    /// be read yet.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// The operation does not match the pipeline direction or the configured
    /// sources.
    #[error("operation does not match the pipeline direction")]
    DirectionMismatch,
    /// A required piece of configuration is missing.
    #[error("missing configuration: {0}")]
    NotReady(&'static str),
    /// The object is absent from every configured store.
    #[error("object not found in any configured store")]
    NotFound,
    /// The input stream or index contradicts itself.
    #[error("bad message: {0}")]
    BadMessage(String),
    /// The pipeline already finished; no further step may run.
    #[error("pipeline is closed")]
    PipelineClosed,
    /// I/O error, propagated verbatim.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SyncError {
    /// Check whether this error is terminal for the session.
    ///
    /// Transient I/O failures may be retried by stepping again; a malformed
    /// stream or a closed pipeline may not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BadMessage(_) | Self::PipelineClosed)
    }
}
