use thiserror::Error;

use crate::types::OpKind;

pub type SyncResult<T> = Result<T, SyncError>;

/// Error taxonomy shared by the sync layer and its consumers.
///
/// A read of an absent path is not an error: it is `None`.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or service failure while online. Read/write/remove recover
    /// from this locally; it only escapes from the raw remote plumbing.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// Quota exceeded, corrupt serialized value, or a failed flush.
    #[error("local cache failure: {0}")]
    LocalCacheFailure(String),

    /// A queued operation kept failing during drain past the retry bound.
    #[error("replay of {kind} {path} failed after {attempts} attempts: {reason}")]
    ReplayFailure {
        kind: OpKind,
        path: String,
        attempts: u32,
        reason: String,
    },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// False for failures that no retry can clear.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SyncError::InvalidPath { .. } | SyncError::ReplayFailure { .. }
        )
    }
}
