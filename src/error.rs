//! Error taxonomy for the offline core.
//!
//! Four caller-visible classes drive the routing rules in the submit path:
//! validation and conflict errors block the operation regardless of
//! connectivity, network errors divert the write into the offline queue,
//! and replay errors are isolated per queued item and reported in
//! aggregate. Storage and serialization failures propagate with context
//! so a caller never mistakes a non-durable write for a queued one.

use crate::api::SessionRecord;

/// Crate-wide result alias.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed input; rejected immediately, never queued.
    #[error("validation: {0}")]
    Validation(String),

    /// Business-rule conflict. Carries the server's active session (when
    /// one caused the conflict) so callers can offer a resume action.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        active_session: Option<SessionRecord>,
    },

    /// Transient connectivity or server failure during an otherwise valid
    /// write; routes the operation into the offline queue.
    #[error("network: {0}")]
    Network(String),

    /// The server has no record matching the request (e.g. clock-out with
    /// no open attendance record).
    #[error("not found: {0}")]
    NotFound(String),

    /// Replay of one queued item failed; the item stays queued for the
    /// next pass.
    #[error("sync replay failed for {item_id}: {reason}")]
    SyncReplay { item_id: String, reason: String },

    /// Local persistence failure (SQLite).
    #[error("storage: {0}")]
    Storage(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// True for failures that divert a write into the offline queue.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// True for failures worth retrying on a later sync pass.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::SyncReplay { .. })
    }

    /// Shorthand for a conflict without session context.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            active_session: None,
        }
    }
}
