//! Error type shared by the reconciler, the session and the collaborators

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A change-feed record that cannot be parsed into a message.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("image upload failed: {0}")]
    UploadFailure(String),

    #[error("image download failed: {0}")]
    DownloadFailure(String),

    #[error("persisting message failed: {0}")]
    PersistenceFailure(String),

    #[error("change feed subscription failed: {0}")]
    Subscription(String),

    /// Only one image upload may be outstanding per conversation.
    #[error("an image upload is already in progress")]
    UploadInProgress,

    #[error("session is closed")]
    SessionClosed,
}
