use shared::{domain::MessageId, error::BackendError};
use thiserror::Error;

use crate::optimistic::TempId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientTransport,
    TerminalTransport,
    WriteFailure,
    DataInconsistency,
    Usage,
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("room session is closed")]
    SessionClosed,
    #[error("message draft has neither text nor image")]
    EmptyDraft,
    #[error("draft targets room {draft} but session is bound to room {session}")]
    WrongRoom { draft: String, session: String },
    #[error("no optimistic send with id {0}")]
    UnknownSend(TempId),
    #[error("optimistic send {0} has not failed and cannot be retried")]
    NotRetryable(TempId),
    #[error("reaction {emoji} on message {message_id} already has a write in flight")]
    ReactionInFlight { message_id: MessageId, emoji: String },
    #[error("an older page is already being fetched")]
    LoadInFlight,
    #[error("reaction write rolled back: {0}")]
    ReactionRolledBack(BackendError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Backend(err) if err.is_recoverable() => ErrorCategory::TransientTransport,
            Self::Backend(_) => ErrorCategory::WriteFailure,
            Self::SessionClosed => ErrorCategory::TerminalTransport,
            Self::ReactionRolledBack(_) => ErrorCategory::DataInconsistency,
            Self::EmptyDraft
            | Self::WrongRoom { .. }
            | Self::UnknownSend(_)
            | Self::NotRetryable(_)
            | Self::ReactionInFlight { .. }
            | Self::LoadInFlight => ErrorCategory::Usage,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
