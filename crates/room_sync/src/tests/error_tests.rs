use super::*;

use shared::error::ErrorCode;

#[test]
fn backend_failures_split_by_recoverability() {
    let offline = SyncError::from(BackendError::transport("connection reset"));
    assert_eq!(offline.category(), ErrorCategory::TransientTransport);

    let rejected = SyncError::from(BackendError::new(ErrorCode::Forbidden, "not a member"));
    assert_eq!(rejected.category(), ErrorCategory::WriteFailure);
}

#[test]
fn rollbacks_and_usage_errors_are_categorized() {
    let rolled_back = SyncError::ReactionRolledBack(BackendError::internal("boom"));
    assert_eq!(rolled_back.category(), ErrorCategory::DataInconsistency);
    assert_eq!(SyncError::SessionClosed.category(), ErrorCategory::TerminalTransport);
    assert_eq!(SyncError::LoadInFlight.category(), ErrorCategory::Usage);
    assert_eq!(SyncError::EmptyDraft.category(), ErrorCategory::Usage);
}
