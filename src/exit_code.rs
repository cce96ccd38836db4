//! Maps terminal build statuses onto process exit codes.

use crate::event::BuildStatus;

/// Exit code for a build that succeeded.
pub const SUCCEEDED: i32 = 0;
/// Exit code for a build whose command failed.
pub const FAILED: i32 = 1;
/// Exit code for a build that errored or was aborted.
pub const ERRORED: i32 = 2;
/// Exit code for any client-side fault (configuration, transport, protocol).
pub const CLIENT_FAULT: i32 = 3;

/// Resolves the exit code for `status`.
///
/// Returns `None` for non-terminal statuses; those never decide how the
/// process exits.
#[must_use]
pub const fn resolve(status: BuildStatus) -> Option<i32> {
    match status {
        BuildStatus::Succeeded => Some(SUCCEEDED),
        BuildStatus::Failed => Some(FAILED),
        BuildStatus::Errored | BuildStatus::Aborted => Some(ERRORED),
        BuildStatus::Pending | BuildStatus::Started => None,
    }
}
