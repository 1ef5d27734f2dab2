//! Policy layer errors.

use ferrobus_types::ErrorCode;
use thiserror::Error;

/// Outcome of a denied policy decision.
///
/// Callers map this onto the appropriate surface: an `AccessDenied` wire
/// error for method calls, a silent drop for signals and replies, or a
/// refused connection at accept time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The ruleset denies the operation.
    #[error("access denied by policy")]
    AccessDenied,
}

impl ErrorCode for PolicyError {
    fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied => "POLICY_ACCESS_DENIED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobus_types::assert_error_codes;

    #[test]
    fn codes() {
        assert_error_codes(&[PolicyError::AccessDenied], "POLICY_");
    }
}
