//! Unified error interface for ferrobus crates.
//!
//! Every error type in the workspace implements [`ErrorCode`] so the
//! dispatch loop and the driver can decide uniformly whether a failure maps
//! to a wire error reply, a disconnect, or loop termination.
//!
//! # Design
//!
//! - **Machine-readable codes**: UPPER_SNAKE_CASE, prefixed per subsystem
//!   (`USER_`, `MATCH_`, `NAME_`, …), stable once defined.
//! - **Recoverability**: whether the peer can retry or correct the request.
//!   Quota errors are recoverable (resources free up); protocol violations
//!   are not.

/// Machine-readable error code surface.
///
/// # Example
///
/// ```
/// use ferrobus_types::ErrorCode;
///
/// #[derive(Debug)]
/// enum LookupError {
///     NotFound,
/// }
///
/// impl ErrorCode for LookupError {
///     fn code(&self) -> &'static str {
///         "LOOKUP_NOT_FOUND"
///     }
///     fn is_recoverable(&self) -> bool {
///         false
///     }
/// }
///
/// assert_eq!(LookupError::NotFound.code(), "LOOKUP_NOT_FOUND");
/// ```
pub trait ErrorCode {
    /// Returns the stable UPPER_SNAKE_CASE code for this error.
    fn code(&self) -> &'static str;

    /// Returns whether retrying or correcting the operation can succeed.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code is well-formed and carries the given prefix.
///
/// # Panics
///
/// Panics with a descriptive message when the code is empty, not
/// UPPER_SNAKE_CASE, or lacks the prefix.
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();
    assert!(!code.is_empty(), "error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "error code '{code}' must start with prefix '{expected_prefix}'"
    );
    assert!(
        is_upper_snake_case(code),
        "error code '{code}' must be UPPER_SNAKE_CASE"
    );
}

/// Asserts [`assert_error_code`] over every variant of an error enum.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && !s.contains("__")
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
