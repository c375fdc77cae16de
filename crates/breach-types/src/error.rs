//! Unified error interface for the Breach module runtime.
//!
//! This module provides the [`ErrorCode`] trait for standardized
//! error handling across all runtime crates.
//!
//! # Design
//!
//! All runtime error types should implement [`ErrorCode`] to provide:
//!
//! - **Machine-readable codes**: For programmatic error handling
//! - **Recoverability info**: For retry logic and user feedback
//!
//! # Example
//!
//! ```
//! use breach_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum FetchError {
//!     NotFound(String),
//!     Network,
//! }
//!
//! impl ErrorCode for FetchError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::NotFound(_) => "FETCH_NOT_FOUND",
//!             Self::Network => "FETCH_NETWORK",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Network)
//!     }
//! }
//!
//! let err = FetchError::Network;
//! assert_eq!(err.code(), "FETCH_NETWORK");
//! assert!(err.is_recoverable());
//! ```

/// Unified error code interface for runtime errors.
///
/// Implement this trait for all error types to enable:
///
/// - Consistent error code format across crates
/// - Unified error handling in the supervisor and dispatcher
/// - Standardized logging and monitoring
///
/// # Code Format
///
/// Error codes should be:
///
/// - **UPPER_SNAKE_CASE**: e.g., `"MODULE_UNKNOWN"`, `"STORE_IO"`
/// - **Namespace-prefixed**: e.g., `"MODULE_INVALID_PATH"`, `"REMOTE_STATUS"`
/// - **Stable**: Codes should not change once defined (API contract)
///
/// # Recoverability
///
/// An error is recoverable if:
///
/// - Retrying the operation may succeed
/// - The user can take action to fix it
/// - It's a transient condition (network, timeout)
///
/// Non-recoverable errors:
///
/// - Invalid input (won't change on retry)
/// - Conflicts (require a different request, not a retry)
/// - Internal errors (bugs)
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    ///
    /// # Format
    ///
    /// - UPPER_SNAKE_CASE
    /// - Prefixed with domain (e.g., `"MODULE_"`, `"STORE_"`)
    /// - Stable across versions (breaking change if modified)
    fn code(&self) -> &'static str;

    /// Returns whether the error is recoverable.
    ///
    /// # Returns
    ///
    /// - `true`: Retry may succeed, or user can take corrective action
    /// - `false`: Retry will not help, requires a different request
    fn is_recoverable(&self) -> bool;
}

/// Validates that an error code follows runtime conventions.
///
/// # Checks
///
/// 1. Code is UPPER_SNAKE_CASE
/// 2. Code starts with expected prefix
/// 3. Code is not empty
///
/// # Panics
///
/// Panics with a descriptive message if validation fails.
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");

    assert!(
        code.starts_with(expected_prefix),
        "Error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );

    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Validates multiple error codes at once.
///
/// Use this to verify all variants of an error enum.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

/// Checks if a string is UPPER_SNAKE_CASE.
fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    if s.starts_with('_') || s.ends_with('_') {
        return false;
    }

    if s.contains("__") {
        return false;
    }

    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
