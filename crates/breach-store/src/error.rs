//! Storage layer errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`StoreError::Io`] | `STORE_IO` | Yes |
//! | [`StoreError::Corrupt`] | `STORE_CORRUPT` | No |

use breach_types::ErrorCode;
use thiserror::Error;

/// Document store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file does not contain a JSON document array.
    #[error("store file is corrupt: {0}")]
    Corrupt(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "STORE_IO",
            Self::Corrupt(_) => "STORE_CORRUPT",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
