//! Service error kinds.
//!
//! Every fallible operation in the crate returns [`MemoryError`]. The
//! variants map one-to-one onto the error classes the pipeline
//! distinguishes:
//!
//! | Variant | Disposition |
//! |---------|-------------|
//! | `Validation` | reported synchronously to the caller, never enqueued |
//! | `NotFound` | missing document, index, or artifact |
//! | `Transient` | handler retried with exponential backoff |
//! | `Permanent` | document transitions to `failed` |
//! | `Poisoned` | transient failure repeated past `max_attempts` |
//! | `DataIntegrity` | corrupt persisted state; processing refused |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Bad input from the caller: invalid index name, missing files,
    /// unknown step, reserved tag key, oversized upload.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested document, index, or artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A backend or downstream dependency failed in a retryable way.
    #[error("transient error: {0}")]
    Transient(String),

    /// The input cannot be processed, no matter how often it is retried.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// A transient failure repeated past the queue's `max_attempts`.
    #[error("poisoned: {0}")]
    Poisoned(String),

    /// Persisted state failed to decode. Manual intervention required.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
}

impl MemoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MemoryError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MemoryError::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        MemoryError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        MemoryError::Permanent(msg.into())
    }

    /// True when retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Transient(_))
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;
