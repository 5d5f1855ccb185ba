//! Error taxonomy for capability dispatch.
//!
//! Only the terminal variants (`CapabilityNotFound`, `CapabilityDisabled`,
//! `NoEligibleHandlers`) abort a request without any handler attempt. The
//! attempt-scoped variants are caught at the attempt boundary and converted
//! into a retry or a fallback to the next handler in the chain.

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("capability is disabled: {0}")]
    CapabilityDisabled(String),

    #[error("no eligible handlers for capability: {0}")]
    NoEligibleHandlers(String),

    #[error("handler raised an exception: {0}")]
    HandlerException(String),

    #[error("handler reported failure: {0}")]
    HandlerFailure(String),

    #[error("result failed validation: {0}")]
    ValidationFailed(String),

    #[error("handler '{handler}' timed out after {after_ms}ms")]
    Timeout { handler: String, after_ms: u64 },

    #[error("built-in capability cannot be removed: {0}")]
    BuiltinImmutable(String),

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

impl DispatchError {
    /// Attempt-scoped errors trigger retry/fallback; the rest are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::HandlerException(_)
                | DispatchError::HandlerFailure(_)
                | DispatchError::ValidationFailed(_)
                | DispatchError::Timeout { .. }
        )
    }
}
