//! Execution strategies.
//!
//! `sequential` walks an ordered fallback chain and stops at the first
//! validated success; `aggregate` fans out to every eligible handler and
//! merges whatever came back.

pub(crate) mod aggregate;
pub(crate) mod sequential;

use crate::error::{DispatchError, DispatchResult};
use crate::types::{ExecuteRequest, HandlerDescriptor, HandlerResponse, ProgressUpdate};
use std::time::Duration;

/// Run one attempt against a handler, racing it against the per-attempt
/// timeout. On expiry the in-flight future is dropped, so a late response
/// can never be attributed to a later attempt. Handler errors pass through
/// unchanged; the caller classifies them with
/// [`DispatchError::is_retryable`](crate::error::DispatchError::is_retryable).
pub(crate) async fn run_attempt(
    handler: &HandlerDescriptor,
    request: &ExecuteRequest,
    timeout: Duration,
) -> DispatchResult<HandlerResponse> {
    let attempt = (handler.run)(request);
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout {
            handler: handler.id.clone(),
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

pub(crate) fn emit_progress(request: &ExecuteRequest, update: ProgressUpdate) {
    if let Some(callback) = &request.progress {
        callback(update);
    }
}
