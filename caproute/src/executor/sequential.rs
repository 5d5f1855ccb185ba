//! Sequential executor: ordered fallback chain with per-handler retries.
//!
//! Per request: `Resolving -> Attempting(handler, retry=n) ->
//! {ValidatedSuccess | AttemptFailed} -> NextHandlerOrTerminal`. Attempts are
//! strictly ordered and never overlap; attempt n+1 starts only after attempt
//! n resolved or timed out.

use super::run_attempt;
use crate::catalog::CapabilityDef;
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticsRecord, DiagnosticsRecorder};
use crate::error::DispatchError;
use crate::registry::HandlerRegistry;
use crate::types::{
    ExecuteRequest, ExecuteResult, HandlerDescriptor, HandlerResponse, Payload, TokenUsage,
};
use crate::validators::ValidatorTable;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub(crate) struct SequentialExecutor<'a> {
    pub registry: &'a HandlerRegistry,
    pub validators: &'a ValidatorTable,
    pub diagnostics: &'a DiagnosticsRecorder,
    pub config: &'a EngineConfig,
}

impl<'a> SequentialExecutor<'a> {
    pub async fn execute(
        &self,
        capability: &CapabilityDef,
        request: &ExecuteRequest,
    ) -> ExecuteResult {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let eligible = self.registry.eligible_for(&capability.id).await;
        let chain = build_chain(eligible, capability, request.preferred_handler.as_deref());
        if chain.is_empty() {
            return ExecuteResult::terminal(&DispatchError::NoEligibleHandlers(
                capability.id.clone(),
            ));
        }

        let timeout = request
            .timeout
            .unwrap_or(Duration::from_millis(self.config.default_timeout_ms));
        let max_retries = request.max_retries.unwrap_or(self.config.default_max_retries);

        let mut attempted: Vec<String> = Vec::new();
        let mut last_error = String::new();

        for handler in &chain {
            let requested_at = Utc::now();
            let handler_started = Instant::now();
            let mut errors: Vec<String> = Vec::new();
            let mut tokens = TokenUsage::default();
            let mut validated: Option<HandlerResponse> = None;
            let mut final_retry = 0;

            for retry in 0..=max_retries {
                final_retry = retry;
                match run_attempt(handler, request, timeout).await {
                    Ok(response) if response.success => {
                        if let Some(usage) = &response.usage {
                            tokens.merge(usage);
                        }
                        let candidate = response
                            .payload
                            .clone()
                            .unwrap_or_else(|| Payload::Text(String::new()));
                        match self.validators.validate(&capability.id, &candidate) {
                            None => {
                                validated = Some(response);
                                break;
                            }
                            Some(reason) => {
                                // The handler claimed success but the shape is
                                // unacceptable; retry-triggering, not terminal.
                                let err = DispatchError::ValidationFailed(reason).to_string();
                                log::debug!(
                                    "handler '{}' retry {}: {}",
                                    handler.id,
                                    retry,
                                    err
                                );
                                errors.push(err);
                            }
                        }
                    }
                    Ok(response) => {
                        if let Some(usage) = &response.usage {
                            tokens.merge(usage);
                        }
                        let message = response
                            .error
                            .unwrap_or_else(|| "handler returned no error detail".to_string());
                        let err = DispatchError::HandlerFailure(message).to_string();
                        log::debug!("handler '{}' retry {}: {}", handler.id, retry, err);
                        errors.push(err);
                    }
                    Err(err) => {
                        log::debug!("handler '{}' retry {}: {}", handler.id, retry, err);
                        let retryable = err.is_retryable();
                        errors.push(err.to_string());
                        if !retryable {
                            // Retrying cannot help (misconfiguration and the
                            // like); move on to the next handler.
                            break;
                        }
                    }
                }
            }

            let success = validated.is_some();
            self.diagnostics.record(DiagnosticsRecord {
                request_id,
                handler_id: handler.id.clone(),
                model: validated
                    .as_ref()
                    .and_then(|r| r.model.clone())
                    .or_else(|| request.model.clone()),
                requested_at,
                completed_at: Utc::now(),
                latency_ms: handler_started.elapsed().as_millis() as u64,
                retries: final_retry,
                tokens,
                errors: errors.clone(),
                success,
            });

            if let Some(response) = validated {
                return ExecuteResult {
                    success: true,
                    payload: response.payload,
                    error: None,
                    handler_used: Some(handler.id.clone()),
                    source: Some(handler.source),
                    latency_ms: started.elapsed().as_millis() as u64,
                    fallbacks_attempted: attempted,
                    usage: response.usage,
                    per_handler: HashMap::new(),
                };
            }

            if let Some(err) = errors.last() {
                last_error = err.clone();
            }
            attempted.push(handler.id.clone());

            if !request.fallback_allowed {
                log::debug!(
                    "handler '{}' exhausted and fallback disallowed, terminating",
                    handler.id
                );
                break;
            }
        }

        let mut result = ExecuteResult::failure(format!(
            "all handlers exhausted for '{}': {} (attempted: {})",
            capability.id,
            last_error,
            attempted.join(", ")
        ));
        result.latency_ms = started.elapsed().as_millis() as u64;
        result.fallbacks_attempted = attempted;
        result
    }
}

/// Order the eligible handlers into a fallback chain. An explicit request
/// preference is strictly first; otherwise the capability's default leads.
/// A preference that resolves to no eligible handler is silently skipped and
/// forfeits the front slot back to the default. The capability's fallback
/// list supplies secondary ordering, and anything left keeps its priority
/// ordering.
pub(crate) fn build_chain(
    eligible: Vec<HandlerDescriptor>,
    capability: &CapabilityDef,
    preferred: Option<&str>,
) -> Vec<HandlerDescriptor> {
    let mut remaining = eligible;
    let mut chain: Vec<HandlerDescriptor> = Vec::with_capacity(remaining.len());

    if let Some(id) = preferred {
        if let Some(handler) = take_by_id(&mut remaining, id) {
            chain.push(handler);
        }
    }
    if chain.is_empty() {
        if let Some(id) = capability.default_handler.as_deref() {
            if let Some(handler) = take_by_id(&mut remaining, id) {
                chain.push(handler);
            }
        }
    }
    for id in &capability.fallback_handlers {
        if let Some(handler) = take_by_id(&mut remaining, id) {
            chain.push(handler);
        }
    }
    chain.append(&mut remaining);
    chain
}

fn take_by_id(handlers: &mut Vec<HandlerDescriptor>, id: &str) -> Option<HandlerDescriptor> {
    handlers
        .iter()
        .position(|h| h.id == id)
        .map(|index| handlers.remove(index))
}
