//! Aggregate executor: fan-out to every eligible handler, fan-in to one
//! merged result.
//!
//! Handlers run concurrently and independently; one failing or timing out
//! never aborts the others. The merged payload concatenates collections in
//! completion order (first finished, first recorded), so callers must not
//! rely on element ordering across handlers.

use super::{emit_progress, run_attempt};
use crate::catalog::CapabilityDef;
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticsRecord, DiagnosticsRecorder};
use crate::error::DispatchError;
use crate::registry::HandlerRegistry;
use crate::types::{
    AggregateOutcome, ExecuteRequest, ExecuteResult, Payload, ProgressPhase, ProgressUpdate,
    TokenUsage,
};
use crate::validators::ValidatorTable;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub(crate) struct AggregateExecutor<'a> {
    pub registry: &'a HandlerRegistry,
    pub validators: &'a ValidatorTable,
    pub diagnostics: &'a DiagnosticsRecorder,
    pub config: &'a EngineConfig,
}

impl<'a> AggregateExecutor<'a> {
    pub async fn execute(
        &self,
        capability: &CapabilityDef,
        request: &ExecuteRequest,
    ) -> ExecuteResult {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let handlers = self.registry.eligible_for(&capability.id).await;
        if handlers.is_empty() {
            return ExecuteResult::terminal(&DispatchError::NoEligibleHandlers(
                capability.id.clone(),
            ));
        }

        let total = handlers.len();
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_millis(self.config.default_timeout_ms));

        emit_progress(
            request,
            ProgressUpdate {
                phase: ProgressPhase::Starting,
                message: format!("dispatching {} handlers for '{}'", total, capability.id),
                handler: None,
                current: 0,
                total,
                success: None,
            },
        );

        let mut tasks = FuturesUnordered::new();
        for handler in &handlers {
            tasks.push(async move {
                let requested_at = Utc::now();
                let attempt_started = Instant::now();
                let outcome = run_attempt(handler, request, timeout).await;
                (handler, requested_at, attempt_started.elapsed(), outcome)
            });
        }

        let mut merged: Vec<serde_json::Value> = Vec::new();
        let mut per_handler: HashMap<String, AggregateOutcome> = HashMap::new();
        let mut usage_total = TokenUsage::default();
        let mut saw_usage = false;
        let mut failed: Vec<String> = Vec::new();
        let mut last_error = String::new();
        let mut completed = 0usize;

        while let Some((handler, requested_at, elapsed, outcome)) = tasks.next().await {
            completed += 1;
            let mut tokens = TokenUsage::default();
            let mut model = request.model.clone();

            let verdict: Result<Payload, String> = match outcome {
                Ok(response) if response.success => {
                    if let Some(usage) = &response.usage {
                        tokens.merge(usage);
                    }
                    if response.model.is_some() {
                        model = response.model.clone();
                    }
                    let payload = response
                        .payload
                        .unwrap_or_else(|| Payload::Text(String::new()));
                    match self.validators.validate(&capability.id, &payload) {
                        None => Ok(payload),
                        Some(reason) => {
                            Err(DispatchError::ValidationFailed(reason).to_string())
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
                    Err(DispatchError::HandlerFailure(message).to_string())
                }
                Err(err) => Err(err.to_string()),
            };

            let (success, items, error) = match verdict {
                Ok(payload) => {
                    let count = payload.item_count();
                    merged.extend(payload.into_items());
                    if tokens != TokenUsage::default() {
                        usage_total.merge(&tokens);
                        saw_usage = true;
                    }
                    (true, count, None)
                }
                Err(message) => {
                    log::debug!("aggregate handler '{}' failed: {}", handler.id, message);
                    failed.push(handler.id.clone());
                    last_error = message.clone();
                    (false, 0, Some(message))
                }
            };

            self.diagnostics.record(DiagnosticsRecord {
                request_id,
                handler_id: handler.id.clone(),
                model,
                requested_at,
                completed_at: Utc::now(),
                latency_ms: elapsed.as_millis() as u64,
                retries: 0,
                tokens,
                errors: error.clone().into_iter().collect(),
                success,
            });

            emit_progress(
                request,
                ProgressUpdate {
                    phase: ProgressPhase::Handler,
                    message: match &error {
                        None => format!("{} contributed {} items", handler.name, items),
                        Some(message) => format!("{} failed: {}", handler.name, message),
                    },
                    handler: Some(handler.id.clone()),
                    current: completed,
                    total,
                    success: Some(success),
                },
            );

            per_handler.insert(
                handler.id.clone(),
                AggregateOutcome {
                    success,
                    items,
                    error,
                },
            );
        }

        emit_progress(
            request,
            ProgressUpdate {
                phase: ProgressPhase::Complete,
                message: format!(
                    "{} of {} handlers succeeded, {} items merged",
                    total - failed.len(),
                    total,
                    merged.len()
                ),
                handler: None,
                current: total,
                total,
                success: Some(failed.len() < total),
            },
        );

        let any_success = failed.len() < total;
        ExecuteResult {
            success: any_success,
            payload: any_success.then_some(Payload::Items(merged)),
            error: if any_success {
                None
            } else {
                Some(format!(
                    "all {} handlers failed for '{}': {}",
                    total, capability.id, last_error
                ))
            },
            handler_used: None,
            source: None,
            latency_ms: started.elapsed().as_millis() as u64,
            fallbacks_attempted: failed,
            usage: saw_usage.then_some(usage_total),
            per_handler,
        }
    }
}
