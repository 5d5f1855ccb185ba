//! Append-only diagnostics sink.
//!
//! One record is appended per handler attempt, so a request that falls back
//! through three handlers produces three records. Recording is best-effort:
//! it never raises and a panicking listener is swallowed, since diagnostics
//! must not affect the execution path.

use crate::types::TokenUsage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsRecord {
    pub request_id: Uuid,
    pub handler_id: String,
    pub model: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Retry index of the final attempt against this handler.
    pub retries: u32,
    pub tokens: TokenUsage,
    /// Error strings from every retry of this handler, in order.
    pub errors: Vec<String>,
    pub success: bool,
}

pub type DiagnosticsListener = Arc<dyn Fn(&DiagnosticsRecord) + Send + Sync>;

/// Per-handler aggregates derived from the full log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub calls: usize,
    pub mean_latency_ms: f64,
    pub errors: usize,
    pub success_rate: f64,
}

pub struct DiagnosticsRecorder {
    log: Mutex<Vec<DiagnosticsRecord>>,
    listener: Option<DiagnosticsListener>,
}

impl DiagnosticsRecorder {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            listener: None,
        }
    }

    pub fn with_listener(listener: DiagnosticsListener) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            listener: Some(listener),
        }
    }

    /// Append a record and forward it synchronously to the listener.
    pub fn record(&self, record: DiagnosticsRecord) {
        if let Some(listener) = &self.listener {
            if catch_unwind(AssertUnwindSafe(|| listener(&record))).is_err() {
                log::warn!(
                    "diagnostics listener panicked for handler '{}'",
                    record.handler_id
                );
            }
        }
        match self.log.lock() {
            Ok(mut log) => log.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    pub fn log(&self) -> Vec<DiagnosticsRecord> {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.log.lock() {
            Ok(log) => log.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the log for a fresh diagnostic window.
    pub fn clear(&self) {
        match self.log.lock() {
            Ok(mut log) => log.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Per-handler call count, mean latency, error count and success rate.
    pub fn provider_stats(&self) -> HashMap<String, ProviderStats> {
        let log = self.log();
        let mut totals: HashMap<String, (usize, u64, usize, usize)> = HashMap::new();
        for record in &log {
            let entry = totals.entry(record.handler_id.clone()).or_default();
            entry.0 += 1;
            entry.1 += record.latency_ms;
            if record.success {
                entry.3 += 1;
            } else {
                entry.2 += 1;
            }
        }
        totals
            .into_iter()
            .map(|(handler_id, (calls, latency_sum, errors, successes))| {
                (
                    handler_id,
                    ProviderStats {
                        calls,
                        mean_latency_ms: latency_sum as f64 / calls as f64,
                        errors,
                        success_rate: successes as f64 / calls as f64,
                    },
                )
            })
            .collect()
    }
}

impl Default for DiagnosticsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
