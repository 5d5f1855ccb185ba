//! Core request/result types shared by the catalog, registry and executors.

use crate::error::{DispatchError, DispatchResult};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Where a handler's implementation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    AiProvider,
    ExternalIntegration,
    LocalFunction,
    ToolProtocol,
}

/// Tagged result payload. Validators and the aggregate merge dispatch on the
/// tag instead of inspecting loosely-typed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Structured(serde_json::Value),
    ImageRef(String),
    Items(Vec<serde_json::Value>),
}

impl Payload {
    /// Number of elements this payload contributes to an aggregate merge.
    pub fn item_count(&self) -> usize {
        match self {
            Payload::Items(items) => items.len(),
            _ => 1,
        }
    }

    /// Flatten into merge elements: ordered collections are concatenated,
    /// scalar payloads become single elements.
    pub(crate) fn into_items(self) -> Vec<serde_json::Value> {
        match self {
            Payload::Items(items) => items,
            Payload::Text(text) => vec![json!(text)],
            Payload::ImageRef(uri) => vec![json!(uri)],
            Payload::Structured(value) => vec![value],
        }
    }
}

/// Accumulated token counts for one or more attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn merge(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Raw outcome reported by a handler execution function. A handler may claim
/// success and still be rejected by the capability's validators afterwards.
#[derive(Debug, Clone, Default)]
pub struct HandlerResponse {
    pub success: bool,
    pub payload: Option<Payload>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl HandlerResponse {
    pub fn ok(payload: Payload) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Type-erased handler execution function. An `Err` is treated as a thrown
/// exception at the attempt boundary and never propagates to the caller.
pub type HandlerFn =
    Arc<dyn Fn(&ExecuteRequest) -> BoxFuture<'static, DispatchResult<HandlerResponse>> + Send + Sync>;

/// Descriptor for one backend able to fulfill one or more capabilities.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub id: String,
    pub name: String,
    pub source: SourceKind,
    pub capabilities: HashSet<String>,
    /// Higher priority handlers are tried first.
    pub priority: i32,
    pub available: bool,
    pub requires_credential: bool,
    /// Dynamic source that registered this handler (tool-protocol servers);
    /// used for bulk removal when the source disconnects.
    pub origin: Option<String>,
    pub run: HandlerFn,
}

impl HandlerDescriptor {
    pub fn new<F>(id: impl Into<String>, name: impl Into<String>, source: SourceKind, run: F) -> Self
    where
        F: Fn(&ExecuteRequest) -> BoxFuture<'static, DispatchResult<HandlerResponse>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            source,
            capabilities: HashSet::new(),
            priority: 0,
            available: true,
            requires_credential: false,
            origin: None,
            run: Arc::new(run),
        }
    }

    pub fn with_capability(mut self, capability_id: impl Into<String>) -> Self {
        self.capabilities.insert(capability_id.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capability_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capability_ids.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn with_credential_requirement(mut self, requires_credential: bool) -> Self {
        self.requires_credential = requires_credential;
        self
    }

    pub fn with_origin(mut self, source_id: impl Into<String>) -> Self {
        self.origin = Some(source_id.into());
        self
    }

    pub fn supports(&self, capability_id: &str) -> bool {
        self.capabilities.contains(capability_id)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source", &self.source)
            .field("capabilities", &self.capabilities)
            .field("priority", &self.priority)
            .field("available", &self.available)
            .field("requires_credential", &self.requires_credential)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Phase of an aggregate execution, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Starting,
    Handler,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: ProgressPhase,
    pub message: String,
    pub handler: Option<String>,
    pub current: usize,
    pub total: usize,
    pub success: Option<bool>,
}

pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// A single capability request submitted to the engine.
#[derive(Clone)]
pub struct ExecuteRequest {
    pub capability: String,
    pub input: String,
    pub context: HashMap<String, String>,
    pub preferred_handler: Option<String>,
    pub fallback_allowed: bool,
    /// Overrides [`crate::config::EngineConfig::default_max_retries`] when set.
    pub max_retries: Option<u32>,
    /// Overrides [`crate::config::EngineConfig::default_timeout_ms`] when set.
    pub timeout: Option<Duration>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
    pub progress: Option<ProgressFn>,
}

impl ExecuteRequest {
    pub fn new(capability: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            input: input.into(),
            context: HashMap::new(),
            preferred_handler: None,
            fallback_allowed: true,
            max_retries: None,
            timeout: None,
            model: None,
            temperature: None,
            system_prompt: None,
            progress: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_preferred_handler(mut self, handler_id: impl Into<String>) -> Self {
        self.preferred_handler = Some(handler_id.into());
        self
    }

    pub fn with_fallback_allowed(mut self, allowed: bool) -> Self {
        self.fallback_allowed = allowed;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for ExecuteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteRequest")
            .field("capability", &self.capability)
            .field("input", &self.input)
            .field("preferred_handler", &self.preferred_handler)
            .field("fallback_allowed", &self.fallback_allowed)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("model", &self.model)
            .finish()
    }
}

/// Per-handler outcome retained by the aggregate merge, keyed by handler id
/// in [`ExecuteResult::per_handler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub success: bool,
    /// Elements this handler contributed to the merged payload.
    pub items: usize,
    pub error: Option<String>,
}

/// The single result returned for every request, however many handlers were
/// attempted along the way.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub success: bool,
    pub payload: Option<Payload>,
    pub error: Option<String>,
    pub handler_used: Option<String>,
    pub source: Option<SourceKind>,
    pub latency_ms: u64,
    /// Handlers that failed, in attempt order, before the one that succeeded.
    pub fallbacks_attempted: Vec<String>,
    pub usage: Option<TokenUsage>,
    /// Populated by aggregate execution only.
    pub per_handler: HashMap<String, AggregateOutcome>,
}

impl ExecuteResult {
    pub(crate) fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            handler_used: None,
            source: None,
            latency_ms: 0,
            fallbacks_attempted: Vec::new(),
            usage: None,
            per_handler: HashMap::new(),
        }
    }

    pub(crate) fn terminal(error: &DispatchError) -> Self {
        Self::failure(error.to_string())
    }
}
