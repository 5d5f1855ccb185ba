//! Per-capability result validators.
//!
//! Backends regularly return HTTP 200 with an empty or nonsensical body, so
//! a handler claiming success is not enough: the capability's predicates get
//! the final say, and a rejection sends the executor back into its
//! retry/fallback path. Predicates are synchronous, pure and
//! first-failure-wins. Capabilities with no registered validator pass.

use crate::types::Payload;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type ValidatorFn = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

pub struct Validator {
    /// Returned to the executor when the predicate rejects a payload.
    pub error: String,
    check: ValidatorFn,
}

impl Validator {
    pub fn new<F>(error: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        Self {
            error: error.into(),
            check: Arc::new(check),
        }
    }

    pub fn accepts(&self, payload: &Payload) -> bool {
        (self.check)(payload)
    }
}

pub struct ValidatorTable {
    validators: RwLock<HashMap<String, Vec<Validator>>>,
}

impl ValidatorTable {
    pub fn new() -> Self {
        Self {
            validators: RwLock::new(HashMap::new()),
        }
    }

    /// Table pre-populated for the built-in capabilities.
    pub fn with_defaults(min_text_chars: usize) -> Self {
        let table = Self::new();
        for capability in ["generate", "research", "summarize", "translate"] {
            table.register(capability, non_empty_text(min_text_chars));
        }
        table.register("image-generate", image_reference());
        table.register("image-search", items_with_urls());
        table.register("trend-scan", items_with_urls());
        table
    }

    pub fn register(&self, capability_id: &str, validator: Validator) {
        if let Ok(mut validators) = self.validators.write() {
            validators
                .entry(capability_id.to_string())
                .or_default()
                .push(validator);
        }
    }

    /// First failing predicate's error, or `None` when the payload passes.
    pub fn validate(&self, capability_id: &str, payload: &Payload) -> Option<String> {
        let validators = self.validators.read().ok()?;
        let checks = validators.get(capability_id)?;
        checks
            .iter()
            .find(|v| !v.accepts(payload))
            .map(|v| v.error.clone())
    }
}

impl Default for ValidatorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Text payloads must trim to at least `min_chars` characters.
pub fn non_empty_text(min_chars: usize) -> Validator {
    Validator::new("empty or too-short text response", move |payload| {
        matches!(payload, Payload::Text(text) if text.trim().chars().count() >= min_chars)
    })
}

/// Image payloads must carry a recognized URI scheme or embedded-data prefix.
pub fn image_reference() -> Validator {
    Validator::new("missing or unrecognized image reference", |payload| {
        matches!(
            payload,
            Payload::ImageRef(uri)
                if uri.starts_with("http://")
                    || uri.starts_with("https://")
                    || uri.starts_with("data:image/")
        )
    })
}

/// Structured payloads must be non-null. Not part of the built-in defaults
/// (no built-in capability returns bare structured data); register it
/// explicitly for user-defined capabilities that do.
pub fn non_null_structured() -> Validator {
    Validator::new("null structured response", |payload| {
        matches!(payload, Payload::Structured(value) if !value.is_null())
    })
}

/// List payloads must contain at least one element carrying a URL-like field.
pub fn items_with_urls() -> Validator {
    Validator::new("no result items with a usable URL", |payload| {
        matches!(payload, Payload::Items(items) if items.iter().any(looks_like_url_entry))
    })
}

fn looks_like_url_entry(item: &serde_json::Value) -> bool {
    if let Some(text) = item.as_str() {
        return text.contains("://");
    }
    ["url", "link", "href"]
        .iter()
        .any(|key| item.get(key).and_then(|v| v.as_str()).is_some())
}
