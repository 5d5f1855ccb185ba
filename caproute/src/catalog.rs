//! Capability catalog.
//!
//! Holds the set of capability identifiers the engine can dispatch, with
//! enablement, default handler, fallback ordering and the aggregation flag.
//! Built-in entries are seeded at construction and can be reconfigured but
//! never removed; user-defined entries come and go through explicit updates.

use crate::error::{DispatchError, DispatchResult};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDef {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// Tried first when the request carries no explicit handler preference.
    pub default_handler: Option<String>,
    /// Secondary ordering for the fallback chain. Ids that do not resolve to
    /// a registered handler are silently skipped.
    pub fallback_handlers: Vec<String>,
    /// When set, every eligible handler runs concurrently and the results
    /// are merged instead of stopping at the first success.
    pub aggregate_results: bool,
    pub user_defined: bool,
}

impl CapabilityDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            default_handler: None,
            fallback_handlers: Vec::new(),
            aggregate_results: false,
            user_defined: true,
        }
    }

    pub fn with_default_handler(mut self, handler_id: impl Into<String>) -> Self {
        self.default_handler = Some(handler_id.into());
        self
    }

    pub fn with_fallbacks<I, S>(mut self, handler_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_handlers = handler_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aggregation(mut self, aggregate: bool) -> Self {
        self.aggregate_results = aggregate;
        self
    }

    fn builtin(id: &str, name: &str) -> Self {
        let mut def = Self::new(id, name);
        def.user_defined = false;
        def
    }
}

fn builtin_defs() -> Vec<CapabilityDef> {
    vec![
        CapabilityDef::builtin("generate", "Text generation"),
        CapabilityDef::builtin("research", "Topic research"),
        CapabilityDef::builtin("summarize", "Summarization"),
        CapabilityDef::builtin("translate", "Translation"),
        CapabilityDef::builtin("image-generate", "Image generation"),
        CapabilityDef::builtin("image-search", "Image search"),
        CapabilityDef::builtin("trend-scan", "Trend scanning").with_aggregation(true),
    ]
}

pub struct CapabilityCatalog {
    entries: RwLock<HashMap<String, CapabilityDef>>,
}

impl CapabilityCatalog {
    /// Catalog seeded with the built-in capability list.
    pub fn new() -> Self {
        let entries = builtin_defs()
            .into_iter()
            .map(|def| (def.id.clone(), def))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Empty catalog, for isolated tests.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<CapabilityDef> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<CapabilityDef> {
        let mut defs: Vec<CapabilityDef> = self.entries.read().await.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Insert or replace a capability definition. Overwriting a built-in
    /// entry keeps it non-removable.
    pub async fn register(&self, mut def: CapabilityDef) {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&def.id) {
            def.user_defined = existing.user_defined && def.user_defined;
        }
        log::debug!("catalog: registering capability '{}'", def.id);
        entries.insert(def.id.clone(), def);
    }

    /// Remove a user-defined capability. Built-ins cannot be removed.
    pub async fn remove(&self, id: &str) -> DispatchResult<()> {
        let mut entries = self.entries.write().await;
        match entries.get(id) {
            None => Err(DispatchError::CapabilityNotFound(id.to_string())),
            Some(def) if !def.user_defined => {
                Err(DispatchError::BuiltinImmutable(id.to_string()))
            }
            Some(_) => {
                entries.remove(id);
                Ok(())
            }
        }
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> DispatchResult<()> {
        self.update(id, |def| def.enabled = enabled).await
    }

    pub async fn set_default_handler(
        &self,
        id: &str,
        handler_id: Option<String>,
    ) -> DispatchResult<()> {
        self.update(id, |def| def.default_handler = handler_id.clone())
            .await
    }

    pub async fn set_fallbacks(&self, id: &str, handler_ids: Vec<String>) -> DispatchResult<()> {
        self.update(id, |def| def.fallback_handlers = handler_ids.clone())
            .await
    }

    async fn update<F>(&self, id: &str, mutate: F) -> DispatchResult<()>
    where
        F: Fn(&mut CapabilityDef),
    {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(def) => {
                mutate(def);
                Ok(())
            }
            None => Err(DispatchError::CapabilityNotFound(id.to_string())),
        }
    }
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        Self::new()
    }
}
