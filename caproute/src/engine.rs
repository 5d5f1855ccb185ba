//! Dispatch engine context object.
//!
//! Owns the catalog, registry, validator table and diagnostics recorder.
//! There is no process-wide state: tests and embedders create as many
//! isolated engines as they need and drop them when done.

use crate::catalog::{CapabilityCatalog, CapabilityDef};
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticsListener, DiagnosticsRecord, DiagnosticsRecorder, ProviderStats};
use crate::error::{DispatchError, DispatchResult};
use crate::executor::aggregate::AggregateExecutor;
use crate::executor::sequential::SequentialExecutor;
use crate::registry::{HandlerRegistry, HandlerSource, RegistryEvent, SourceEvent};
use crate::types::{ExecuteRequest, ExecuteResult, HandlerDescriptor};
use crate::validators::{Validator, ValidatorTable};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub struct DispatchEngine {
    catalog: Arc<CapabilityCatalog>,
    registry: Arc<HandlerRegistry>,
    validators: Arc<ValidatorTable>,
    diagnostics: Arc<DiagnosticsRecorder>,
    config: EngineConfig,
}

impl DispatchEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine whose diagnostics records are forwarded synchronously to the
    /// given listener as they are produced.
    pub fn with_diagnostics_listener(config: EngineConfig, listener: DiagnosticsListener) -> Self {
        Self::build(config, Some(listener))
    }

    fn build(config: EngineConfig, listener: Option<DiagnosticsListener>) -> Self {
        let diagnostics = match listener {
            Some(listener) => DiagnosticsRecorder::with_listener(listener),
            None => DiagnosticsRecorder::new(),
        };
        Self {
            catalog: Arc::new(CapabilityCatalog::new()),
            registry: Arc::new(HandlerRegistry::new()),
            validators: Arc::new(ValidatorTable::with_defaults(config.min_text_chars)),
            diagnostics: Arc::new(diagnostics),
            config,
        }
    }

    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Registration surface
    // ------------------------------------------------------------------

    pub async fn register_handler(&self, handler: HandlerDescriptor) {
        self.registry.register(handler).await;
    }

    pub async fn unregister_handler(&self, id: &str) -> bool {
        self.registry.unregister(id).await
    }

    pub async fn unregister_by_source(&self, source_id: &str) -> usize {
        self.registry.unregister_by_source(source_id).await
    }

    pub async fn register_capability(&self, def: CapabilityDef) {
        self.catalog.register(def).await;
    }

    pub async fn remove_capability(&self, id: &str) -> DispatchResult<()> {
        self.catalog.remove(id).await
    }

    pub fn register_validator(&self, capability_id: &str, validator: Validator) {
        self.validators.register(capability_id, validator);
    }

    pub fn subscribe_registry(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Drive an external-source adapter's event stream into the registry.
    /// Returns once the sender side closes.
    pub async fn drive_source_events(&self, events: mpsc::Receiver<SourceEvent>) {
        self.registry.drive_source_events(events).await;
    }

    /// Poll a dynamic handler source once and reconcile its offering.
    pub async fn sync_source(&self, source: &dyn HandlerSource) -> DispatchResult<usize> {
        self.registry.sync_source(source).await
    }

    // ------------------------------------------------------------------
    // Execution surface
    // ------------------------------------------------------------------

    /// Execute a capability request. Routes to the aggregate executor when
    /// the capability is flagged for aggregation, otherwise walks the
    /// sequential fallback chain. Always returns exactly one result.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResult {
        let capability = match self.resolve(&request.capability).await {
            Ok(capability) => capability,
            Err(err) => return ExecuteResult::terminal(&err),
        };
        if capability.aggregate_results {
            self.run_aggregate(&capability, &request).await
        } else {
            self.run_sequential(&capability, &request).await
        }
    }

    /// Force aggregate execution regardless of the capability's flag.
    pub async fn execute_aggregate(&self, request: ExecuteRequest) -> ExecuteResult {
        let capability = match self.resolve(&request.capability).await {
            Ok(capability) => capability,
            Err(err) => return ExecuteResult::terminal(&err),
        };
        self.run_aggregate(&capability, &request).await
    }

    async fn resolve(&self, capability_id: &str) -> DispatchResult<CapabilityDef> {
        let capability = self
            .catalog
            .get(capability_id)
            .await
            .ok_or_else(|| DispatchError::CapabilityNotFound(capability_id.to_string()))?;
        if !capability.enabled {
            return Err(DispatchError::CapabilityDisabled(capability_id.to_string()));
        }
        Ok(capability)
    }

    async fn run_sequential(
        &self,
        capability: &CapabilityDef,
        request: &ExecuteRequest,
    ) -> ExecuteResult {
        SequentialExecutor {
            registry: self.registry.as_ref(),
            validators: self.validators.as_ref(),
            diagnostics: self.diagnostics.as_ref(),
            config: &self.config,
        }
        .execute(capability, request)
        .await
    }

    async fn run_aggregate(
        &self,
        capability: &CapabilityDef,
        request: &ExecuteRequest,
    ) -> ExecuteResult {
        AggregateExecutor {
            registry: self.registry.as_ref(),
            validators: self.validators.as_ref(),
            diagnostics: self.diagnostics.as_ref(),
            config: &self.config,
        }
        .execute(capability, request)
        .await
    }

    // ------------------------------------------------------------------
    // Diagnostics surface
    // ------------------------------------------------------------------

    pub fn provider_stats(&self) -> HashMap<String, ProviderStats> {
        self.diagnostics.provider_stats()
    }

    pub fn diagnostics_log(&self) -> Vec<DiagnosticsRecord> {
        self.diagnostics.log()
    }

    pub fn clear_diagnostics(&self) {
        self.diagnostics.clear();
    }
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
