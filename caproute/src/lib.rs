//! caproute - capability dispatch and fallback execution engine.
//!
//! Routes a capability request (generate text, research a topic, search
//! images) to one of several interchangeable backends, with ordered fallback
//! on failure and optional parallel fan-out for aggregation. The engine is
//! agnostic to what a handler does; it only manages which handler runs, in
//! what order, under what retry/timeout/validation policy, and how results
//! are combined.

pub mod catalog;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
mod executor;
pub mod registry;
pub mod types;
pub mod validators;

pub use catalog::{CapabilityCatalog, CapabilityDef};
pub use config::EngineConfig;
pub use diagnostics::{
    DiagnosticsListener, DiagnosticsRecord, DiagnosticsRecorder, ProviderStats,
};
pub use engine::DispatchEngine;
pub use error::{DispatchError, DispatchResult};
pub use registry::{HandlerRegistry, HandlerSource, RegistryEvent, SourceEvent};
pub use types::{
    AggregateOutcome, ExecuteRequest, ExecuteResult, HandlerDescriptor, HandlerFn,
    HandlerResponse, Payload, ProgressFn, ProgressPhase, ProgressUpdate, SourceKind, TokenUsage,
};
pub use validators::{Validator, ValidatorTable};
