//! Handler registry.
//!
//! Single writer for the canonical handler table. Callers get cloned
//! snapshots from `eligible_for`, so registration and removal can race a
//! request that is mid-flight without invalidating its iteration. Dynamic
//! sources (tool-protocol servers) feed the registry through an explicit
//! event channel rather than registering from arbitrary call sites.

use crate::error::DispatchResult;
use crate::types::HandlerDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Change notification emitted to registry subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered { id: String },
    Removed { id: String },
    AvailabilityChanged { id: String, available: bool },
}

/// Event emitted by an external-source adapter (e.g. a tool server
/// announcing or withdrawing handlers).
#[derive(Debug, Clone)]
pub enum SourceEvent {
    HandlerAvailable(HandlerDescriptor),
    HandlerRemoved(String),
    SourceDisconnected(String),
}

/// A dynamic source of handlers that can be polled for its current offering.
#[async_trait]
pub trait HandlerSource: Send + Sync {
    /// Identifier stamped onto registered handlers, used for bulk removal
    /// when the source disconnects.
    fn source_id(&self) -> &str;

    /// Enumerate the handlers this source currently offers.
    async fn discover(&self) -> DispatchResult<Vec<HandlerDescriptor>>;
}

pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerDescriptor>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            handlers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Insert or replace a handler by id.
    pub async fn register(&self, handler: HandlerDescriptor) {
        let id = handler.id.clone();
        log::debug!("registry: registering handler '{}'", id);
        self.handlers.write().await.insert(id.clone(), handler);
        self.emit(RegistryEvent::Registered { id });
    }

    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.handlers.write().await.remove(id).is_some();
        if removed {
            self.emit(RegistryEvent::Removed { id: id.to_string() });
        }
        removed
    }

    /// Remove every handler registered under the given dynamic source.
    pub async fn unregister_by_source(&self, source_id: &str) -> usize {
        let removed: Vec<String> = {
            let mut handlers = self.handlers.write().await;
            let ids: Vec<String> = handlers
                .values()
                .filter(|h| h.origin.as_deref() == Some(source_id))
                .map(|h| h.id.clone())
                .collect();
            for id in &ids {
                handlers.remove(id);
            }
            ids
        };
        if !removed.is_empty() {
            log::debug!(
                "registry: source '{}' disconnected, removed {} handlers",
                source_id,
                removed.len()
            );
        }
        for id in &removed {
            self.emit(RegistryEvent::Removed { id: id.clone() });
        }
        removed.len()
    }

    pub async fn set_availability(&self, id: &str, available: bool) -> bool {
        let changed = {
            let mut handlers = self.handlers.write().await;
            match handlers.get_mut(id) {
                Some(handler) if handler.available != available => {
                    handler.available = available;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(RegistryEvent::AvailabilityChanged {
                id: id.to_string(),
                available,
            });
        }
        changed
    }

    pub async fn get(&self, id: &str) -> Option<HandlerDescriptor> {
        self.handlers.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Snapshot of available handlers supporting the capability, sorted by
    /// descending priority (id as tiebreak, for deterministic chains).
    pub async fn eligible_for(&self, capability_id: &str) -> Vec<HandlerDescriptor> {
        let mut eligible: Vec<HandlerDescriptor> = self
            .handlers
            .read()
            .await
            .values()
            .filter(|h| h.available && h.supports(capability_id))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        eligible
    }

    /// Apply one external-source event.
    pub async fn apply_source_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::HandlerAvailable(handler) => self.register(handler).await,
            SourceEvent::HandlerRemoved(id) => {
                self.unregister(&id).await;
            }
            SourceEvent::SourceDisconnected(source_id) => {
                self.unregister_by_source(&source_id).await;
            }
        }
    }

    /// Consume an adapter's event stream until it closes, keeping the
    /// registry the single writer for dynamic registration.
    pub async fn drive_source_events(&self, mut events: mpsc::Receiver<SourceEvent>) {
        while let Some(event) = events.recv().await {
            self.apply_source_event(event).await;
        }
    }

    /// Poll a [`HandlerSource`] and reconcile its offering: new handlers are
    /// registered under the source's id, handlers the source no longer
    /// offers are removed.
    pub async fn sync_source(&self, source: &dyn HandlerSource) -> DispatchResult<usize> {
        let discovered = source.discover().await?;
        let source_id = source.source_id().to_string();
        let discovered_ids: Vec<String> = discovered.iter().map(|h| h.id.clone()).collect();

        let stale: Vec<String> = {
            let handlers = self.handlers.read().await;
            handlers
                .values()
                .filter(|h| {
                    h.origin.as_deref() == Some(source_id.as_str())
                        && !discovered_ids.contains(&h.id)
                })
                .map(|h| h.id.clone())
                .collect()
        };
        for id in stale {
            self.unregister(&id).await;
        }

        let count = discovered.len();
        for handler in discovered {
            self.register(handler.with_origin(source_id.clone())).await;
        }
        Ok(count)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
