//! The service registry collaborator: an in-memory implementation of the
//! register / modify / unregister event model that dependencies consume.
//!
//! Events for a registry are dispatched in the order the operations were
//! applied; a listener subscribing mid-flight first receives synthetic
//! `Registered` events for every live service of its specification, so it
//! never observes a torn snapshot.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::exception::TetherResult;
use crate::reference::{ServiceId, ServiceProperties, ServiceReference, SERVICE_ID};

/// The published service object. Consumers downcast to the service trait
/// object or concrete type they expect.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Event stream reported by the registry.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Registered(ServiceReference),
    Modified(ServiceReference),
    Unregistered(ServiceReference),
}

impl ServiceEvent {
    pub fn reference(&self) -> &ServiceReference {
        match self {
            ServiceEvent::Registered(r)
            | ServiceEvent::Modified(r)
            | ServiceEvent::Unregistered(r) => r,
        }
    }
}

/// Receives service events for one specification.
#[async_trait]
pub trait ServiceListener: Send + Sync {
    async fn on_event(&self, event: ServiceEvent) -> TetherResult<()>;
}

struct ServiceEntry {
    reference: ServiceReference,
    object: ServiceObject,
}

#[derive(Default)]
struct ListenerTable {
    by_specification: HashMap<String, Vec<(ListenerId, Arc<dyn ServiceListener>)>>,
}

struct RegistryInner {
    next_service_id: AtomicU64,
    next_listener_id: AtomicU64,
    services: DashMap<ServiceId, ServiceEntry>,
    /// Guards listener membership and orders event dispatch.
    dispatch: Mutex<ListenerTable>,
}

/// In-memory service registry.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_service_id: AtomicU64::new(1),
                next_listener_id: AtomicU64::new(1),
                services: DashMap::new(),
                dispatch: Mutex::new(ListenerTable::default()),
            }),
        }
    }

    /// Publishes a service and notifies listeners of the specification.
    pub async fn register(
        &self,
        specification: &str,
        object: ServiceObject,
        mut properties: ServiceProperties,
    ) -> ServiceRegistration {
        let id = ServiceId(self.inner.next_service_id.fetch_add(1, Ordering::SeqCst));
        properties.insert(SERVICE_ID.to_string(), serde_json::json!(id.0));
        let reference = ServiceReference::new(id, specification, properties);

        let table = self.inner.dispatch.lock().await;
        self.inner.services.insert(
            id,
            ServiceEntry {
                reference: reference.clone(),
                object,
            },
        );
        debug!("Registered service {}", reference);
        Self::notify(&table, specification, ServiceEvent::Registered(reference.clone())).await;
        drop(table);

        ServiceRegistration {
            registry: self.clone(),
            id,
            specification: specification.to_string(),
            active: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    /// Adds a listener for a specification and replays `Registered` events
    /// for every live service of that specification before returning, so the
    /// listener starts from a consistent view.
    pub async fn subscribe(
        &self,
        specification: &str,
        listener: Arc<dyn ServiceListener>,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let mut table = self.inner.dispatch.lock().await;

        let mut existing: Vec<ServiceReference> = self
            .inner
            .services
            .iter()
            .filter(|entry| entry.reference.specification() == specification)
            .map(|entry| entry.reference.clone())
            .collect();
        existing.sort_by_key(|r| r.id());
        for reference in existing {
            if let Err(e) = listener.on_event(ServiceEvent::Registered(reference)).await {
                error!("Service listener failed during replay: {}", e);
            }
        }

        table
            .by_specification
            .entry(specification.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub async fn unsubscribe(&self, id: ListenerId) {
        let mut table = self.inner.dispatch.lock().await;
        for listeners in table.by_specification.values_mut() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    pub fn get_service(&self, id: ServiceId) -> Option<ServiceObject> {
        self.inner.services.get(&id).map(|entry| entry.object.clone())
    }

    pub fn get_reference(&self, id: ServiceId) -> Option<ServiceReference> {
        self.inner
            .services
            .get(&id)
            .map(|entry| entry.reference.clone())
    }

    /// Live references for a specification, in registration order.
    pub fn references_for(&self, specification: &str) -> Vec<ServiceReference> {
        let mut references: Vec<ServiceReference> = self
            .inner
            .services
            .iter()
            .filter(|entry| entry.reference.specification() == specification)
            .map(|entry| entry.reference.clone())
            .collect();
        references.sort_by_key(|r| r.id());
        references
    }

    pub fn service_count(&self) -> usize {
        self.inner.services.len()
    }

    async fn set_properties(
        &self,
        id: ServiceId,
        specification: &str,
        mut properties: ServiceProperties,
    ) {
        properties.insert(SERVICE_ID.to_string(), serde_json::json!(id.0));
        let table = self.inner.dispatch.lock().await;
        let reference = match self.inner.services.get_mut(&id) {
            Some(mut entry) => {
                entry.reference = ServiceReference::new(id, specification, properties);
                entry.reference.clone()
            }
            None => return,
        };
        Self::notify(&table, specification, ServiceEvent::Modified(reference)).await;
    }

    async fn unregister(&self, id: ServiceId, specification: &str) {
        let table = self.inner.dispatch.lock().await;
        let reference = match self.inner.services.remove(&id) {
            Some((_, entry)) => entry.reference,
            None => return,
        };
        debug!("Unregistered service {}", reference);
        Self::notify(&table, specification, ServiceEvent::Unregistered(reference)).await;
    }

    /// Fans an event out to the listeners of a specification. A failing
    /// listener is logged and skipped; the dispatch continues so one broken
    /// consumer cannot starve the others.
    async fn notify(table: &ListenerTable, specification: &str, event: ServiceEvent) {
        let Some(listeners) = table.by_specification.get(specification) else {
            return;
        };
        for (listener_id, listener) in listeners {
            if let Err(e) = listener.on_event(event.clone()).await {
                error!(
                    "Service listener {:?} failed handling {:?}: {}",
                    listener_id,
                    event.reference().id(),
                    e
                );
            }
        }
    }
}

/// Handle returned by [`ServiceRegistry::register`]. Dropping it does NOT
/// unregister the service; unregistration is explicit.
#[derive(Clone)]
pub struct ServiceRegistration {
    registry: ServiceRegistry,
    id: ServiceId,
    specification: String,
    active: Arc<std::sync::atomic::AtomicBool>,
}

impl ServiceRegistration {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn reference(&self) -> Option<ServiceReference> {
        self.registry.get_reference(self.id)
    }

    /// Replaces the published properties and dispatches a `Modified` event.
    /// The registry-assigned identity is preserved.
    pub async fn set_properties(&self, properties: ServiceProperties) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.registry
            .set_properties(self.id, &self.specification, properties)
            .await;
    }

    /// Withdraws the service. Idempotent.
    pub async fn unregister(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.registry.unregister(self.id, &self.specification).await;
        }
    }
}
