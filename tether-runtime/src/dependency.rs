//! The per-dependency state machine.
//!
//! A [`Dependency`] tracks the providers of one required specification,
//! keeps the matching and selected sets current through its interceptor
//! chains, binds service objects according to its binding policy, and
//! reports validity flips to its owner. Registry events are processed
//! under the dependency's private lock; bind/unbind/modified callbacks and
//! validity notifications are always delivered outside it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use tether_shared::{
    Filter, ListenerId, ServiceEvent, ServiceId, ServiceListener, ServiceObject, ServiceRegistry,
    TetherResult, TransformedServiceReference,
};

use crate::config::DependencyConfig;
use crate::interceptors::{
    BindingInterceptor, RankingInterceptor, ServiceComparator, TrackingInterceptor,
};
use crate::manager::{ChangeSet, ReferenceManager};

/// When a bound provider is replaced by a better candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BindingPolicy {
    /// Keep the current binding while it stays selected; rebind only after
    /// it departs.
    Static,
    /// Follow the top of the selected set, swapping providers while the
    /// component keeps running.
    #[default]
    Dynamic,
    /// Swap only for a strictly better-ranked candidate; equal rank never
    /// replaces the current binding.
    DynamicPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Unresolved,
    Resolved,
}

/// Bind-side callbacks invoked on the owning component.
#[async_trait]
pub trait DependencyListener: Send + Sync {
    async fn on_bind(&self, reference: &TransformedServiceReference, service: ServiceObject);

    async fn on_unbind(&self, reference: &TransformedServiceReference);

    async fn on_modified(&self, reference: &TransformedServiceReference) {
        let _ = reference;
    }

    async fn on_reconfiguration(
        &self,
        departures: &[TransformedServiceReference],
        arrivals: &[TransformedServiceReference],
    ) {
        let _ = (departures, arrivals);
    }
}

/// Validity propagation to the owning instance. Implementations hold a weak
/// back-reference; a dependency never owns its owner.
#[async_trait]
pub trait DependencyStateListener: Send + Sync {
    async fn validate(&self, dependency_id: &str);
    async fn invalidate(&self, dependency_id: &str);
}

/// Listener that drops every callback. Useful for standalone dependencies.
pub struct NullDependencyListener;

#[async_trait]
impl DependencyListener for NullDependencyListener {
    async fn on_bind(&self, _reference: &TransformedServiceReference, _service: ServiceObject) {}
    async fn on_unbind(&self, _reference: &TransformedServiceReference) {}
}

pub struct NullStateListener;

#[async_trait]
impl DependencyStateListener for NullStateListener {
    async fn validate(&self, _dependency_id: &str) {}
    async fn invalidate(&self, _dependency_id: &str) {}
}

struct DependencyCore {
    manager: ReferenceManager,
    aggregate: bool,
    optional: bool,
    state: DependencyState,
    bound: Vec<TransformedServiceReference>,
    /// Interceptor-wrapped service objects for the bound references.
    wrapped: HashMap<ServiceId, ServiceObject>,
}

struct DependencyInner {
    id: String,
    specification: String,
    policy: BindingPolicy,
    registry: ServiceRegistry,
    listener: Arc<dyn DependencyListener>,
    state_listener: Arc<dyn DependencyStateListener>,
    core: RwLock<DependencyCore>,
    subscription: Mutex<Option<ListenerId>>,
}

/// Callbacks accumulated under the lock, delivered after it is released.
#[derive(Default)]
struct Callbacks {
    unbinds: Vec<TransformedServiceReference>,
    binds: Vec<(TransformedServiceReference, ServiceObject)>,
    modified: Option<TransformedServiceReference>,
    reconfiguration: Option<(Vec<TransformedServiceReference>, Vec<TransformedServiceReference>)>,
    validity: Option<bool>,
}

/// One declared requirement of a component instance. Cheap to clone; all
/// clones drive the same dependency.
#[derive(Clone)]
pub struct Dependency {
    inner: Arc<DependencyInner>,
}

pub struct DependencyBuilder {
    config: DependencyConfig,
    comparator: Option<ServiceComparator>,
    listener: Option<Arc<dyn DependencyListener>>,
    state_listener: Option<Arc<dyn DependencyStateListener>>,
}

impl DependencyBuilder {
    pub fn new(config: DependencyConfig) -> Self {
        Self {
            config,
            comparator: None,
            listener: None,
            state_listener: None,
        }
    }

    pub fn with_comparator(mut self, comparator: ServiceComparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn DependencyListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn DependencyStateListener>) -> Self {
        self.state_listener = Some(listener);
        self
    }

    pub fn build(self, registry: ServiceRegistry) -> TetherResult<Dependency> {
        self.config.validate()?;
        let filter = self.config.effective_filter()?;
        let manager = ReferenceManager::new(self.config.id().to_string(), filter, self.comparator);

        Ok(Dependency {
            inner: Arc::new(DependencyInner {
                id: self.config.id().to_string(),
                specification: self.config.specification.clone(),
                policy: self.config.policy,
                registry,
                listener: self
                    .listener
                    .unwrap_or_else(|| Arc::new(NullDependencyListener)),
                state_listener: self
                    .state_listener
                    .unwrap_or_else(|| Arc::new(NullStateListener)),
                core: RwLock::new(DependencyCore {
                    manager,
                    aggregate: self.config.aggregate,
                    optional: self.config.optional,
                    state: DependencyState::Unresolved,
                    bound: Vec::new(),
                    wrapped: HashMap::new(),
                }),
                subscription: Mutex::new(None),
            }),
        })
    }
}

impl Dependency {
    pub fn builder(config: DependencyConfig) -> DependencyBuilder {
        DependencyBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn specification(&self) -> &str {
        &self.inner.specification
    }

    pub fn policy(&self) -> BindingPolicy {
        self.inner.policy
    }

    /// Opens tracking: subscribes to the registry, which replays the
    /// current providers through the normal event path.
    pub async fn start(&self) -> TetherResult<()> {
        let mut subscription = self.inner.subscription.lock().await;
        if subscription.is_some() {
            return Ok(());
        }

        let callbacks = {
            let mut core = self.inner.core.write().await;
            core.state = DependencyState::Unresolved;
            Callbacks {
                validity: recompute_validity(&mut core),
                ..Default::default()
            }
        };
        self.dispatch(callbacks).await;

        let listener: Arc<dyn ServiceListener> = Arc::new(self.clone());
        *subscription = Some(
            self.inner
                .registry
                .subscribe(&self.inner.specification, listener)
                .await,
        );
        Ok(())
    }

    /// Closes tracking: unbinds everything and drops every set. The
    /// dependency can be started again afterwards.
    pub async fn stop(&self) {
        let subscription = { self.inner.subscription.lock().await.take() };
        if let Some(id) = subscription {
            self.inner.registry.unsubscribe(id).await;
        }

        let callbacks = {
            let mut core = self.inner.core.write().await;
            let mut callbacks = Callbacks::default();
            let bound = std::mem::take(&mut core.bound);
            for reference in bound.iter().rev() {
                self.unbind_locked(&mut core, reference);
                callbacks.unbinds.push(reference.clone());
            }
            core.manager.clear();
            if core.state == DependencyState::Resolved {
                core.state = DependencyState::Unresolved;
                callbacks.validity = Some(false);
            }
            callbacks
        };
        self.dispatch(callbacks).await;
    }

    pub async fn state(&self) -> DependencyState {
        self.inner.core.read().await.state
    }

    /// `optional OR selected non-empty OR bound non-empty`, continuously
    /// re-evaluated after every registry event.
    pub async fn is_valid(&self) -> bool {
        self.inner.core.read().await.state == DependencyState::Resolved
    }

    pub async fn is_optional(&self) -> bool {
        self.inner.core.read().await.optional
    }

    pub async fn is_aggregate(&self) -> bool {
        self.inner.core.read().await.aggregate
    }

    pub async fn matching_services(&self) -> Vec<TransformedServiceReference> {
        self.inner.core.read().await.manager.matching().to_vec()
    }

    pub async fn selected_services(&self) -> Vec<TransformedServiceReference> {
        self.inner.core.read().await.manager.selected().to_vec()
    }

    pub async fn bound_services(&self) -> Vec<TransformedServiceReference> {
        self.inner.core.read().await.bound.clone()
    }

    pub async fn tracked_count(&self) -> usize {
        self.inner.core.read().await.manager.tracked_len()
    }

    /// The first bound reference, if any.
    pub async fn service_reference(&self) -> Option<TransformedServiceReference> {
        self.inner.core.read().await.bound.first().cloned()
    }

    /// The value a woven field accessor injects: the (wrapped) service
    /// object of the first binding.
    pub async fn injected_value(&self) -> Option<ServiceObject> {
        let core = self.inner.core.read().await;
        core.bound
            .first()
            .and_then(|reference| core.wrapped.get(&reference.id()).cloned())
    }

    /// All bound (wrapped) service objects, in selection order.
    pub async fn injected_values(&self) -> Vec<ServiceObject> {
        let core = self.inner.core.read().await;
        core.bound
            .iter()
            .filter_map(|reference| core.wrapped.get(&reference.id()).cloned())
            .collect()
    }

    /// Swaps the filter and reconfigures bindings against the recomputed
    /// matching set.
    pub async fn set_filter(&self, filter: Option<Filter>) -> TetherResult<()> {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            let change = core.manager.set_filter(filter)?;
            let mut callbacks = self.apply_change(&mut core, change);
            callbacks.reconfiguration = Some((
                callbacks.unbinds.clone(),
                callbacks.binds.iter().map(|(r, _)| r.clone()).collect(),
            ));
            callbacks
        };
        self.dispatch(callbacks).await;
        Ok(())
    }

    pub async fn set_comparator(&self, comparator: ServiceComparator) -> TetherResult<()> {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            let change = core.manager.set_comparator(comparator)?;
            self.apply_change(&mut core, change)
        };
        self.dispatch(callbacks).await;
        Ok(())
    }

    pub async fn set_ranking_interceptor(
        &self,
        interceptor: Arc<dyn RankingInterceptor>,
    ) -> TetherResult<()> {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            let change = core.manager.set_ranking_interceptor(interceptor)?;
            self.apply_change(&mut core, change)
        };
        self.dispatch(callbacks).await;
        Ok(())
    }

    pub async fn add_tracking_interceptor(
        &self,
        interceptor: Arc<dyn TrackingInterceptor>,
    ) -> TetherResult<()> {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            let change = core.manager.add_tracking_interceptor(interceptor)?;
            self.apply_change(&mut core, change)
        };
        self.dispatch(callbacks).await;
        Ok(())
    }

    pub async fn remove_tracking_interceptor(
        &self,
        interceptor: &Arc<dyn TrackingInterceptor>,
    ) -> TetherResult<()> {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            let change = core.manager.remove_tracking_interceptor(interceptor)?;
            self.apply_change(&mut core, change)
        };
        self.dispatch(callbacks).await;
        Ok(())
    }

    /// Binding interceptors apply from the next bind on; existing bindings
    /// keep the chain they were wrapped with.
    pub async fn add_binding_interceptor(&self, interceptor: Arc<dyn BindingInterceptor>) {
        self.inner
            .core
            .write()
            .await
            .manager
            .add_binding_interceptor(interceptor);
    }

    pub async fn remove_binding_interceptor(&self, interceptor: &Arc<dyn BindingInterceptor>) {
        self.inner
            .core
            .write()
            .await
            .manager
            .remove_binding_interceptor(interceptor);
    }

    /// Turning a single dependency aggregate binds the rest of the selected
    /// set; the reverse unbinds everything but the first binding.
    pub async fn set_aggregate(&self, aggregate: bool) {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            if core.aggregate == aggregate {
                Callbacks::default()
            } else {
                core.aggregate = aggregate;
                let mut callbacks = Callbacks::default();
                if aggregate {
                    let selected = core.manager.selected().to_vec();
                    for reference in selected {
                        if !core.bound.contains(&reference) {
                            if let Some(wrapped) = self.bind_locked(&mut core, &reference) {
                                core.bound.push(reference.clone());
                                callbacks.binds.push((reference, wrapped));
                            }
                        }
                    }
                } else {
                    while core.bound.len() > 1 {
                        if let Some(reference) = core.bound.pop() {
                            self.unbind_locked(&mut core, &reference);
                            callbacks.unbinds.push(reference);
                        }
                    }
                }
                callbacks.validity = recompute_validity(&mut core);
                callbacks
            }
        };
        self.dispatch(callbacks).await;
    }

    pub async fn set_optional(&self, optional: bool) {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            core.optional = optional;
            Callbacks {
                validity: recompute_validity(&mut core),
                ..Default::default()
            }
        };
        self.dispatch(callbacks).await;
    }

    async fn handle_event(&self, event: ServiceEvent) {
        let callbacks = {
            let mut core = self.inner.core.write().await;
            let outcome = match &event {
                ServiceEvent::Registered(reference) => core.manager.on_arrival(reference.clone()),
                ServiceEvent::Modified(reference) => core.manager.on_modified(reference),
                ServiceEvent::Unregistered(reference) => core.manager.on_departure(reference),
            };
            match outcome {
                Ok(Some(change)) => self.apply_change(&mut core, change),
                Ok(None) => Callbacks::default(),
                Err(e) => {
                    // The event is a no-op for this dependency; the sets
                    // were left untouched by the manager.
                    warn!(
                        "Dependency {} ignored event for service {}: {}",
                        self.inner.id,
                        event.reference(),
                        e
                    );
                    Callbacks::default()
                }
            }
        };
        self.dispatch(callbacks).await;
    }

    /// Reconciles the bound set with a new selected set, honouring the
    /// binding policy. Runs under the write lock; returns the callbacks to
    /// deliver once the lock is dropped.
    fn apply_change(&self, core: &mut DependencyCore, change: ChangeSet) -> Callbacks {
        let mut callbacks = Callbacks::default();

        // Bound services no longer selected must be released first.
        let bound_snapshot = core.bound.clone();
        for reference in bound_snapshot {
            if !change.selected.contains(&reference) {
                core.bound.retain(|b| b != &reference);
                self.unbind_locked(core, &reference);
                callbacks.unbinds.push(reference);
            }
        }

        if core.aggregate {
            for reference in &change.selected {
                if !core.bound.contains(reference) {
                    if let Some(wrapped) = self.bind_locked(core, reference) {
                        core.bound.push(reference.clone());
                        callbacks.binds.push((reference.clone(), wrapped));
                    }
                }
            }
            // Keep the bound set in selection order.
            core.bound
                .sort_by_key(|b| change.selected.iter().position(|s| s == b));
        } else {
            let current = core.bound.first().cloned();
            let best = change.selected.first().cloned();
            match (current, best) {
                (None, Some(best)) => {
                    if let Some(wrapped) = self.bind_locked(core, &best) {
                        core.bound.push(best.clone());
                        callbacks.binds.push((best, wrapped));
                    }
                }
                (Some(current), Some(best)) => {
                    if current != best && self.should_swap(core, &best, &current) {
                        core.bound.clear();
                        self.unbind_locked(core, &current);
                        callbacks.unbinds.push(current);
                        if let Some(wrapped) = self.bind_locked(core, &best) {
                            core.bound.push(best.clone());
                            callbacks.binds.push((best, wrapped));
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(modified) = change.modified {
            if let Some(slot) = core.bound.iter_mut().find(|b| **b == modified) {
                *slot = modified.clone();
                callbacks.modified = Some(modified);
            }
        }

        callbacks.validity = recompute_validity(core);
        callbacks
    }

    fn should_swap(
        &self,
        core: &DependencyCore,
        best: &TransformedServiceReference,
        current: &TransformedServiceReference,
    ) -> bool {
        match self.inner.policy {
            BindingPolicy::Dynamic => true,
            BindingPolicy::Static => false,
            // Strictly better only: an equally-ranked candidate never
            // displaces the current binding.
            BindingPolicy::DynamicPriority => {
                core.manager.compare(best, current) == Ordering::Less
            }
        }
    }

    fn bind_locked(
        &self,
        core: &mut DependencyCore,
        reference: &TransformedServiceReference,
    ) -> Option<ServiceObject> {
        let service = match self.inner.registry.get_service(reference.id()) {
            Some(service) => service,
            None => {
                debug!(
                    "Service {} vanished before dependency {} could bind it",
                    reference, self.inner.id
                );
                return None;
            }
        };
        match core.manager.wrap(reference, service) {
            Ok(wrapped) => {
                core.wrapped.insert(reference.id(), wrapped.clone());
                Some(wrapped)
            }
            Err(e) => {
                warn!(
                    "Binding interceptor failed wrapping {} for dependency {}: {}",
                    reference, self.inner.id, e
                );
                None
            }
        }
    }

    fn unbind_locked(&self, core: &mut DependencyCore, reference: &TransformedServiceReference) {
        if let Err(e) = core.manager.unwrap(reference) {
            warn!(
                "Binding interceptor failed unwinding {} for dependency {}: {}",
                reference, self.inner.id, e
            );
        }
        core.wrapped.remove(&reference.id());
    }

    async fn dispatch(&self, callbacks: Callbacks) {
        for reference in &callbacks.unbinds {
            self.inner.listener.on_unbind(reference).await;
        }
        for (reference, service) in &callbacks.binds {
            self.inner.listener.on_bind(reference, service.clone()).await;
        }
        if let Some(reference) = &callbacks.modified {
            self.inner.listener.on_modified(reference).await;
        }
        if let Some((departures, arrivals)) = &callbacks.reconfiguration {
            self.inner
                .listener
                .on_reconfiguration(departures, arrivals)
                .await;
        }
        match callbacks.validity {
            Some(true) => {
                debug!("Dependency {} resolved", self.inner.id);
                self.inner.state_listener.validate(&self.inner.id).await;
            }
            Some(false) => {
                debug!("Dependency {} unresolved", self.inner.id);
                self.inner.state_listener.invalidate(&self.inner.id).await;
            }
            None => {}
        }
    }
}

fn recompute_validity(core: &mut DependencyCore) -> Option<bool> {
    let valid = core.optional || !core.manager.selected().is_empty() || !core.bound.is_empty();
    let new_state = if valid {
        DependencyState::Resolved
    } else {
        DependencyState::Unresolved
    };
    if new_state == core.state {
        return None;
    }
    core.state = new_state;
    Some(valid)
}

#[async_trait]
impl ServiceListener for Dependency {
    async fn on_event(&self, event: ServiceEvent) -> TetherResult<()> {
        self.handle_event(event).await;
        Ok(())
    }
}
