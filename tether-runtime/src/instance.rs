//! Component instance lifecycle.
//!
//! A [`ComponentInstance`] aggregates its handlers (dependencies among
//! them) and derives its state from the conjunction of their validities.
//! Listeners observe only aggregate flips: a handler event that does not
//! change the conjunction is invisible to them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use tether_shared::{TetherError, TetherResult};

use crate::dependency::{Dependency, DependencyStateListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Stopped,
    Invalid,
    Valid,
    /// Terminal; a disposed instance never runs again.
    Disposed,
}

/// One lifecycle-managed concern of an instance. Dependencies are handlers;
/// so are providers, configuration bridges, and anything else that gates
/// validity.
#[async_trait]
pub trait Handler: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self) -> TetherResult<()>;

    async fn stop(&self) -> TetherResult<()>;

    async fn is_valid(&self) -> bool;
}

/// Observes aggregate state transitions, e.g. to expose or withdraw the
/// instance's provided services.
#[async_trait]
pub trait InstanceStateListener: Send + Sync {
    async fn state_changed(&self, instance: &str, old_state: InstanceState, new_state: InstanceState);
}

struct InstanceCore {
    state: InstanceState,
    handler_validity: HashMap<String, bool>,
}

struct InstanceInner {
    name: String,
    handlers: Mutex<Vec<Arc<dyn Handler>>>,
    core: Mutex<InstanceCore>,
    listeners: Mutex<Vec<Arc<dyn InstanceStateListener>>>,
}

/// The lifecycle coordinator for one component instance. The instance
/// exclusively owns its handlers; handlers reach back only through the weak
/// validity listener.
#[derive(Clone)]
pub struct ComponentInstance {
    inner: Arc<InstanceInner>,
}

impl ComponentInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                name: name.into(),
                handlers: Mutex::new(Vec::new()),
                core: Mutex::new(InstanceCore {
                    state: InstanceState::Stopped,
                    handler_validity: HashMap::new(),
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn state(&self) -> InstanceState {
        self.inner.core.lock().await.state
    }

    pub async fn add_state_listener(&self, listener: Arc<dyn InstanceStateListener>) {
        self.inner.listeners.lock().await.push(listener);
    }

    /// Handlers are fixed before the instance starts.
    pub async fn register_handler(&self, handler: Arc<dyn Handler>) -> TetherResult<()> {
        let core = self.inner.core.lock().await;
        if core.state != InstanceState::Stopped {
            return Err(TetherError::configuration(format!(
                "instance {}: handlers must be registered while stopped",
                self.inner.name
            )));
        }
        drop(core);
        self.inner.handlers.lock().await.push(handler);
        Ok(())
    }

    /// The validity listener to wire into this instance's dependencies.
    /// Holds only a weak back-reference, so the instance's ownership of its
    /// dependencies stays acyclic.
    pub fn validity_listener(&self) -> Arc<InstanceValidityListener> {
        Arc::new(InstanceValidityListener {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Starts every handler in registration order, then derives the initial
    /// state from the conjunction of handler validities.
    pub async fn start(&self) -> TetherResult<()> {
        {
            let core = self.inner.core.lock().await;
            match core.state {
                InstanceState::Disposed => {
                    return Err(TetherError::configuration(format!(
                        "instance {} is disposed",
                        self.inner.name
                    )))
                }
                InstanceState::Stopped => {}
                _ => return Ok(()),
            }
        }

        let handlers = self.inner.handlers.lock().await.clone();
        for handler in &handlers {
            handler.start().await?;
        }

        let transition = {
            let mut core = self.inner.core.lock().await;
            for handler in &handlers {
                let valid = handler.is_valid().await;
                core.handler_validity
                    .insert(handler.id().to_string(), valid);
            }
            let old_state = core.state;
            core.state = if core.handler_validity.values().all(|v| *v) {
                InstanceState::Valid
            } else {
                InstanceState::Invalid
            };
            (old_state != core.state).then_some((old_state, core.state))
        };
        self.fire(transition).await;
        Ok(())
    }

    /// Stops every handler in reverse registration order. The instance can
    /// be started again.
    pub async fn stop(&self) -> TetherResult<()> {
        {
            let core = self.inner.core.lock().await;
            match core.state {
                InstanceState::Valid | InstanceState::Invalid => {}
                _ => return Ok(()),
            }
        }

        let handlers = self.inner.handlers.lock().await.clone();
        for handler in handlers.iter().rev() {
            handler.stop().await?;
        }

        let transition = {
            let mut core = self.inner.core.lock().await;
            let old_state = core.state;
            core.state = InstanceState::Stopped;
            core.handler_validity.clear();
            (old_state != core.state).then_some((old_state, core.state))
        };
        self.fire(transition).await;
        Ok(())
    }

    /// Terminal teardown: handlers stop in reverse order and the instance
    /// transitions to `Disposed`. Idempotent; further calls are no-ops.
    pub async fn dispose(&self) {
        {
            let core = self.inner.core.lock().await;
            if core.state == InstanceState::Disposed {
                return;
            }
        }

        let handlers = self.inner.handlers.lock().await.clone();
        for handler in handlers.iter().rev() {
            if let Err(e) = handler.stop().await {
                debug!(
                    "Handler {} failed stopping during disposal of {}: {}",
                    handler.id(),
                    self.inner.name,
                    e
                );
            }
        }

        let transition = {
            let mut core = self.inner.core.lock().await;
            let old_state = core.state;
            core.state = InstanceState::Disposed;
            core.handler_validity.clear();
            (old_state != core.state).then_some((old_state, core.state))
        };
        self.fire(transition).await;
        info!("Instance {} disposed", self.inner.name);
    }

    /// Records one handler's validity and recomputes the conjunction. The
    /// transition is observable only when the aggregate flips.
    async fn on_handler_validity(&self, handler_id: &str, valid: bool) {
        let transition = {
            let mut core = self.inner.core.lock().await;
            core.handler_validity.insert(handler_id.to_string(), valid);
            match core.state {
                InstanceState::Valid | InstanceState::Invalid => {
                    let all_valid = core.handler_validity.values().all(|v| *v);
                    let new_state = if all_valid {
                        InstanceState::Valid
                    } else {
                        InstanceState::Invalid
                    };
                    if new_state != core.state {
                        let old_state = core.state;
                        core.state = new_state;
                        Some((old_state, new_state))
                    } else {
                        None
                    }
                }
                // Not running: track the validity, nothing to observe.
                _ => None,
            }
        };
        self.fire(transition).await;
    }

    /// Listener callbacks run outside the instance lock.
    async fn fire(&self, transition: Option<(InstanceState, InstanceState)>) {
        let Some((old_state, new_state)) = transition else {
            return;
        };
        debug!(
            "Instance {} moved {:?} -> {:?}",
            self.inner.name, old_state, new_state
        );
        let listeners = self.inner.listeners.lock().await.clone();
        for listener in listeners {
            listener
                .state_changed(&self.inner.name, old_state, new_state)
                .await;
        }
    }
}

/// Weak bridge from a dependency's validity callbacks to its owning
/// instance.
pub struct InstanceValidityListener {
    inner: Weak<InstanceInner>,
}

#[async_trait]
impl DependencyStateListener for InstanceValidityListener {
    async fn validate(&self, dependency_id: &str) {
        if let Some(inner) = self.inner.upgrade() {
            ComponentInstance { inner }
                .on_handler_validity(dependency_id, true)
                .await;
        }
    }

    async fn invalidate(&self, dependency_id: &str) {
        if let Some(inner) = self.inner.upgrade() {
            ComponentInstance { inner }
                .on_handler_validity(dependency_id, false)
                .await;
        }
    }
}

/// Handler adapter giving one dependency a seat in the instance lifecycle.
pub struct DependencyHandler {
    dependency: Dependency,
}

impl DependencyHandler {
    pub fn new(dependency: Dependency) -> Arc<Self> {
        Arc::new(Self { dependency })
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }
}

#[async_trait]
impl Handler for DependencyHandler {
    fn id(&self) -> &str {
        self.dependency.id()
    }

    async fn start(&self) -> TetherResult<()> {
        self.dependency.start().await
    }

    async fn stop(&self) -> TetherResult<()> {
        self.dependency.stop().await;
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        self.dependency.is_valid().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct TestHandler {
        id: String,
        valid: AtomicBool,
        log: Arc<AsyncMutex<Vec<String>>>,
    }

    impl TestHandler {
        fn new(id: &str, valid: bool, log: Arc<AsyncMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                valid: AtomicBool::new(valid),
                log,
            })
        }
    }

    #[async_trait]
    impl Handler for TestHandler {
        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self) -> TetherResult<()> {
            self.log.lock().await.push(format!("start:{}", self.id));
            Ok(())
        }

        async fn stop(&self) -> TetherResult<()> {
            self.log.lock().await.push(format!("stop:{}", self.id));
            Ok(())
        }

        async fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    struct RecordingStateListener {
        log: Arc<AsyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl InstanceStateListener for RecordingStateListener {
        async fn state_changed(
            &self,
            _instance: &str,
            old_state: InstanceState,
            new_state: InstanceState,
        ) {
            self.log
                .lock()
                .await
                .push(format!("{:?}->{:?}", old_state, new_state));
        }
    }

    async fn instance_with(
        handlers: &[Arc<TestHandler>],
        log: Arc<AsyncMutex<Vec<String>>>,
    ) -> ComponentInstance {
        let instance = ComponentInstance::new("test-instance");
        instance
            .add_state_listener(Arc::new(RecordingStateListener { log }))
            .await;
        for handler in handlers {
            instance.register_handler(handler.clone()).await.unwrap();
        }
        instance
    }

    #[tokio::test]
    async fn test_start_computes_initial_validity() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let h1 = TestHandler::new("h1", true, log.clone());
        let h2 = TestHandler::new("h2", false, log.clone());
        let instance = instance_with(&[h1, h2], log.clone()).await;

        instance.start().await.unwrap();
        assert_eq!(instance.state().await, InstanceState::Invalid);
        assert_eq!(
            log.lock().await.clone(),
            vec!["start:h1", "start:h2", "Stopped->Invalid"]
        );
    }

    #[tokio::test]
    async fn test_all_valid_handlers_give_valid_instance() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let h1 = TestHandler::new("h1", true, log.clone());
        let instance = instance_with(&[h1], log.clone()).await;

        instance.start().await.unwrap();
        assert_eq!(instance.state().await, InstanceState::Valid);
    }

    #[tokio::test]
    async fn test_aggregate_flips_only_fire_once() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let h1 = TestHandler::new("h1", true, log.clone());
        let h2 = TestHandler::new("h2", false, log.clone());
        let instance = instance_with(&[h1.clone(), h2.clone()], log.clone()).await;
        instance.start().await.unwrap();
        log.lock().await.clear();

        // h1 flapping while h2 is invalid never changes the conjunction.
        instance.on_handler_validity("h1", false).await;
        instance.on_handler_validity("h1", true).await;
        assert!(log.lock().await.is_empty());

        // The conjunction flips exactly when the last invalid handler
        // validates.
        instance.on_handler_validity("h2", true).await;
        assert_eq!(log.lock().await.clone(), vec!["Invalid->Valid"]);

        // And back, on the first handler invalidating.
        instance.on_handler_validity("h1", false).await;
        assert_eq!(
            log.lock().await.clone(),
            vec!["Invalid->Valid", "Valid->Invalid"]
        );
    }

    #[tokio::test]
    async fn test_stop_reverses_handler_order_and_restarts() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let h1 = TestHandler::new("h1", true, log.clone());
        let h2 = TestHandler::new("h2", true, log.clone());
        let instance = instance_with(&[h1, h2], log.clone()).await;

        instance.start().await.unwrap();
        instance.stop().await.unwrap();
        assert_eq!(instance.state().await, InstanceState::Stopped);

        let recorded = log.lock().await.clone();
        assert_eq!(
            recorded,
            vec![
                "start:h1",
                "start:h2",
                "Stopped->Valid",
                "stop:h2",
                "stop:h1",
                "Valid->Stopped"
            ]
        );

        // Restartable after stop.
        instance.start().await.unwrap();
        assert_eq!(instance.state().await, InstanceState::Valid);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal_and_idempotent() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let h1 = TestHandler::new("h1", true, log.clone());
        let instance = instance_with(&[h1], log.clone()).await;

        instance.start().await.unwrap();
        instance.dispose().await;
        assert_eq!(instance.state().await, InstanceState::Disposed);

        // Idempotent: no second transition, no second stop.
        let before = log.lock().await.len();
        instance.dispose().await;
        assert_eq!(log.lock().await.len(), before);

        // Irrecoverable: restarting a disposed instance is refused.
        assert!(instance.start().await.is_err());

        // Handler events on a disposed instance are invisible.
        instance.on_handler_validity("h1", false).await;
        assert_eq!(instance.state().await, InstanceState::Disposed);
    }

    #[tokio::test]
    async fn test_handler_registration_rejected_after_start() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let h1 = TestHandler::new("h1", true, log.clone());
        let instance = instance_with(&[h1], log.clone()).await;
        instance.start().await.unwrap();

        let late = TestHandler::new("late", true, log);
        assert!(instance.register_handler(late).await.is_err());
    }

    #[tokio::test]
    async fn test_validity_listener_is_weak() {
        let log = Arc::new(AsyncMutex::new(Vec::<String>::new()));
        let instance = ComponentInstance::new("short-lived");
        let listener = instance.validity_listener();
        drop(instance);

        // The owner is gone; the bridge must be inert, not panic.
        listener.validate("dep").await;
        listener.invalidate("dep").await;
        assert!(log.lock().await.is_empty());
    }
}
