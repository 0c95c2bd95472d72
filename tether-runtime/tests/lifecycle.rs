//! End-to-end assembly scenarios: registry, dependencies, instance
//! lifecycle, temporal resolution and coordinations working together.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration, Instant};

use tether_runtime::{
    BindingPolicy, ComponentInstance, Dependency, DependencyConfig, DependencyHandler,
    InstanceState, InstanceStateListener, TemporalDependency,
};
use tether_shared::{
    Coordination, Coordinator, FailureCause, Participant, ServiceProperties, ServiceRegistry,
    TetherError, TetherResult, SERVICE_RANKING,
};
use tether_util::mocks::MockService;

struct RecordingInstanceListener {
    log: Arc<AsyncMutex<Vec<String>>>,
}

#[async_trait]
impl InstanceStateListener for RecordingInstanceListener {
    async fn state_changed(
        &self,
        instance: &str,
        _old_state: InstanceState,
        new_state: InstanceState,
    ) {
        self.log
            .lock()
            .await
            .push(format!("{}:{:?}", instance, new_state));
    }
}

async fn provider(
    registry: &ServiceRegistry,
    specification: &str,
    name: &str,
    ranking: i64,
) -> tether_shared::ServiceRegistration {
    let mut props = ServiceProperties::new();
    props.insert(SERVICE_RANKING.to_string(), json!(ranking));
    registry
        .register(specification, MockService::new(name), props)
        .await
}

/// A component never sees an exception from unsatisfied mandatory
/// dependencies; it simply stays (or becomes) invalid until the registry
/// heals it.
#[tokio::test]
async fn instance_follows_provider_availability() {
    let registry = ServiceRegistry::new();
    let instance = ComponentInstance::new("logger-client");
    let log = Arc::new(AsyncMutex::new(Vec::new()));
    instance
        .add_state_listener(Arc::new(RecordingInstanceListener { log: log.clone() }))
        .await;

    let dependency = Dependency::builder(DependencyConfig::new("log.LogService"))
        .with_state_listener(instance.validity_listener())
        .build(registry.clone())
        .unwrap();
    instance
        .register_handler(DependencyHandler::new(dependency.clone()))
        .await
        .unwrap();

    instance.start().await.unwrap();
    assert_eq!(instance.state().await, InstanceState::Invalid);

    let registration = provider(&registry, "log.LogService", "log", 0).await;
    assert_eq!(instance.state().await, InstanceState::Valid);

    registration.unregister().await;
    assert_eq!(instance.state().await, InstanceState::Invalid);

    // Self-healing: a replacement provider re-validates the instance.
    provider(&registry, "log.LogService", "log2", 0).await;
    assert_eq!(instance.state().await, InstanceState::Valid);

    assert_eq!(
        log.lock().await.clone(),
        vec![
            "logger-client:Invalid",
            "logger-client:Valid",
            "logger-client:Invalid",
            "logger-client:Valid"
        ]
    );
}

/// Two mandatory dependencies: the aggregate flips only when the last
/// missing one resolves, and only once.
#[tokio::test]
async fn aggregate_validity_is_a_conjunction() {
    let registry = ServiceRegistry::new();
    let instance = ComponentInstance::new("web-component");
    let log = Arc::new(AsyncMutex::new(Vec::new()));
    instance
        .add_state_listener(Arc::new(RecordingInstanceListener { log: log.clone() }))
        .await;

    for specification in ["log.LogService", "http.HttpService"] {
        let dependency = Dependency::builder(DependencyConfig::new(specification))
            .with_state_listener(instance.validity_listener())
            .build(registry.clone())
            .unwrap();
        instance
            .register_handler(DependencyHandler::new(dependency))
            .await
            .unwrap();
    }
    instance.start().await.unwrap();
    assert_eq!(instance.state().await, InstanceState::Invalid);

    provider(&registry, "log.LogService", "log", 0).await;
    // One of two resolved: still invalid, and no listener noise.
    assert_eq!(instance.state().await, InstanceState::Invalid);
    assert_eq!(log.lock().await.len(), 1);

    provider(&registry, "http.HttpService", "http", 0).await;
    assert_eq!(instance.state().await, InstanceState::Valid);
    assert_eq!(log.lock().await.len(), 2);
}

/// Mandatory single dependency under the dynamic policy, swapped across
/// rankings without ever being transiently invalid.
#[tokio::test]
async fn dynamic_rebinding_walkthrough() {
    let registry = ServiceRegistry::new();
    let dependency = Dependency::builder(
        DependencyConfig::new("foo.FooService").with_policy(BindingPolicy::Dynamic),
    )
    .build(registry.clone())
    .unwrap();
    dependency.start().await.unwrap();

    assert!(!dependency.is_valid().await);

    let rank0 = provider(&registry, "foo.FooService", "rank0", 0).await;
    assert!(dependency.is_valid().await);
    assert_eq!(
        dependency.service_reference().await.map(|r| r.id()),
        Some(rank0.id())
    );

    let rank10 = provider(&registry, "foo.FooService", "rank10", 10).await;
    assert!(dependency.is_valid().await);
    assert_eq!(
        dependency.service_reference().await.map(|r| r.id()),
        Some(rank10.id())
    );

    rank10.unregister().await;
    assert!(dependency.is_valid().await);
    assert_eq!(
        dependency.service_reference().await.map(|r| r.id()),
        Some(rank0.id())
    );
}

struct RecordingParticipant {
    log: Arc<AsyncMutex<Vec<String>>>,
}

#[async_trait]
impl Participant for RecordingParticipant {
    async fn ended(&self, coordination: &Coordination) -> TetherResult<()> {
        self.log
            .lock()
            .await
            .push(format!("ended:{}", coordination.name()));
        Ok(())
    }

    async fn failed(&self, coordination: &Coordination) -> TetherResult<()> {
        self.log
            .lock()
            .await
            .push(format!("failed:{}", coordination.name()));
        Ok(())
    }
}

/// A temporal wait bounded at 200ms with no fallback policy surfaces an
/// unavailability error at the use site within scheduling slop, and a
/// coordination joined for the same unit of work notifies its participants
/// of the timeout failure.
#[tokio::test]
async fn temporal_timeout_with_coordination() {
    let registry = ServiceRegistry::new();
    let temporal = TemporalDependency::standalone(
        DependencyConfig::new("foo.FooService").with_timeout_ms(200),
        registry.clone(),
        None,
    )
    .unwrap();
    temporal.start().await.unwrap();

    let coordinator = Coordinator::new();
    let coordination = coordinator.create("resolve-foo", Duration::from_millis(200));
    let log = Arc::new(AsyncMutex::new(Vec::new()));
    coordination
        .add_participant(Arc::new(RecordingParticipant { log: log.clone() }))
        .await
        .unwrap();

    let started = Instant::now();
    let result = temporal.get().await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(TetherError::ServiceUnavailable { .. })));
    assert!(waited >= Duration::from_millis(190), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(700), "waited {:?}", waited);

    assert!(coordination.join(Some(Duration::from_secs(2))).await);
    assert_eq!(coordination.failure().await, Some(FailureCause::Timeout));
    assert_eq!(log.lock().await.clone(), vec!["failed:resolve-foo"]);
}

/// A satisfied temporal dependency keeps the caller on the fast path and a
/// coordination groups the work's end callbacks in reverse order.
#[tokio::test]
async fn temporal_success_within_coordination() {
    let registry = ServiceRegistry::new();
    provider(&registry, "foo.FooService", "fast", 0).await;

    let temporal = TemporalDependency::standalone(
        DependencyConfig::new("foo.FooService").with_timeout_ms(200),
        registry.clone(),
        None,
    )
    .unwrap();
    temporal.start().await.unwrap();

    let coordinator = Coordinator::new();
    let coordination = coordinator.create("use-foo", Duration::ZERO);
    let log = Arc::new(AsyncMutex::new(Vec::new()));
    for _ in 0..2 {
        coordination
            .add_participant(Arc::new(RecordingParticipant { log: log.clone() }))
            .await
            .unwrap();
    }

    let service = temporal.get().await.unwrap().unwrap();
    assert_eq!(service.downcast::<MockService>().unwrap().name(), "fast");

    coordination.end().await.unwrap();
    assert_eq!(
        log.lock().await.clone(),
        vec!["ended:use-foo", "ended:use-foo"]
    );
}

/// Disposal is terminal: dependencies are torn down and later registry
/// traffic cannot resurrect the instance.
#[tokio::test]
async fn disposed_instance_ignores_registry_traffic() {
    let registry = ServiceRegistry::new();
    let instance = ComponentInstance::new("short-lived");

    let dependency = Dependency::builder(DependencyConfig::new("log.LogService"))
        .with_state_listener(instance.validity_listener())
        .build(registry.clone())
        .unwrap();
    instance
        .register_handler(DependencyHandler::new(dependency.clone()))
        .await
        .unwrap();
    instance.start().await.unwrap();

    provider(&registry, "log.LogService", "log", 0).await;
    assert_eq!(instance.state().await, InstanceState::Valid);

    instance.dispose().await;
    assert_eq!(instance.state().await, InstanceState::Disposed);

    // New providers no longer reach the disposed instance's dependency.
    provider(&registry, "log.LogService", "late", 5).await;
    assert_eq!(instance.state().await, InstanceState::Disposed);
    assert!(dependency.bound_services().await.is_empty());
}
