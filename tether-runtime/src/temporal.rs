//! Temporal (blocking-with-timeout) dependency resolution.
//!
//! Instead of surfacing invalidity, a temporal dependency suspends the
//! calling task until a provider binds or the wait budget elapses, then
//! applies the configured on-timeout policy. The proxy strategy defers the
//! wait to first use through a lazy [`ServiceHandle`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Duration;
use tracing::debug;

use tether_shared::{
    ServiceObject, ServiceRegistry, TetherError, TetherResult, TransformedServiceReference,
};

use crate::config::{DependencyConfig, OnTimeoutPolicy, DEFAULT_TEMPORAL_TIMEOUT_MS};
use crate::dependency::{
    Dependency, DependencyListener, DependencyStateListener, NullDependencyListener,
    NullStateListener,
};

/// The resolved on-timeout behaviour, with the fallback objects attached.
#[derive(Clone)]
pub enum OnTimeout {
    NoPolicy,
    Null,
    Empty,
    Nullable(ServiceObject),
    DefaultImplementation(ServiceObject),
}

impl fmt::Debug for OnTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OnTimeout::NoPolicy => "NoPolicy",
            OnTimeout::Null => "Null",
            OnTimeout::Empty => "Empty",
            OnTimeout::Nullable(_) => "Nullable",
            OnTimeout::DefaultImplementation(_) => "DefaultImplementation",
        };
        write!(f, "OnTimeout::{}", label)
    }
}

/// Forwards bind-side callbacks and wakes waiting getters on every bind.
struct SignallingListener {
    delegate: Arc<dyn DependencyListener>,
    signal: Arc<Notify>,
}

#[async_trait]
impl DependencyListener for SignallingListener {
    async fn on_bind(&self, reference: &TransformedServiceReference, service: ServiceObject) {
        self.delegate.on_bind(reference, service).await;
        self.signal.notify_waiters();
    }

    async fn on_unbind(&self, reference: &TransformedServiceReference) {
        self.delegate.on_unbind(reference).await;
    }

    async fn on_modified(&self, reference: &TransformedServiceReference) {
        self.delegate.on_modified(reference).await;
    }

    async fn on_reconfiguration(
        &self,
        departures: &[TransformedServiceReference],
        arrivals: &[TransformedServiceReference],
    ) {
        self.delegate.on_reconfiguration(departures, arrivals).await;
    }
}

struct TemporalInner {
    dependency: Dependency,
    timeout: Duration,
    on_timeout: OnTimeout,
    optional: bool,
    proxy: bool,
    signal: Arc<Notify>,
}

/// A dependency whose getters suspend the caller up to a timeout.
#[derive(Clone)]
pub struct TemporalDependency {
    inner: Arc<TemporalInner>,
}

impl TemporalDependency {
    /// Builds the temporal dependency from its declarative configuration.
    /// Policies needing a stand-in object (`Nullable`,
    /// `DefaultImplementation`) take it from `fallback`; its absence is a
    /// configuration error, as is `Empty` on a non-aggregate dependency.
    pub fn new(
        config: DependencyConfig,
        registry: ServiceRegistry,
        listener: Arc<dyn DependencyListener>,
        state_listener: Arc<dyn DependencyStateListener>,
        fallback: Option<ServiceObject>,
    ) -> TetherResult<Self> {
        config.validate()?;

        let policy = config.on_timeout.unwrap_or_default();
        let on_timeout = match policy {
            OnTimeoutPolicy::NoPolicy => OnTimeout::NoPolicy,
            OnTimeoutPolicy::Null => OnTimeout::Null,
            OnTimeoutPolicy::Empty => OnTimeout::Empty,
            OnTimeoutPolicy::Nullable => OnTimeout::Nullable(fallback.ok_or_else(|| {
                TetherError::configuration(format!(
                    "dependency {}: Nullable policy requires a stand-in object",
                    config.id()
                ))
            })?),
            OnTimeoutPolicy::DefaultImplementation => {
                OnTimeout::DefaultImplementation(fallback.ok_or_else(|| {
                    TetherError::configuration(format!(
                        "dependency {}: DefaultImplementation policy requires a fallback object",
                        config.id()
                    ))
                })?)
            }
        };

        let timeout =
            Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_TEMPORAL_TIMEOUT_MS));
        let optional = config.optional;
        let proxy = config.proxy;

        let signal = Arc::new(Notify::new());
        let dependency = Dependency::builder(config)
            .with_listener(Arc::new(SignallingListener {
                delegate: listener,
                signal: signal.clone(),
            }))
            .with_state_listener(state_listener)
            .build(registry)?;

        Ok(Self {
            inner: Arc::new(TemporalInner {
                dependency,
                timeout,
                on_timeout,
                optional,
                proxy,
                signal,
            }),
        })
    }

    /// Convenience constructor for a standalone temporal dependency.
    pub fn standalone(
        config: DependencyConfig,
        registry: ServiceRegistry,
        fallback: Option<ServiceObject>,
    ) -> TetherResult<Self> {
        Self::new(
            config,
            registry,
            Arc::new(NullDependencyListener),
            Arc::new(NullStateListener),
            fallback,
        )
    }

    pub fn dependency(&self) -> &Dependency {
        &self.inner.dependency
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_proxy(&self) -> bool {
        self.inner.proxy
    }

    pub async fn start(&self) -> TetherResult<()> {
        self.inner.dependency.start().await
    }

    pub async fn stop(&self) {
        self.inner.dependency.stop().await
    }

    /// Eager (non-proxy) resolution: returns the bound service immediately
    /// when one exists, otherwise suspends up to the timeout and applies
    /// the on-timeout policy. `Ok(None)` is the `Null` outcome.
    pub async fn get(&self) -> TetherResult<Option<ServiceObject>> {
        if let Some(service) = self.inner.dependency.injected_value().await {
            return Ok(Some(service));
        }
        if self.never_waits() {
            debug!(
                "Temporal dependency {} applied its fallback without waiting",
                self.inner.dependency.id()
            );
            return self.expire_single();
        }
        match tokio::time::timeout(self.inner.timeout, self.wait_for_binding()).await {
            Ok(service) => Ok(Some(service)),
            Err(_) => self.expire_single(),
        }
    }

    /// Aggregate resolution. `Ok(None)` is the `Null` outcome; `Empty`
    /// yields `Ok(Some(vec![]))`.
    pub async fn get_all(&self) -> TetherResult<Option<Vec<ServiceObject>>> {
        let bound = self.inner.dependency.injected_values().await;
        if !bound.is_empty() {
            return Ok(Some(bound));
        }
        if self.never_waits() {
            return self.expire_aggregate();
        }
        match tokio::time::timeout(self.inner.timeout, self.wait_for_binding()).await {
            Ok(_) => Ok(Some(self.inner.dependency.injected_values().await)),
            Err(_) => self.expire_aggregate(),
        }
    }

    /// The proxy strategy: returns immediately; the wait happens on the
    /// first `resolve` call and the outcome is memoized.
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            temporal: self.clone(),
            resolved: Arc::new(OnceCell::new()),
        }
    }

    /// An optional dependency with an immediate fallback is valid with zero
    /// providers and must never block the caller.
    fn never_waits(&self) -> bool {
        self.inner.optional && !matches!(self.inner.on_timeout, OnTimeout::NoPolicy)
    }

    async fn wait_for_binding(&self) -> ServiceObject {
        loop {
            let notified = self.inner.signal.notified();
            if let Some(service) = self.inner.dependency.injected_value().await {
                return service;
            }
            notified.await;
        }
    }

    fn expire_single(&self) -> TetherResult<Option<ServiceObject>> {
        match &self.inner.on_timeout {
            OnTimeout::NoPolicy => Err(self.unavailable()),
            OnTimeout::Null | OnTimeout::Empty => Ok(None),
            OnTimeout::Nullable(object) | OnTimeout::DefaultImplementation(object) => {
                Ok(Some(object.clone()))
            }
        }
    }

    fn expire_aggregate(&self) -> TetherResult<Option<Vec<ServiceObject>>> {
        match &self.inner.on_timeout {
            OnTimeout::NoPolicy => Err(self.unavailable()),
            OnTimeout::Null => Ok(None),
            OnTimeout::Empty => Ok(Some(Vec::new())),
            OnTimeout::Nullable(object) | OnTimeout::DefaultImplementation(object) => {
                Ok(Some(vec![object.clone()]))
            }
        }
    }

    fn unavailable(&self) -> TetherError {
        TetherError::unavailable(
            self.inner.dependency.specification(),
            self.inner.timeout.as_millis() as u64,
        )
    }
}

/// Lazy handle over a temporal dependency: the thunk the weaver injects for
/// proxy-mode fields. The wait is deferred until the first `resolve`.
#[derive(Clone)]
pub struct ServiceHandle {
    temporal: TemporalDependency,
    resolved: Arc<OnceCell<Option<ServiceObject>>>,
}

impl ServiceHandle {
    pub async fn resolve(&self) -> TetherResult<Option<ServiceObject>> {
        let value = self
            .resolved
            .get_or_try_init(|| async { self.temporal.get().await })
            .await?;
        Ok(value.clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.initialized()
    }
}
