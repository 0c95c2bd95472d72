pub mod config;
pub mod dependency;
pub mod instance;
pub mod interceptors;
mod manager;
pub mod temporal;

pub use config::{DependencyConfig, OnTimeoutPolicy, DEFAULT_TEMPORAL_TIMEOUT_MS};
pub use dependency::{
    BindingPolicy, Dependency, DependencyBuilder, DependencyListener, DependencyState,
    DependencyStateListener, NullDependencyListener, NullStateListener,
};
pub use instance::{
    ComponentInstance, DependencyHandler, Handler, InstanceState, InstanceStateListener,
    InstanceValidityListener,
};
pub use interceptors::{
    default_comparator, BindingInterceptor, ComparatorRankingInterceptor,
    FilterTrackingInterceptor, RankingInterceptor, ServiceComparator, TrackingInterceptor,
};
pub use temporal::{OnTimeout, ServiceHandle, TemporalDependency};
