//! Declarative dependency configuration.
//!
//! Malformed combinations are rejected here, at configure time; a
//! dependency that fails validation never starts tracking.

use serde::{Deserialize, Serialize};

use tether_shared::{Filter, TetherError, TetherResult, INSTANCE_NAME};

use crate::dependency::BindingPolicy;

/// Default wait budget for temporal dependencies.
pub const DEFAULT_TEMPORAL_TIMEOUT_MS: u64 = 3000;

/// What a temporal dependency injects when the wait expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnTimeoutPolicy {
    /// Raise a service-unavailable error at the point of use.
    #[default]
    NoPolicy,
    /// Inject nothing.
    Null,
    /// Inject an empty collection. Aggregate dependencies only.
    Empty,
    /// Inject the configured no-op stand-in.
    Nullable,
    /// Inject the configured fallback implementation.
    DefaultImplementation,
}

/// One declared requirement of a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// The required service specification (interface name).
    pub specification: String,
    /// Woven field this dependency injects into, if any.
    pub field: Option<String>,
    /// LDAP filter narrowing the candidate providers.
    pub filter: Option<String>,
    pub optional: bool,
    pub aggregate: bool,
    pub policy: BindingPolicy,
    /// Defer the temporal wait to first use instead of injection time.
    pub proxy: bool,
    /// Temporal wait budget in milliseconds; `None` selects the default.
    pub timeout_ms: Option<u64>,
    pub on_timeout: Option<OnTimeoutPolicy>,
    /// Pin the dependency to the provider published by a named instance.
    pub from: Option<String>,
    /// Dependency id; the specification name when absent.
    pub id: Option<String>,
}

impl DependencyConfig {
    pub fn new(specification: impl Into<String>) -> Self {
        Self {
            specification: specification.into(),
            field: None,
            filter: None,
            optional: false,
            aggregate: false,
            policy: BindingPolicy::default(),
            proxy: false,
            timeout_ms: None,
            on_timeout: None,
            from: None,
            id: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    pub fn with_policy(mut self, policy: BindingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn proxy(mut self) -> Self {
        self.proxy = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_on_timeout(mut self, policy: OnTimeoutPolicy) -> Self {
        self.on_timeout = Some(policy);
        self
    }

    pub fn with_from(mut self, instance_name: impl Into<String>) -> Self {
        self.from = Some(instance_name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The dependency id: explicit id, or the specification name.
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.specification)
    }

    /// The filter actually applied to candidates: the declared filter,
    /// narrowed to the `from` instance when one is pinned.
    pub fn effective_filter(&self) -> TetherResult<Option<Filter>> {
        let filter = match (&self.filter, &self.from) {
            (None, None) => return Ok(None),
            (Some(filter), None) => Filter::parse(filter)?,
            (None, Some(from)) => Filter::parse(&format!("({}={})", INSTANCE_NAME, from))?,
            (Some(filter), Some(from)) => {
                Filter::parse(&format!("(&{}({}={}))", filter, INSTANCE_NAME, from))?
            }
        };
        Ok(Some(filter))
    }

    pub fn validate(&self) -> TetherResult<()> {
        if self.specification.trim().is_empty() {
            return Err(TetherError::configuration(
                "dependency requires a non-empty specification",
            ));
        }
        self.effective_filter()?;
        if self.on_timeout == Some(OnTimeoutPolicy::Empty) && !self.aggregate {
            return Err(TetherError::configuration(format!(
                "dependency {}: Empty on-timeout policy requires an aggregate dependency",
                self.id()
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(TetherError::configuration(format!(
                "dependency {}: timeout must be positive",
                self.id()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_shared::ServiceProperties;

    #[test]
    fn test_defaults() {
        let config = DependencyConfig::new("log.LogService");
        assert_eq!(config.id(), "log.LogService");
        assert_eq!(config.policy, BindingPolicy::Dynamic);
        assert!(!config.optional);
        assert!(!config.aggregate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_id_wins() {
        let config = DependencyConfig::new("log.LogService").with_id("primary-log");
        assert_eq!(config.id(), "primary-log");
    }

    #[test]
    fn test_empty_policy_requires_aggregate() {
        let config = DependencyConfig::new("log.LogService").with_on_timeout(OnTimeoutPolicy::Empty);
        assert!(matches!(
            config.validate(),
            Err(TetherError::ConfigurationError(_))
        ));

        let config = DependencyConfig::new("log.LogService")
            .aggregate()
            .with_on_timeout(OnTimeoutPolicy::Empty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_filter_fails_fast() {
        let config = DependencyConfig::new("log.LogService").with_filter("(vendor=");
        assert!(matches!(
            config.validate(),
            Err(TetherError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = DependencyConfig::new("log.LogService").with_timeout_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_specification_rejected() {
        let config = DependencyConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_narrows_filter() {
        let config = DependencyConfig::new("log.LogService")
            .with_filter("(vendor=acme)")
            .with_from("primary-logger");
        let filter = config.effective_filter().unwrap().unwrap();

        let mut props = ServiceProperties::new();
        props.insert("vendor".to_string(), json!("acme"));
        props.insert(INSTANCE_NAME.to_string(), json!("primary-logger"));
        assert!(filter.matches(&props));

        props.insert(INSTANCE_NAME.to_string(), json!("other"));
        assert!(!filter.matches(&props));
    }
}
