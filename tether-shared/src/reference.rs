use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exception::{TetherError, TetherResult};

/// Property key carrying the registry-assigned service id.
pub const SERVICE_ID: &str = "service.id";
/// Property key carrying the persistent identifier of the provider.
pub const SERVICE_PID: &str = "service.pid";
/// Property key carrying the name of the component instance providing the service.
pub const INSTANCE_NAME: &str = "instance.name";
/// Property key carrying the integer ranking used to order providers.
pub const SERVICE_RANKING: &str = "service.ranking";

/// Keys that tracking interceptors are not allowed to alter.
pub const FORBIDDEN_KEYS: [&str; 3] = [SERVICE_ID, SERVICE_PID, INSTANCE_NAME];

/// Service property map. Values are JSON values so providers can publish
/// strings, numbers, booleans or lists without a dedicated type per key.
pub type ServiceProperties = HashMap<String, serde_json::Value>;

/// Registry-assigned identity of a service. Immutable for the lifetime of
/// the registration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle on one candidate provider as published by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReference {
    id: ServiceId,
    specification: String,
    properties: ServiceProperties,
}

impl ServiceReference {
    pub fn new(id: ServiceId, specification: impl Into<String>, properties: ServiceProperties) -> Self {
        Self {
            id,
            specification: specification.into(),
            properties,
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn specification(&self) -> &str {
        &self.specification
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &ServiceProperties {
        &self.properties
    }

    /// The provider ranking, 0 when absent or not an integer.
    pub fn ranking(&self) -> i64 {
        self.properties
            .get(SERVICE_RANKING)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceReference {}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.specification, self.id)
    }
}

/// A transformed view of a [`ServiceReference`] produced by tracking
/// interceptors. The underlying registry entry is never mutated; transforms
/// accumulate in an overlay that shadows (or hides) base properties.
#[derive(Debug, Clone)]
pub struct TransformedServiceReference {
    base: ServiceReference,
    overlay: ServiceProperties,
    hidden: HashSet<String>,
}

impl TransformedServiceReference {
    pub fn new(base: ServiceReference) -> Self {
        Self {
            base,
            overlay: ServiceProperties::new(),
            hidden: HashSet::new(),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.base.id()
    }

    pub fn specification(&self) -> &str {
        self.base.specification()
    }

    pub fn base(&self) -> &ServiceReference {
        &self.base
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        if self.hidden.contains(key) {
            return None;
        }
        self.overlay.get(key).or_else(|| self.base.property(key))
    }

    /// The effective property view: base properties with the overlay applied.
    pub fn properties(&self) -> ServiceProperties {
        let mut merged = self.base.properties().clone();
        for key in &self.hidden {
            merged.remove(key);
        }
        for (key, value) in &self.overlay {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn ranking(&self) -> i64 {
        self.property(SERVICE_RANKING)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// Adds or replaces a property in the transformed view.
    /// Identity keys cannot be altered.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> TetherResult<Self> {
        let key = key.into();
        Self::check_key(&key)?;
        self.hidden.remove(&key);
        self.overlay.insert(key, value);
        Ok(self)
    }

    /// Hides a property from the transformed view.
    /// Identity keys cannot be removed.
    pub fn without_property(mut self, key: &str) -> TetherResult<Self> {
        Self::check_key(key)?;
        self.overlay.remove(key);
        self.hidden.insert(key.to_string());
        Ok(self)
    }

    /// True when the two views expose the same effective properties.
    pub fn same_properties(&self, other: &TransformedServiceReference) -> bool {
        self.properties() == other.properties()
    }

    fn check_key(key: &str) -> TetherResult<()> {
        if FORBIDDEN_KEYS.contains(&key) {
            return Err(TetherError::configuration(format!(
                "property '{}' cannot be transformed by an interceptor",
                key
            )));
        }
        Ok(())
    }
}

impl PartialEq for TransformedServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TransformedServiceReference {}

impl fmt::Display for TransformedServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.specification(), self.id())
    }
}

/// The default provider order: higher ranking first, registration order
/// (lower id) breaking ties.
pub fn ranking_order(a: &TransformedServiceReference, b: &TransformedServiceReference) -> Ordering {
    b.ranking()
        .cmp(&a.ranking())
        .then_with(|| a.id().cmp(&b.id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(id: u64, ranking: i64) -> ServiceReference {
        let mut props = ServiceProperties::new();
        props.insert(SERVICE_RANKING.to_string(), json!(ranking));
        props.insert("vendor".to_string(), json!("acme"));
        ServiceReference::new(ServiceId(id), "log.LogService", props)
    }

    #[test]
    fn test_reference_identity() {
        let a = reference(1, 0);
        let mut props = ServiceProperties::new();
        props.insert("vendor".to_string(), json!("other"));
        let b = ServiceReference::new(ServiceId(1), "log.LogService", props);
        // Identity is the registry-assigned id, not the property map.
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "log.LogService:1");
    }

    #[test]
    fn test_ranking_defaults_to_zero() {
        let reference = ServiceReference::new(ServiceId(3), "spec", ServiceProperties::new());
        assert_eq!(reference.ranking(), 0);

        let mut props = ServiceProperties::new();
        props.insert(SERVICE_RANKING.to_string(), json!("not-a-number"));
        let reference = ServiceReference::new(ServiceId(4), "spec", props);
        assert_eq!(reference.ranking(), 0);
    }

    #[test]
    fn test_transformed_overlay_shadows_base() {
        let transformed = TransformedServiceReference::new(reference(1, 5))
            .with_property("vendor", json!("overlay"))
            .unwrap();

        assert_eq!(transformed.property("vendor"), Some(&json!("overlay")));
        // The base entry is untouched.
        assert_eq!(transformed.base().property("vendor"), Some(&json!("acme")));
        assert_eq!(transformed.ranking(), 5);
    }

    #[test]
    fn test_transformed_hides_property() {
        let transformed = TransformedServiceReference::new(reference(1, 5))
            .without_property("vendor")
            .unwrap();
        assert_eq!(transformed.property("vendor"), None);
        assert!(!transformed.properties().contains_key("vendor"));
    }

    #[test]
    fn test_forbidden_keys_rejected() {
        for key in FORBIDDEN_KEYS {
            let result =
                TransformedServiceReference::new(reference(1, 0)).with_property(key, json!("x"));
            assert!(result.is_err(), "key {} should be rejected", key);
            let result = TransformedServiceReference::new(reference(1, 0)).without_property(key);
            assert!(result.is_err(), "key {} should be rejected", key);
        }
    }

    #[test]
    fn test_ranking_order() {
        let low = TransformedServiceReference::new(reference(1, 0));
        let high = TransformedServiceReference::new(reference(2, 10));
        let tied = TransformedServiceReference::new(reference(3, 10));

        assert_eq!(ranking_order(&high, &low), Ordering::Less);
        assert_eq!(ranking_order(&low, &high), Ordering::Greater);
        // Equal rank: the earlier registration sorts first.
        assert_eq!(ranking_order(&high, &tied), Ordering::Less);
    }

    #[test]
    fn test_same_properties() {
        let a = TransformedServiceReference::new(reference(1, 5));
        let b = TransformedServiceReference::new(reference(1, 5))
            .with_property("extra", json!(true))
            .unwrap();
        assert!(!a.same_properties(&b));
        assert!(a.same_properties(&TransformedServiceReference::new(reference(1, 5))));
    }
}
