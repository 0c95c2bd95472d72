//! Mock service implementations for tests across the workspace.
//!
//! These are plain objects published as service payloads; tests downcast
//! them back out of the registry to assert on call counts and identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A service object with an identity and a call counter.
#[derive(Debug)]
pub struct MockService {
    name: String,
    calls: AtomicU64,
}

impl MockService {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            calls: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulates a service method call.
    pub fn ping(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A no-op stand-in suitable as a nullable/default fallback object.
#[derive(Debug, Default)]
pub struct NoopService;

impl NoopService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    pub fn ping(&self) -> u64 {
        0
    }
}

/// Serializable snapshot of a mock provider, handy as a property payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockProviderInfo {
    pub name: String,
    pub vendor: String,
    pub ranking: i64,
}

impl MockProviderInfo {
    pub fn new(name: impl Into<String>, vendor: impl Into<String>, ranking: i64) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            ranking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_service_counts_calls() {
        let service = MockService::new("logger");
        assert_eq!(service.call_count(), 0);
        assert_eq!(service.ping(), 1);
        assert_eq!(service.ping(), 2);
        assert_eq!(service.call_count(), 2);
        assert_eq!(service.name(), "logger");
    }

    #[test]
    fn test_noop_service_is_inert() {
        let service = NoopService::new();
        assert_eq!(service.ping(), 0);
    }

    #[test]
    fn test_provider_info_round_trip() {
        let info = MockProviderInfo::new("p1", "acme", 5);
        let json = serde_json::to_string(&info).unwrap();
        let back: MockProviderInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
