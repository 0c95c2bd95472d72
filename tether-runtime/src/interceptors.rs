//! The three interceptor capability chains a dependency can carry.
//!
//! Tracking interceptors filter and transform raw registry candidates into
//! the matching set; the ranking interceptor orders the matching set into
//! the selected set; binding interceptors wrap and unwrap the service
//! object itself around bind and unbind.

use std::cmp::Ordering;
use std::sync::Arc;

use tether_shared::reference::ranking_order;
use tether_shared::{Filter, ServiceObject, TetherResult, TransformedServiceReference};

/// Pairwise provider order. `Ordering::Less` means "sorts first", i.e. the
/// better candidate.
pub type ServiceComparator =
    Arc<dyn Fn(&TransformedServiceReference, &TransformedServiceReference) -> Ordering + Send + Sync>;

/// The default order: higher `service.ranking` first, registration order
/// breaking ties.
pub fn default_comparator() -> ServiceComparator {
    Arc::new(ranking_order)
}

/// Filters raw registry candidates into the matching set.
///
/// Returning `Ok(None)` rejects the candidate; returning a transformed
/// reference replaces the accumulator for the rest of the chain. An `Err`
/// makes the triggering registry event a no-op for the dependency.
pub trait TrackingInterceptor: Send + Sync {
    fn accept(
        &self,
        dependency: &str,
        reference: TransformedServiceReference,
    ) -> TetherResult<Option<TransformedServiceReference>>;
}

/// Orders the matching set into the selected set. Exactly one ranking
/// interceptor is active per dependency at a time.
pub trait RankingInterceptor: Send + Sync {
    fn rank(
        &self,
        dependency: &str,
        matching: &[TransformedServiceReference],
    ) -> TetherResult<Vec<TransformedServiceReference>>;

    fn on_arrival(
        &self,
        dependency: &str,
        matching: &[TransformedServiceReference],
        _arrival: &TransformedServiceReference,
    ) -> TetherResult<Vec<TransformedServiceReference>> {
        self.rank(dependency, matching)
    }

    fn on_departure(
        &self,
        dependency: &str,
        matching: &[TransformedServiceReference],
        _departure: &TransformedServiceReference,
    ) -> TetherResult<Vec<TransformedServiceReference>> {
        self.rank(dependency, matching)
    }

    fn on_modified(
        &self,
        dependency: &str,
        matching: &[TransformedServiceReference],
        _modified: &TransformedServiceReference,
    ) -> TetherResult<Vec<TransformedServiceReference>> {
        self.rank(dependency, matching)
    }
}

/// Wraps the service object at bind time and unwinds at unbind time.
///
/// For a chain `[A, B]` the bound object is `A.wrap(B.wrap(service))`; the
/// unbind path calls `B.unwrap` then `A.unwrap`.
pub trait BindingInterceptor: Send + Sync {
    fn wrap(
        &self,
        reference: &TransformedServiceReference,
        service: ServiceObject,
    ) -> TetherResult<ServiceObject>;

    fn unwrap(&self, reference: &TransformedServiceReference) -> TetherResult<()> {
        let _ = reference;
        Ok(())
    }
}

/// The filter-backed tracking interceptor. It is always the LAST element of
/// the tracking chain: user interceptors may transform properties first,
/// and the chain ends on the filter match.
pub struct FilterTrackingInterceptor {
    filter: Option<Filter>,
}

impl FilterTrackingInterceptor {
    pub fn new(filter: Option<Filter>) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }
}

impl TrackingInterceptor for FilterTrackingInterceptor {
    fn accept(
        &self,
        _dependency: &str,
        reference: TransformedServiceReference,
    ) -> TetherResult<Option<TransformedServiceReference>> {
        match &self.filter {
            Some(filter) if !filter.matches(&reference.properties()) => Ok(None),
            _ => Ok(Some(reference)),
        }
    }
}

/// Ranking by a pairwise comparator (stable sort, so equal candidates keep
/// their matching-set order).
pub struct ComparatorRankingInterceptor {
    comparator: ServiceComparator,
}

impl ComparatorRankingInterceptor {
    pub fn new(comparator: ServiceComparator) -> Self {
        Self { comparator }
    }
}

impl RankingInterceptor for ComparatorRankingInterceptor {
    fn rank(
        &self,
        _dependency: &str,
        matching: &[TransformedServiceReference],
    ) -> TetherResult<Vec<TransformedServiceReference>> {
        let mut ranked = matching.to_vec();
        ranked.sort_by(|a, b| (self.comparator)(a, b));
        Ok(ranked)
    }
}
