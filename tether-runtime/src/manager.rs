//! Transformation pipeline between the raw registry view and the selected
//! service set of one dependency.
//!
//! The manager owns three sets with the standing invariant
//! `selected ⊆ matching ⊆ tracked`. Every mutation is computed on the side
//! and committed atomically, so a failing interceptor leaves the sets
//! exactly as they were (the triggering event becomes a no-op).

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use tether_shared::{
    Filter, ServiceObject, ServiceReference, TetherResult, TransformedServiceReference,
};

use crate::interceptors::{
    default_comparator, BindingInterceptor, ComparatorRankingInterceptor,
    FilterTrackingInterceptor, RankingInterceptor, ServiceComparator, TrackingInterceptor,
};

/// The delta produced by one mutation of the matching/selected sets.
#[derive(Clone, Default)]
pub(crate) struct ChangeSet {
    pub selected: Vec<TransformedServiceReference>,
    pub arrivals: Vec<TransformedServiceReference>,
    pub departures: Vec<TransformedServiceReference>,
    pub modified: Option<TransformedServiceReference>,
}

pub(crate) struct ReferenceManager {
    dependency_id: String,
    tracked: Vec<ServiceReference>,
    matching: Vec<TransformedServiceReference>,
    selected: Vec<TransformedServiceReference>,
    tracking: Vec<Arc<dyn TrackingInterceptor>>,
    /// Evaluated after every user interceptor; the chain ends on the filter.
    filter: FilterTrackingInterceptor,
    ranking: Arc<dyn RankingInterceptor>,
    binding: Vec<Arc<dyn BindingInterceptor>>,
    comparator: ServiceComparator,
}

impl ReferenceManager {
    pub fn new(
        dependency_id: String,
        filter: Option<Filter>,
        comparator: Option<ServiceComparator>,
    ) -> Self {
        let comparator = comparator.unwrap_or_else(default_comparator);
        Self {
            dependency_id,
            tracked: Vec::new(),
            matching: Vec::new(),
            selected: Vec::new(),
            tracking: Vec::new(),
            filter: FilterTrackingInterceptor::new(filter),
            ranking: Arc::new(ComparatorRankingInterceptor::new(comparator.clone())),
            binding: Vec::new(),
            comparator,
        }
    }

    pub fn matching(&self) -> &[TransformedServiceReference] {
        &self.matching
    }

    pub fn selected(&self) -> &[TransformedServiceReference] {
        &self.selected
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Pairwise order used for rebind decisions (dynamic-priority).
    pub fn compare(
        &self,
        a: &TransformedServiceReference,
        b: &TransformedServiceReference,
    ) -> Ordering {
        (self.comparator)(a, b)
    }

    /// Runs the tracking chain over a candidate. `Ok(None)` means rejected.
    fn accept(
        &self,
        reference: &ServiceReference,
    ) -> TetherResult<Option<TransformedServiceReference>> {
        let mut accumulator = TransformedServiceReference::new(reference.clone());
        for interceptor in &self.tracking {
            match interceptor.accept(&self.dependency_id, accumulator)? {
                Some(next) => accumulator = next,
                None => return Ok(None),
            }
        }
        self.filter.accept(&self.dependency_id, accumulator)
    }

    pub fn on_arrival(
        &mut self,
        reference: ServiceReference,
    ) -> TetherResult<Option<ChangeSet>> {
        if self.tracked.iter().any(|r| r.id() == reference.id()) {
            return Ok(None);
        }
        // The tracked set is the raw pre-interceptor registry view; it is
        // updated even when the chain errors out below.
        self.tracked.push(reference.clone());

        let accepted = self.accept(&reference)?;
        let Some(transformed) = accepted else {
            debug!(
                "Service {} rejected by tracking chain of dependency {}",
                reference, self.dependency_id
            );
            return Ok(None);
        };

        let mut next_matching = self.matching.clone();
        next_matching.push(transformed.clone());
        let ranked = self
            .ranking
            .on_arrival(&self.dependency_id, &next_matching, &transformed)?;

        self.matching = next_matching;
        Ok(Some(self.commit_selected(ranked, None)))
    }

    pub fn on_departure(
        &mut self,
        reference: &ServiceReference,
    ) -> TetherResult<Option<ChangeSet>> {
        let Some(tracked_idx) = self.tracked.iter().position(|r| r.id() == reference.id()) else {
            return Ok(None);
        };
        self.tracked.remove(tracked_idx);

        let Some(matching_idx) = self.matching.iter().position(|m| m.id() == reference.id())
        else {
            return Ok(None);
        };

        let departing = self.matching[matching_idx].clone();
        let mut next_matching = self.matching.clone();
        next_matching.remove(matching_idx);
        // A gone service must leave the sets even if the ranking interceptor
        // errors; fall back to the previous selection minus the departed.
        let ranked = match self
            .ranking
            .on_departure(&self.dependency_id, &next_matching, &departing)
        {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(
                    "Ranking interceptor failed on departure for dependency {}: {}",
                    self.dependency_id, e
                );
                self.selected
                    .iter()
                    .filter(|s| **s != departing)
                    .cloned()
                    .collect()
            }
        };

        self.matching = next_matching;
        Ok(Some(self.commit_selected(ranked, None)))
    }

    /// A modification is a departure when the service stops matching, an
    /// arrival when it starts matching, and a modified event when it keeps
    /// matching with different properties.
    pub fn on_modified(
        &mut self,
        reference: &ServiceReference,
    ) -> TetherResult<Option<ChangeSet>> {
        let Some(tracked_idx) = self.tracked.iter().position(|r| r.id() == reference.id()) else {
            // Unknown to this dependency: treat as an arrival.
            return self.on_arrival(reference.clone());
        };
        self.tracked[tracked_idx] = reference.clone();

        let accepted = self.accept(reference)?;
        let matching_idx = self.matching.iter().position(|m| m.id() == reference.id());

        match (matching_idx, accepted) {
            (Some(idx), None) => {
                // Was matching, no longer accepted.
                let departing = self.matching[idx].clone();
                let mut next_matching = self.matching.clone();
                next_matching.remove(idx);
                let ranked =
                    self.ranking
                        .on_departure(&self.dependency_id, &next_matching, &departing)?;
                self.matching = next_matching;
                Ok(Some(self.commit_selected(ranked, None)))
            }
            (Some(idx), Some(transformed)) => {
                if self.matching[idx].same_properties(&transformed) {
                    return Ok(None);
                }
                let mut next_matching = self.matching.clone();
                next_matching[idx] = transformed.clone();
                let ranked =
                    self.ranking
                        .on_modified(&self.dependency_id, &next_matching, &transformed)?;
                self.matching = next_matching;
                Ok(Some(self.commit_selected(ranked, Some(transformed))))
            }
            (None, Some(transformed)) => {
                // Started matching.
                let mut next_matching = self.matching.clone();
                next_matching.push(transformed.clone());
                let ranked =
                    self.ranking
                        .on_arrival(&self.dependency_id, &next_matching, &transformed)?;
                self.matching = next_matching;
                Ok(Some(self.commit_selected(ranked, None)))
            }
            (None, None) => Ok(None),
        }
    }

    pub fn add_tracking_interceptor(
        &mut self,
        interceptor: Arc<dyn TrackingInterceptor>,
    ) -> TetherResult<ChangeSet> {
        // New interceptors go to the front; the filter stays last.
        self.tracking.insert(0, interceptor);
        self.recompute_matching()
    }

    pub fn remove_tracking_interceptor(
        &mut self,
        interceptor: &Arc<dyn TrackingInterceptor>,
    ) -> TetherResult<ChangeSet> {
        self.tracking.retain(|i| !Arc::ptr_eq(i, interceptor));
        self.recompute_matching()
    }

    pub fn set_filter(&mut self, filter: Option<Filter>) -> TetherResult<ChangeSet> {
        self.filter = FilterTrackingInterceptor::new(filter);
        self.recompute_matching()
    }

    pub fn set_ranking_interceptor(
        &mut self,
        interceptor: Arc<dyn RankingInterceptor>,
    ) -> TetherResult<ChangeSet> {
        self.ranking = interceptor;
        let ranked = if self.matching.is_empty() {
            Vec::new()
        } else {
            self.ranking.rank(&self.dependency_id, &self.matching)?
        };
        Ok(self.commit_selected(ranked, None))
    }

    pub fn set_comparator(&mut self, comparator: ServiceComparator) -> TetherResult<ChangeSet> {
        self.comparator = comparator.clone();
        self.set_ranking_interceptor(Arc::new(ComparatorRankingInterceptor::new(comparator)))
    }

    pub fn add_binding_interceptor(&mut self, interceptor: Arc<dyn BindingInterceptor>) {
        // Existing bindings are not rewrapped; the chain applies from the
        // next bind on.
        self.binding.push(interceptor);
    }

    pub fn remove_binding_interceptor(&mut self, interceptor: &Arc<dyn BindingInterceptor>) {
        self.binding.retain(|i| !Arc::ptr_eq(i, interceptor));
    }

    /// Wraps a service object through the binding chain: the FIRST
    /// interceptor becomes the outermost wrapper, `A.wrap(B.wrap(svc))`.
    pub fn wrap(
        &self,
        reference: &TransformedServiceReference,
        service: ServiceObject,
    ) -> TetherResult<ServiceObject> {
        let mut wrapped = service;
        for interceptor in self.binding.iter().rev() {
            wrapped = interceptor.wrap(reference, wrapped)?;
        }
        Ok(wrapped)
    }

    /// Unwinds the binding chain, last-in-chain first (`B.unwrap` then
    /// `A.unwrap` for a chain `[A, B]`). All interceptors are unwound even
    /// if one fails; the first error is reported.
    pub fn unwrap(&self, reference: &TransformedServiceReference) -> TetherResult<()> {
        let mut first_error = None;
        for interceptor in self.binding.iter().rev() {
            if let Err(e) = interceptor.unwrap(reference) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Re-runs the tracking chain over every tracked service, then re-ranks.
    fn recompute_matching(&mut self) -> TetherResult<ChangeSet> {
        let mut next_matching = Vec::new();
        for reference in &self.tracked {
            if let Some(transformed) = self.accept(reference)? {
                next_matching.push(transformed);
            }
        }
        let ranked = if next_matching.is_empty() {
            Vec::new()
        } else {
            self.ranking.rank(&self.dependency_id, &next_matching)?
        };
        self.matching = next_matching;
        Ok(self.commit_selected(ranked, None))
    }

    /// Installs a new selected set (clamped to the matching set) and
    /// reports the delta against the previous selection.
    fn commit_selected(
        &mut self,
        mut ranked: Vec<TransformedServiceReference>,
        modified: Option<TransformedServiceReference>,
    ) -> ChangeSet {
        ranked.retain(|r| self.matching.contains(r));
        let before = std::mem::replace(&mut self.selected, ranked);

        let departures = before
            .iter()
            .filter(|old| !self.selected.contains(old))
            .cloned()
            .collect::<Vec<_>>();
        let arrivals = self
            .selected
            .iter()
            .filter(|new| !before.contains(new))
            .cloned()
            .collect::<Vec<_>>();

        ChangeSet {
            selected: self.selected.clone(),
            arrivals,
            departures,
            modified,
        }
    }

    /// Drops every set. Used when the dependency stops tracking.
    pub fn clear(&mut self) {
        self.tracked.clear();
        self.matching.clear();
        self.selected.clear();
    }
}
