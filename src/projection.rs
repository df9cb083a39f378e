//! Multi-tag projections and their safe/unsafe dual state.
//!
//! A [`MultiProjector`] folds events from many tags into one payload. The
//! [`DualState`] wrapper keeps two copies of it: an *unsafe* copy that sees
//! every event as soon as it arrives, and a *safe* copy that only sees events
//! older than the safe-window threshold. Newer events wait in an ordered
//! buffer and are promoted once the threshold passes them.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;
use crate::sortable_id::SortableUniqueId;

/// A read model built from events across many tags.
///
/// The implementing type itself is the projected payload.
///
/// # Contract
///
/// - [`project`](MultiProjector::project) must be deterministic: the same
///   event sequence must always produce the same payload.
/// - Unknown event types should be ignored.
/// - Bump [`VERSION`](MultiProjector::VERSION) whenever the folding logic
///   changes; snapshots recorded under another version are discarded.
pub trait MultiProjector:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Projector name, used as the actor key and the snapshot scope.
    const NAME: &'static str;

    /// Version of the folding logic.
    const VERSION: &'static str;

    /// Apply one event.
    fn project(&mut self, event: &Event);
}

/// A projected payload with its position bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: DeserializeOwned"))]
pub struct ProjectedView<P> {
    /// The projected payload.
    pub payload: P,
    /// Number of events applied.
    pub version: u64,
    /// Position of the last applied event.
    pub last_sortable_unique_id: SortableUniqueId,
    /// Id of the last applied event.
    pub last_event_id: Option<Uuid>,
}

impl<P: MultiProjector> Default for ProjectedView<P> {
    fn default() -> Self {
        Self {
            payload: P::default(),
            version: 0,
            last_sortable_unique_id: SortableUniqueId::default(),
            last_event_id: None,
        }
    }
}

impl<P: MultiProjector> ProjectedView<P> {
    fn apply(&mut self, event: &Event) {
        self.payload.project(event);
        self.version += 1;
        if event.sortable_unique_id > self.last_sortable_unique_id {
            self.last_sortable_unique_id = event.sortable_unique_id.clone();
            self.last_event_id = Some(event.id);
        }
    }
}

/// A read-only view of a multi projection returned to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiProjectionState<P> {
    /// The projected payload.
    pub payload: P,
    /// Projector name.
    pub projector_name: String,
    /// Projector version.
    pub projector_version: String,
    /// Position of the last applied event.
    pub last_sortable_unique_id: SortableUniqueId,
    /// Id of the last applied event.
    pub last_event_id: Option<Uuid>,
    /// Number of events applied.
    pub version: u64,
    /// Catch-up is complete and the actor is live.
    pub is_caught_up: bool,
    /// No applied event is still inside the safe window.
    pub is_safe_state: bool,
}

/// FIFO-bounded set of event ids.
///
/// Once `capacity` ids are held, inserting evicts the oldest.
#[derive(Debug, Clone)]
pub struct ProcessedIdCache {
    capacity: usize,
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl ProcessedIdCache {
    /// Create an empty cache holding at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    /// Returns `true` if `id` is held.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Number of ids held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if no id is held.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Safe and unsafe copies of one projection plus the buffer between them.
#[derive(Debug, Clone)]
pub struct DualState<P> {
    safe: ProjectedView<P>,
    unsafe_view: ProjectedView<P>,
    buffer: BTreeMap<(SortableUniqueId, Uuid), Event>,
    seen: ProcessedIdCache,
}

impl<P: MultiProjector> DualState<P> {
    /// Empty projection deduplicating over the last `capacity` event ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            safe: ProjectedView::default(),
            unsafe_view: ProjectedView::default(),
            buffer: BTreeMap::new(),
            seen: ProcessedIdCache::new(capacity),
        }
    }

    /// Resume from a safe snapshot. Both copies start from `view`.
    pub fn from_safe(view: ProjectedView<P>, capacity: usize) -> Self {
        let mut seen = ProcessedIdCache::new(capacity);
        if let Some(id) = view.last_event_id {
            seen.insert(id);
        }
        Self {
            unsafe_view: view.clone(),
            safe: view,
            buffer: BTreeMap::new(),
            seen,
        }
    }

    /// Fold one event. Returns `false` if the event was already seen.
    ///
    /// Events later than `threshold` reach the unsafe copy immediately but
    /// wait in the buffer before reaching the safe copy.
    pub fn process(&mut self, event: &Event, threshold: &SortableUniqueId) -> bool {
        if !self.seen.insert(event.id) {
            return false;
        }
        self.unsafe_view.apply(event);
        if event.sortable_unique_id > *threshold {
            self.buffer.insert(
                (event.sortable_unique_id.clone(), event.id),
                event.clone(),
            );
        } else {
            if event.sortable_unique_id < self.safe.last_sortable_unique_id {
                tracing::debug!(
                    event_id = %event.id,
                    position = %event.sortable_unique_id,
                    "event older than safe position applied out of order"
                );
            }
            self.safe.apply(event);
        }
        true
    }

    /// Move buffered events at or before `threshold` into the safe copy,
    /// in position order. Returns how many were promoted.
    pub fn promote(&mut self, threshold: &SortableUniqueId) -> usize {
        let ready: Vec<(SortableUniqueId, Uuid)> = self
            .buffer
            .keys()
            .take_while(|(position, _)| position <= threshold)
            .cloned()
            .collect();
        for key in &ready {
            if let Some(event) = self.buffer.remove(key) {
                self.safe.apply(&event);
            }
        }
        ready.len()
    }

    /// Returns `true` if `id` has been processed recently.
    pub fn has_seen(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    /// The copy that only includes events outside the safe window.
    pub fn safe(&self) -> &ProjectedView<P> {
        &self.safe
    }

    /// The copy that includes every processed event.
    pub fn unsafe_view(&self) -> &ProjectedView<P> {
        &self.unsafe_view
    }

    /// Number of events waiting to become safe.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::event::test_fixtures::EnrollmentEvent;
    use std::collections::BTreeSet;

    /// Counts events and distinct students across all tags.
    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EnrollmentStats {
        pub events: u64,
        pub students: BTreeSet<String>,
        pub enrollments: u64,
    }

    impl MultiProjector for EnrollmentStats {
        const NAME: &'static str = "EnrollmentStats";
        const VERSION: &'static str = "1";

        fn project(&mut self, event: &Event) {
            self.events += 1;
            match event.decode::<EnrollmentEvent>() {
                Some(EnrollmentEvent::StudentCreated { student_id, .. }) => {
                    self.students.insert(student_id);
                }
                Some(EnrollmentEvent::StudentEnrolled { .. }) => self.enrollments += 1,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::EnrollmentStats;
    use super::*;
    use crate::event::test_fixtures::*;
    use chrono::{Duration, Utc};

    #[test]
    fn processed_id_cache_evicts_oldest() {
        let mut cache = ProcessedIdCache::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(cache.insert(a));
        assert!(!cache.insert(a));
        assert!(cache.insert(b));
        assert!(cache.insert(c));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b) && cache.contains(&c));
    }

    #[test]
    fn same_event_twice_applies_once() {
        let mut state = DualState::<EnrollmentStats>::new(100);
        let threshold = SortableUniqueId::safe_threshold(Utc::now());
        let event = event_at(Utc::now() - Duration::minutes(1), &created("s1"), &[]);

        assert!(state.process(&event, &threshold));
        assert!(!state.process(&event, &threshold));
        assert_eq!(state.safe().version, 1);
        assert_eq!(state.unsafe_view().version, 1);
        assert_eq!(state.safe().payload.events, 1);
    }

    #[test]
    fn recent_events_wait_for_the_threshold() {
        let now = Utc::now();
        let mut state = DualState::<EnrollmentStats>::new(100);
        let old = event_at(now - Duration::seconds(30), &created("old"), &[]);
        let recent = event_at(now - Duration::seconds(5), &created("recent"), &[]);
        let threshold = SortableUniqueId::safe_threshold(now - Duration::seconds(20));

        state.process(&old, &threshold);
        state.process(&recent, &threshold);
        assert_eq!(state.unsafe_view().version, 2);
        assert_eq!(state.safe().version, 1);
        assert_eq!(state.buffered(), 1);
        assert!(!state.safe().payload.students.contains("recent"));

        // Threshold moves past the recent event.
        let later = SortableUniqueId::safe_threshold(now);
        assert_eq!(state.promote(&later), 1);
        assert_eq!(state.safe().version, 2);
        assert_eq!(state.safe().last_sortable_unique_id, recent.sortable_unique_id);
        assert!(state.safe().payload.students.contains("recent"));
        assert_eq!(state.buffered(), 0);
    }

    #[test]
    fn promotion_applies_buffered_events_in_position_order() {
        let now = Utc::now();
        let mut state = DualState::<EnrollmentStats>::new(100);
        let threshold = SortableUniqueId::safe_threshold(now - Duration::minutes(1));
        let second = event_at(now - Duration::seconds(2), &created("b"), &[]);
        let first = event_at(now - Duration::seconds(4), &created("a"), &[]);

        state.process(&second, &threshold);
        state.process(&first, &threshold);
        // Unsafe copy saw arrival order; its last position is still the greatest.
        assert_eq!(
            state.unsafe_view().last_sortable_unique_id,
            second.sortable_unique_id
        );

        let partial = SortableUniqueId::safe_threshold(now - Duration::seconds(3));
        assert_eq!(state.promote(&partial), 1);
        assert_eq!(state.safe().last_event_id, Some(first.id));
        assert_eq!(state.promote(&SortableUniqueId::max_value()), 1);
        assert_eq!(state.safe().last_event_id, Some(second.id));
    }

    #[test]
    fn resume_from_safe_snapshot_starts_both_copies() {
        let mut view = ProjectedView::<EnrollmentStats>::default();
        view.version = 7;
        view.last_event_id = Some(Uuid::new_v4());
        let state = DualState::from_safe(view.clone(), 10);
        assert_eq!(state.safe(), &view);
        assert_eq!(state.unsafe_view(), &view);
        assert!(state.has_seen(&view.last_event_id.expect("set above")));
    }
}
