//! Per-tag optimistic concurrency: the reservation protocol.
//!
//! One [`TagConsistencyActor`] exists per tag (`group:content`). It serializes
//! competing writers through short-lived reservations and exposes the tag's
//! authoritative latest position, lazily derived from the event store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DcbError;
use crate::event_store::EventStore;
use crate::sortable_id::SortableUniqueId;

/// Default lifetime of a reservation.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(30);

/// How often a reservation attempt re-derives the latest position when
/// concurrent writes keep invalidating it.
const MAX_CATCH_UP_ATTEMPTS: usize = 5;

/// Configuration for tag consistency actors.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use dcb_es::TagConsistencyConfig;
///
/// let config = TagConsistencyConfig::default().reservation_ttl(Duration::from_secs(10));
/// assert_eq!(config.reservation_ttl, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct TagConsistencyConfig {
    /// Lifetime of a reservation before it is swept as expired.
    /// Defaults to 30 seconds.
    pub reservation_ttl: Duration,
}

impl TagConsistencyConfig {
    /// Set the reservation lifetime.
    pub fn reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }
}

impl Default for TagConsistencyConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }
}

/// A short-lived lease granting exclusive permission to write one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWriteReservation {
    /// Random code identifying this lease.
    pub reservation_code: String,
    /// Instant after which the lease is treated as absent.
    pub expires_at: DateTime<Utc>,
    /// The reserved tag (`group:content`).
    pub tag: String,
}

impl TagWriteReservation {
    /// Returns `true` once `now` has passed the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct TagLedger {
    latest: SortableUniqueId,
    /// Bumped every time a write lands; a catch-up is only current if it
    /// started at the present generation.
    generation: u64,
    caught_up_generation: Option<u64>,
    reservations: Vec<TagWriteReservation>,
}

impl TagLedger {
    fn is_caught_up(&self) -> bool {
        self.caught_up_generation == Some(self.generation)
    }

    fn invalidate(&mut self) {
        self.generation += 1;
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) {
        self.reservations.retain(|r| !r.is_expired(now));
    }
}

/// Serializes writers competing for one tag.
///
/// The latest position is derived from the event store on first use and
/// again after every confirmed write. Catch-up is double-checked: callers
/// racing on a stale tag wait for a single in-flight store read.
pub struct TagConsistencyActor {
    tag: String,
    event_store: Arc<dyn EventStore>,
    reservation_ttl: chrono::Duration,
    ledger: Mutex<TagLedger>,
    catch_up_lock: tokio::sync::Mutex<()>,
}

impl TagConsistencyActor {
    /// Create the actor for `tag` (`group:content`).
    pub fn new(
        tag: impl Into<String>,
        event_store: Arc<dyn EventStore>,
        config: TagConsistencyConfig,
    ) -> Self {
        let reservation_ttl = chrono::Duration::from_std(config.reservation_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            tag: tag.into(),
            event_store,
            reservation_ttl,
            ledger: Mutex::new(TagLedger::default()),
            catch_up_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The tag this actor guards.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `true` if the cached latest position is current.
    pub fn is_caught_up(&self) -> bool {
        self.ledger.lock().expect("tag ledger lock poisoned").is_caught_up()
    }

    /// The tag's latest sortable id, empty if it was never written.
    ///
    /// A failed store read is logged and the last known value returned.
    pub async fn get_latest_sortable_unique_id(&self) -> SortableUniqueId {
        match self.catch_up().await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!(
                    tag = %self.tag,
                    error = %e,
                    "tag catch-up failed; returning last known position"
                );
                self.ledger
                    .lock()
                    .expect("tag ledger lock poisoned")
                    .latest
                    .clone()
            }
        }
    }

    async fn catch_up(&self) -> Result<SortableUniqueId, DcbError> {
        {
            let ledger = self.ledger.lock().expect("tag ledger lock poisoned");
            if ledger.is_caught_up() {
                return Ok(ledger.latest.clone());
            }
        }

        let _guard = self.catch_up_lock.lock().await;
        let generation = {
            let ledger = self.ledger.lock().expect("tag ledger lock poisoned");
            if ledger.is_caught_up() {
                return Ok(ledger.latest.clone());
            }
            ledger.generation
        };

        let latest = self
            .event_store
            .get_latest_tag(&self.tag)
            .await?
            .map(|info| info.last_sortable_unique_id)
            .unwrap_or_default();

        let mut ledger = self.ledger.lock().expect("tag ledger lock poisoned");
        ledger.latest = latest.clone();
        if ledger.generation == generation {
            ledger.caught_up_generation = Some(generation);
        }
        tracing::debug!(tag = %self.tag, latest = %latest, "tag caught up");
        Ok(latest)
    }

    /// Acquire the write lease for this tag.
    ///
    /// `expected` is the version the writer observed; empty means "no
    /// constraint".
    ///
    /// # Errors
    ///
    /// - [`DcbError::TagReserved`] if another unexpired reservation exists.
    /// - [`DcbError::TagModified`] if `expected` is non-empty and differs
    ///   from the latest position.
    /// - [`DcbError::Store`] if the latest position cannot be derived.
    pub async fn make_reservation(
        &self,
        expected: &SortableUniqueId,
    ) -> Result<TagWriteReservation, DcbError> {
        for _ in 0..MAX_CATCH_UP_ATTEMPTS {
            self.catch_up().await?;

            let mut ledger = self.ledger.lock().expect("tag ledger lock poisoned");
            if !ledger.is_caught_up() {
                // A write landed between catch-up and now.
                continue;
            }

            let now = Utc::now();
            ledger.sweep_expired(now);
            if !ledger.reservations.is_empty() {
                return Err(DcbError::TagReserved {
                    tag: self.tag.clone(),
                });
            }
            if !expected.is_empty() && *expected != ledger.latest {
                return Err(DcbError::TagModified {
                    tag: self.tag.clone(),
                    expected: expected.to_string(),
                    current: ledger.latest.to_string(),
                });
            }

            let reservation = TagWriteReservation {
                reservation_code: Uuid::new_v4().to_string(),
                expires_at: now + self.reservation_ttl,
                tag: self.tag.clone(),
            };
            ledger.reservations.push(reservation.clone());
            tracing::debug!(
                tag = %self.tag,
                code = %reservation.reservation_code,
                "reservation granted"
            );
            return Ok(reservation);
        }

        Err(DcbError::Store(format!(
            "tag {} kept changing while deriving its latest position",
            self.tag
        )))
    }

    /// Release a reservation after a successful write.
    ///
    /// Returns `false` if the reservation is unknown; nothing changes then.
    /// On success the cached latest position is invalidated so the next
    /// read sees the write.
    pub fn confirm_reservation(&self, reservation: &TagWriteReservation) -> bool {
        let mut ledger = self.ledger.lock().expect("tag ledger lock poisoned");
        let before = ledger.reservations.len();
        ledger
            .reservations
            .retain(|r| r.reservation_code != reservation.reservation_code);
        if ledger.reservations.len() == before {
            return false;
        }
        ledger.invalidate();
        true
    }

    /// Release a reservation without a write. Idempotent.
    pub fn cancel_reservation(&self, reservation: &TagWriteReservation) -> bool {
        let mut ledger = self.ledger.lock().expect("tag ledger lock poisoned");
        let before = ledger.reservations.len();
        ledger
            .reservations
            .retain(|r| r.reservation_code != reservation.reservation_code);
        ledger.reservations.len() != before
    }

    /// Mark the latest position stale after a write that took no
    /// reservation on this tag.
    pub fn notify_event_written(&self) {
        self.ledger
            .lock()
            .expect("tag ledger lock poisoned")
            .invalidate();
    }

    /// Unexpired reservations currently on file.
    pub fn active_reservations(&self) -> Vec<TagWriteReservation> {
        let now = Utc::now();
        self.ledger
            .lock()
            .expect("tag ledger lock poisoned")
            .reservations
            .iter()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for TagConsistencyActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagConsistencyActor")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_fixtures::*;
    use crate::event::{Event, TagStreamInfo, WrittenEvents};
    use crate::event_store::InMemoryEventStore;
    use chrono::Duration as ChronoDuration;

    fn actor_for(store: &Arc<InMemoryEventStore>, tag: &str) -> TagConsistencyActor {
        TagConsistencyActor::new(tag, store.clone(), TagConsistencyConfig::default())
    }

    async fn write(store: &InMemoryEventStore, at: DateTime<Utc>, tag: &str) -> Event {
        let event = event_at(at, &created("s"), &[crate::tag::Tag::parse(tag)]);
        store
            .write_events(vec![event.clone()])
            .await
            .expect("write should succeed");
        event
    }

    #[tokio::test]
    async fn unwritten_tag_has_empty_latest() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Student:s1");
        assert!(actor.get_latest_sortable_unique_id().await.is_empty());
        assert!(actor.is_caught_up());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_admit_exactly_one() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = Arc::new(actor_for(&store, "Student:s1"));
        let empty = SortableUniqueId::default();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let actor = actor.clone();
                let empty = empty.clone();
                tokio::spawn(async move { actor.make_reservation(&empty).await })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            match task.await.expect("task should not panic") {
                Ok(_) => granted += 1,
                Err(e) => assert!(
                    matches!(e, DcbError::TagReserved { .. }),
                    "expected TagReserved, got: {e:?}"
                ),
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(actor.active_reservations().len(), 1);
    }

    #[tokio::test]
    async fn expected_version_must_match_latest() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Student:s1");
        let first = write(&store, Utc::now(), "Student:s1").await;

        // Empty expected never conflicts.
        let r = actor
            .make_reservation(&SortableUniqueId::default())
            .await
            .expect("empty expected should reserve");
        assert!(actor.cancel_reservation(&r));

        // Matching expected succeeds.
        let r = actor
            .make_reservation(&first.sortable_unique_id)
            .await
            .expect("matching expected should reserve");
        assert!(actor.cancel_reservation(&r));

        // Stale expected fails with both versions.
        let stale = SortableUniqueId::generate(Utc::now() - ChronoDuration::hours(1), Uuid::new_v4());
        let result = actor.make_reservation(&stale).await;
        match result {
            Err(DcbError::TagModified {
                expected, current, ..
            }) => {
                assert_eq!(expected, stale.to_string());
                assert_eq!(current, first.sortable_unique_id.to_string());
            }
            other => panic!("expected TagModified, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn expected_version_on_unwritten_tag_conflicts() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Student:ghost");
        let result = actor
            .make_reservation(&SortableUniqueId::generate_now())
            .await;
        assert!(
            matches!(result, Err(DcbError::TagModified { .. })),
            "expected TagModified, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn latest_is_greatest_written_position() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Class:c1");
        let base = Utc::now();
        let mut greatest = SortableUniqueId::default();
        for offset in [5_i64, 1, 9, 3] {
            let event = write(&store, base + ChronoDuration::milliseconds(offset), "Class:c1").await;
            greatest = greatest.max(event.sortable_unique_id);
            actor.notify_event_written();
        }
        assert_eq!(actor.get_latest_sortable_unique_id().await, greatest);
    }

    #[tokio::test]
    async fn confirm_invalidates_cached_latest() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Student:s1");
        assert!(actor.get_latest_sortable_unique_id().await.is_empty());

        let reservation = actor
            .make_reservation(&SortableUniqueId::default())
            .await
            .expect("reservation should succeed");
        let event = write(&store, Utc::now(), "Student:s1").await;
        assert!(actor.confirm_reservation(&reservation));
        assert!(!actor.is_caught_up());

        assert_eq!(
            actor.get_latest_sortable_unique_id().await,
            event.sortable_unique_id
        );
        assert!(actor.active_reservations().is_empty());
    }

    #[tokio::test]
    async fn confirm_unknown_reservation_is_noop() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Student:s1");
        let bogus = TagWriteReservation {
            reservation_code: "nope".to_string(),
            expires_at: Utc::now(),
            tag: "Student:s1".to_string(),
        };
        actor.get_latest_sortable_unique_id().await;
        assert!(!actor.confirm_reservation(&bogus));
        assert!(actor.is_caught_up(), "no-op confirm must not invalidate");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = actor_for(&store, "Student:s1");
        let reservation = actor
            .make_reservation(&SortableUniqueId::default())
            .await
            .expect("reservation should succeed");
        assert!(actor.cancel_reservation(&reservation));
        assert!(!actor.cancel_reservation(&reservation));
        actor
            .make_reservation(&SortableUniqueId::default())
            .await
            .expect("tag should be free after cancel");
    }

    #[tokio::test]
    async fn expired_reservation_is_swept() {
        let store = Arc::new(InMemoryEventStore::new());
        let actor = TagConsistencyActor::new(
            "Student:s1",
            store.clone(),
            TagConsistencyConfig::default().reservation_ttl(Duration::from_millis(30)),
        );
        actor
            .make_reservation(&SortableUniqueId::default())
            .await
            .expect("first reservation should succeed");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(actor.active_reservations().is_empty());
        actor
            .make_reservation(&SortableUniqueId::default())
            .await
            .expect("expired lease should not block");
    }

    /// Store whose every call fails.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl EventStore for BrokenStore {
        async fn write_events(&self, _: Vec<Event>) -> Result<WrittenEvents, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
        async fn read_all_events(
            &self,
            _: Option<&SortableUniqueId>,
            _: Option<usize>,
        ) -> Result<Vec<Event>, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
        async fn read_events_by_tag(
            &self,
            _: &str,
            _: Option<&SortableUniqueId>,
        ) -> Result<Vec<Event>, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
        async fn read_event(&self, _: Uuid) -> Result<Option<Event>, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
        async fn get_latest_tag(&self, _: &str) -> Result<Option<TagStreamInfo>, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
        async fn tag_exists(&self, _: &str) -> Result<bool, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
        async fn get_event_count(&self, _: Option<&SortableUniqueId>) -> Result<u64, DcbError> {
            Err(DcbError::Store("down".to_string()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_logged_on_read_and_surfaced_on_reserve() {
        let actor = TagConsistencyActor::new(
            "Student:s1",
            Arc::new(BrokenStore),
            TagConsistencyConfig::default(),
        );
        assert!(actor.get_latest_sortable_unique_id().await.is_empty());
        assert!(!actor.is_caught_up());

        let result = actor.make_reservation(&SortableUniqueId::default()).await;
        assert!(
            matches!(result, Err(DcbError::Store(_))),
            "expected Store error, got: {result:?}"
        );
    }
}
