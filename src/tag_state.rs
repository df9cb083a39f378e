//! Per-tag projected state with an incremental cache.
//!
//! A [`TagStateActor`] folds one tag's events through one [`TagProjector`].
//! The tag's consistency actor supplies the authoritative latest position;
//! the cached [`TagState`] is reused while it matches that position and the
//! projector version.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DcbError;
use crate::event::Event;
use crate::event_store::EventStore;
use crate::sortable_id::SortableUniqueId;
use crate::tag::{Tag, TagStateId};
use crate::tag_consistency::TagConsistencyActor;

/// Folds the events of a single tag into a state value.
///
/// # Contract
///
/// - [`project`](TagProjector::project) must be pure and total. Unknown
///   event types should leave the state unchanged.
/// - Bump [`VERSION`](TagProjector::VERSION) whenever the folding logic
///   changes; cached states recorded under another version are rebuilt.
pub trait TagProjector: Send + Sync + 'static {
    /// Projector name, part of the [`TagStateId`].
    const NAME: &'static str;

    /// Version of the folding logic.
    const VERSION: &'static str;

    /// The projected state. `Default` is the state of an empty tag.
    type State: Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Apply one event.
    fn project(state: Self::State, event: &Event) -> Self::State;
}

/// The cached result of folding a tag's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagState {
    /// Projected payload as JSON.
    pub payload: serde_json::Value,
    /// Number of events applied.
    pub version: u64,
    /// Position of the last applied event; empty when none.
    pub last_sorted_unique_id: SortableUniqueId,
    /// Tag group.
    pub tag_group: String,
    /// Tag content.
    pub tag_content: String,
    /// Projector name.
    pub tag_projector: String,
    /// Projector version used to build the payload.
    pub projector_version: String,
}

impl TagState {
    /// The identity this state belongs to.
    pub fn id(&self) -> TagStateId {
        TagStateId {
            tag_group: self.tag_group.clone(),
            tag_content: self.tag_content.clone(),
            projector: self.tag_projector.clone(),
        }
    }

    /// Deserialize the payload.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Serialization`] if the payload does not match `S`.
    pub fn payload_as<S: DeserializeOwned>(&self) -> Result<S, DcbError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Storage for cached tag states.
#[async_trait::async_trait]
pub trait TagStatePersistent: Send + Sync + 'static {
    /// Load the cached state, if any.
    async fn load(&self, id: &TagStateId) -> Result<Option<TagState>, DcbError>;

    /// Replace the cached state.
    async fn save(&self, state: &TagState) -> Result<(), DcbError>;

    /// Drop the cached state.
    async fn clear(&self, id: &TagStateId) -> Result<(), DcbError>;
}

/// Tag state cache held in a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryTagStatePersistent {
    states: RwLock<HashMap<String, TagState>>,
}

impl InMemoryTagStatePersistent {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TagStatePersistent for InMemoryTagStatePersistent {
    async fn load(&self, id: &TagStateId) -> Result<Option<TagState>, DcbError> {
        let states = self.states.read().expect("tag state cache lock poisoned");
        Ok(states.get(&id.to_string()).cloned())
    }

    async fn save(&self, state: &TagState) -> Result<(), DcbError> {
        let mut states = self.states.write().expect("tag state cache lock poisoned");
        states.insert(state.id().to_string(), state.clone());
        Ok(())
    }

    async fn clear(&self, id: &TagStateId) -> Result<(), DcbError> {
        let mut states = self.states.write().expect("tag state cache lock poisoned");
        states.remove(&id.to_string());
        Ok(())
    }
}

/// Computes and caches the state of one tag under projector `P`.
pub struct TagStateActor<P: TagProjector> {
    id: TagStateId,
    consistency: Arc<TagConsistencyActor>,
    event_store: Arc<dyn EventStore>,
    persistent: Arc<dyn TagStatePersistent>,
    compute_lock: tokio::sync::Mutex<()>,
    _projector: PhantomData<fn() -> P>,
}

impl<P: TagProjector> TagStateActor<P> {
    /// Create the actor for `tag`.
    ///
    /// `consistency` must be the consistency actor of the same tag.
    pub fn new(
        tag: &Tag,
        consistency: Arc<TagConsistencyActor>,
        event_store: Arc<dyn EventStore>,
        persistent: Arc<dyn TagStatePersistent>,
    ) -> Self {
        Self {
            id: TagStateId::new(tag, P::NAME),
            consistency,
            event_store,
            persistent,
            compute_lock: tokio::sync::Mutex::new(()),
            _projector: PhantomData,
        }
    }

    /// The `group:content:projector` identity.
    pub fn id(&self) -> &TagStateId {
        &self.id
    }

    /// The state as of the tag's latest position.
    ///
    /// Serves the cache when it matches; otherwise updates incrementally
    /// or rebuilds, then caches the result.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Store`] if events cannot be read and
    /// [`DcbError::Serialization`] if the cached payload no longer matches
    /// `P::State`.
    pub async fn get_state(&self) -> Result<TagState, DcbError> {
        let latest = self.consistency.get_latest_sortable_unique_id().await;
        if let Some(cached) = self.fresh_cache(&latest).await? {
            return Ok(cached);
        }

        let _guard = self.compute_lock.lock().await;
        let cached = self.persistent.load(&self.id).await?;
        if let Some(cached) = &cached
            && self.is_fresh(cached, &latest)
        {
            return Ok(cached.clone());
        }

        let state = self.compute(cached, &latest).await?;
        self.persistent.save(&state).await?;
        Ok(state)
    }

    async fn fresh_cache(&self, latest: &SortableUniqueId) -> Result<Option<TagState>, DcbError> {
        Ok(self
            .persistent
            .load(&self.id)
            .await?
            .filter(|cached| self.is_fresh(cached, latest)))
    }

    fn is_fresh(&self, cached: &TagState, latest: &SortableUniqueId) -> bool {
        cached.projector_version == P::VERSION && cached.last_sorted_unique_id == *latest
    }

    async fn compute(
        &self,
        cached: Option<TagState>,
        latest: &SortableUniqueId,
    ) -> Result<TagState, DcbError> {
        if latest.is_empty() {
            return self.build(P::State::default(), 0, SortableUniqueId::default());
        }

        let tag = self.id.tag_string();
        let incremental = cached.filter(|c| {
            c.projector_version == P::VERSION
                && !c.last_sorted_unique_id.is_empty()
                && latest > &c.last_sorted_unique_id
        });

        let (mut state, mut version, mut last, since) = match incremental {
            Some(c) => {
                let state: P::State = serde_json::from_value(c.payload)?;
                let since = c.last_sorted_unique_id.clone();
                (state, c.version, c.last_sorted_unique_id, Some(since))
            }
            None => (P::State::default(), 0, SortableUniqueId::default(), None),
        };

        let events = self
            .event_store
            .read_events_by_tag(&tag, since.as_ref())
            .await?;
        let mut applied = 0_u64;
        for event in events.iter().filter(|e| e.sortable_unique_id <= *latest) {
            state = P::project(state, event);
            last = event.sortable_unique_id.clone();
            applied += 1;
        }
        version += applied;

        tracing::debug!(
            tag_state = %self.id,
            incremental = since.is_some(),
            applied,
            version,
            "tag state computed"
        );
        self.build(state, version, last)
    }

    fn build(
        &self,
        state: P::State,
        version: u64,
        last: SortableUniqueId,
    ) -> Result<TagState, DcbError> {
        Ok(TagState {
            payload: serde_json::to_value(&state)?,
            version,
            last_sorted_unique_id: last,
            tag_group: self.id.tag_group.clone(),
            tag_content: self.id.tag_content.clone(),
            tag_projector: self.id.projector.clone(),
            projector_version: P::VERSION.to_string(),
        })
    }

    /// Seed the cache with a state computed elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::IdentityMismatch`] if `state` belongs to another
    /// tag or projector.
    pub async fn update_state(&self, state: TagState) -> Result<(), DcbError> {
        let actual = state.id();
        if actual != self.id {
            return Err(DcbError::IdentityMismatch {
                expected: self.id.to_string(),
                actual: actual.to_string(),
            });
        }
        let _guard = self.compute_lock.lock().await;
        self.persistent.save(&state).await
    }

    /// Drop the cached state; the next read rebuilds from scratch.
    pub async fn clear_cache(&self) -> Result<(), DcbError> {
        let _guard = self.compute_lock.lock().await;
        self.persistent.clear(&self.id).await
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::event::test_fixtures::EnrollmentEvent;

    /// Counts enrollments of one student.
    pub struct StudentProjector;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct StudentState {
        pub name: Option<String>,
        pub classes: Vec<String>,
    }

    impl TagProjector for StudentProjector {
        const NAME: &'static str = "StudentProjector";
        const VERSION: &'static str = "1";
        type State = StudentState;

        fn project(mut state: StudentState, event: &Event) -> StudentState {
            match event.decode::<EnrollmentEvent>() {
                Some(EnrollmentEvent::StudentCreated { name, .. }) => state.name = Some(name),
                Some(EnrollmentEvent::StudentEnrolled { class_id, .. }) => {
                    state.classes.push(class_id)
                }
                Some(EnrollmentEvent::StudentDropped { class_id, .. }) => {
                    state.classes.retain(|c| *c != class_id)
                }
                _ => {}
            }
            state
        }
    }

    /// Same folding logic under a newer version string.
    pub struct StudentProjectorV2;

    impl TagProjector for StudentProjectorV2 {
        const NAME: &'static str = "StudentProjector";
        const VERSION: &'static str = "2";
        type State = StudentState;

        fn project(state: StudentState, event: &Event) -> StudentState {
            StudentProjector::project(state, event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::event::test_fixtures::*;
    use crate::event_store::InMemoryEventStore;
    use crate::tag_consistency::TagConsistencyConfig;
    use chrono::{Duration, Utc};

    struct Fixture {
        store: Arc<InMemoryEventStore>,
        consistency: Arc<TagConsistencyActor>,
        persistent: Arc<InMemoryTagStatePersistent>,
        tag: Tag,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryEventStore::new());
            let tag = student_tag("s1");
            let consistency = Arc::new(TagConsistencyActor::new(
                tag.tag_string(),
                store.clone(),
                TagConsistencyConfig::default(),
            ));
            Self {
                store,
                consistency,
                persistent: Arc::new(InMemoryTagStatePersistent::new()),
                tag,
            }
        }

        fn actor<P: TagProjector>(&self) -> TagStateActor<P> {
            TagStateActor::new(
                &self.tag,
                self.consistency.clone(),
                self.store.clone(),
                self.persistent.clone(),
            )
        }

        async fn write(&self, domain: EnrollmentEvent) -> Event {
            let event = event_at(Utc::now(), &domain, &[self.tag.clone()]);
            self.store
                .write_events(vec![event.clone()])
                .await
                .expect("write should succeed");
            self.consistency.notify_event_written();
            event
        }
    }

    fn enrolled(class_id: &str) -> EnrollmentEvent {
        EnrollmentEvent::StudentEnrolled {
            student_id: "s1".to_string(),
            class_id: class_id.to_string(),
        }
    }

    #[tokio::test]
    async fn unwritten_tag_yields_default_state() {
        let fx = Fixture::new();
        let actor = fx.actor::<StudentProjector>();

        let state = actor.get_state().await.expect("get_state should succeed");
        assert_eq!(state.version, 0);
        assert!(state.last_sorted_unique_id.is_empty());
        let payload: StudentState = state.payload_as().expect("payload should decode");
        assert_eq!(payload, StudentState::default());
    }

    #[tokio::test]
    async fn new_events_are_reflected_without_clearing() {
        let fx = Fixture::new();
        let actor = fx.actor::<StudentProjector>();
        fx.write(created("s1")).await;

        let first = actor.get_state().await.expect("first read should succeed");
        assert_eq!(first.version, 1);

        let second_event = fx.write(enrolled("c1")).await;
        let second = actor.get_state().await.expect("second read should succeed");
        assert_eq!(second.version, 2);
        assert_eq!(second.last_sorted_unique_id, second_event.sortable_unique_id);
        let payload: StudentState = second.payload_as().expect("payload should decode");
        assert_eq!(payload.classes, vec!["c1".to_string()]);
        assert_eq!(payload.name.as_deref(), Some("name-s1"));
    }

    #[tokio::test]
    async fn matching_cache_is_served_as_is() {
        let fx = Fixture::new();
        let actor = fx.actor::<StudentProjector>();
        fx.write(created("s1")).await;
        let first = actor.get_state().await.expect("read should succeed");

        // Tamper with the cache; a fresh position match must return it untouched.
        let mut tampered = first.clone();
        tampered.payload = serde_json::json!({ "name": "cached", "classes": [] });
        actor
            .update_state(tampered.clone())
            .await
            .expect("update should succeed");
        assert_eq!(actor.get_state().await.expect("read"), tampered);
    }

    #[tokio::test]
    async fn projector_version_change_forces_rebuild() {
        let fx = Fixture::new();
        fx.write(created("s1")).await;
        fx.write(enrolled("c1")).await;

        let v1 = fx.actor::<StudentProjector>();
        let mut cached = v1.get_state().await.expect("v1 read should succeed");
        cached.payload = serde_json::json!({ "name": "stale", "classes": [] });
        v1.update_state(cached).await.expect("update should succeed");

        let v2 = fx.actor::<StudentProjectorV2>();
        let rebuilt = v2.get_state().await.expect("v2 read should succeed");
        assert_eq!(rebuilt.projector_version, "2");
        assert_eq!(rebuilt.version, 2);
        let payload: StudentState = rebuilt.payload_as().expect("payload should decode");
        assert_eq!(payload.name.as_deref(), Some("name-s1"));
    }

    #[tokio::test]
    async fn update_state_rejects_foreign_identity() {
        let fx = Fixture::new();
        let actor = fx.actor::<StudentProjector>();
        let mut state = actor.get_state().await.expect("read should succeed");
        state.tag_content = "someone-else".to_string();
        let result = actor.update_state(state).await;
        assert!(
            matches!(result, Err(DcbError::IdentityMismatch { .. })),
            "expected IdentityMismatch, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn clear_cache_forces_full_replay() {
        let fx = Fixture::new();
        let actor = fx.actor::<StudentProjector>();
        fx.write(created("s1")).await;
        actor.get_state().await.expect("read should succeed");

        actor.clear_cache().await.expect("clear should succeed");
        assert!(fx
            .persistent
            .load(actor.id())
            .await
            .expect("load should succeed")
            .is_none());
        let rebuilt = actor.get_state().await.expect("read should succeed");
        assert_eq!(rebuilt.version, 1);
    }

    #[tokio::test]
    async fn replay_stops_at_latest_known_position() {
        let fx = Fixture::new();
        let actor = fx.actor::<StudentProjector>();
        fx.write(created("s1")).await;
        actor.get_state().await.expect("read should succeed");

        // Written without notifying the consistency actor: not yet visible.
        let hidden = event_at(
            Utc::now() + Duration::seconds(1),
            &enrolled("c9"),
            &[fx.tag.clone()],
        );
        fx.store
            .write_events(vec![hidden])
            .await
            .expect("write should succeed");
        let state = actor.get_state().await.expect("read should succeed");
        assert_eq!(state.version, 1);
    }
}
