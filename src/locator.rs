//! Actor-per-key registry.
//!
//! [`ActorLocator`] resolves tag consistency, tag state and multi-projection
//! actors by a deterministic key, creating each one lazily on first use and
//! handing out the same `Arc` afterwards. At most one instance exists per
//! key, which is what serializes reservations and catch-up per key.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::event_store::EventStore;
use crate::multi_projection::{MultiProjectionActor, MultiProjectionConfig};
use crate::projection::MultiProjector;
use crate::snapshot::{BlobSnapshotAccessor, MultiProjectionStateStore};
use crate::tag::{Tag, TagStateId};
use crate::tag_consistency::{TagConsistencyActor, TagConsistencyConfig};
use crate::tag_state::{InMemoryTagStatePersistent, TagProjector, TagStateActor, TagStatePersistent};

/// Type-erased instance map keyed by `(TypeId, key)`.
///
/// `TypeId` identifies the concrete actor type (including its projector);
/// the `String` is the tag, tag state id or projector name. Downcasting
/// recovers the typed `Arc`.
type InstanceMap = HashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>;

/// Lazily creates and caches one actor per key.
pub struct ActorLocator {
    event_store: Arc<dyn EventStore>,
    tag_state_persistent: Arc<dyn TagStatePersistent>,
    tag_consistency_config: TagConsistencyConfig,
    multi_projection_config: MultiProjectionConfig,
    state_store: Option<Arc<dyn MultiProjectionStateStore>>,
    blob: Option<Arc<dyn BlobSnapshotAccessor>>,
    instances: RwLock<InstanceMap>,
}

impl ActorLocator {
    /// Start building a locator over `event_store`.
    pub fn builder(event_store: Arc<dyn EventStore>) -> ActorLocatorBuilder {
        ActorLocatorBuilder::new(event_store)
    }

    /// The event store every actor reads from.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    /// The consistency actor of `tag`, keyed `group:content`.
    pub fn tag_consistency(&self, tag: &Tag) -> Arc<TagConsistencyActor> {
        let key = tag.tag_string();
        self.instance(key.clone(), || {
            TagConsistencyActor::new(
                key,
                Arc::clone(&self.event_store),
                self.tag_consistency_config.clone(),
            )
        })
    }

    /// The state actor of `tag` under projector `P`, keyed
    /// `group:content:projector`.
    pub fn tag_state<P: TagProjector>(&self, tag: &Tag) -> Arc<TagStateActor<P>> {
        // Resolved first: instance creation runs under the map's write lock.
        let consistency = self.tag_consistency(tag);
        let key = TagStateId::new(tag, P::NAME).to_string();
        self.instance(key, || {
            TagStateActor::new(
                tag,
                consistency,
                Arc::clone(&self.event_store),
                Arc::clone(&self.tag_state_persistent),
            )
        })
    }

    /// The multi-projection actor of `P`, keyed by projector name.
    ///
    /// The actor is created idle; call
    /// [`activate`](MultiProjectionActor::activate) or
    /// [`start`](MultiProjectionActor::start) to bring it up.
    pub fn multi_projection<P: MultiProjector>(&self) -> Arc<MultiProjectionActor<P>> {
        self.instance(P::NAME.to_string(), || {
            let mut actor = MultiProjectionActor::new(
                Arc::clone(&self.event_store),
                self.multi_projection_config.clone(),
            );
            if let Some(store) = &self.state_store {
                actor = actor.with_state_store(Arc::clone(store));
            }
            if let Some(blob) = &self.blob {
                actor = actor.with_blob_accessor(Arc::clone(blob));
            }
            actor
        })
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.read().expect("locator lock poisoned").len()
    }

    /// Returns `true` if no instance has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn instance<T, F>(&self, key: String, create: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let key = (TypeId::of::<T>(), key);

        // Fast path: check cache with read lock.
        {
            let instances = self.instances.read().expect("locator lock poisoned");
            if let Some(any) = instances.get(&key)
                && let Ok(instance) = Arc::clone(any).downcast::<T>()
            {
                return instance;
            }
        }

        // Slow path: re-check under the write lock, then create.
        let mut instances = self.instances.write().expect("locator lock poisoned");
        if let Some(any) = instances.get(&key)
            && let Ok(instance) = Arc::clone(any).downcast::<T>()
        {
            return instance;
        }
        tracing::debug!(
            actor_type = std::any::type_name::<T>(),
            key = %key.1,
            "creating actor"
        );
        let instance = Arc::new(create());
        instances.insert(key, Arc::clone(&instance) as Arc<dyn Any + Send + Sync>);
        instance
    }
}

/// Builder for [`ActorLocator`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use dcb_es::{ActorLocator, InMemoryEventStore, TagConsistencyConfig};
///
/// let locator = ActorLocator::builder(Arc::new(InMemoryEventStore::new()))
///     .tag_consistency_config(TagConsistencyConfig::default().reservation_ttl(Duration::from_secs(5)))
///     .build();
/// assert!(locator.is_empty());
/// ```
pub struct ActorLocatorBuilder {
    event_store: Arc<dyn EventStore>,
    tag_state_persistent: Option<Arc<dyn TagStatePersistent>>,
    tag_consistency_config: TagConsistencyConfig,
    multi_projection_config: MultiProjectionConfig,
    state_store: Option<Arc<dyn MultiProjectionStateStore>>,
    blob: Option<Arc<dyn BlobSnapshotAccessor>>,
}

impl ActorLocatorBuilder {
    /// Create a builder with in-memory tag state caching and default
    /// configs.
    pub fn new(event_store: Arc<dyn EventStore>) -> Self {
        Self {
            event_store,
            tag_state_persistent: None,
            tag_consistency_config: TagConsistencyConfig::default(),
            multi_projection_config: MultiProjectionConfig::default(),
            state_store: None,
            blob: None,
        }
    }

    /// Cache tag states in `persistent`.
    pub fn tag_state_persistent(mut self, persistent: Arc<dyn TagStatePersistent>) -> Self {
        self.tag_state_persistent = Some(persistent);
        self
    }

    /// Configure tag consistency actors.
    pub fn tag_consistency_config(mut self, config: TagConsistencyConfig) -> Self {
        self.tag_consistency_config = config;
        self
    }

    /// Configure multi-projection actors.
    pub fn multi_projection_config(mut self, config: MultiProjectionConfig) -> Self {
        self.multi_projection_config = config;
        self
    }

    /// Persist multi projections to `store`.
    pub fn state_store(mut self, store: Arc<dyn MultiProjectionStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Offload large multi-projection snapshots to `blob`.
    pub fn blob_accessor(mut self, blob: Arc<dyn BlobSnapshotAccessor>) -> Self {
        self.blob = Some(blob);
        self
    }

    /// Build the locator.
    pub fn build(self) -> ActorLocator {
        ActorLocator {
            event_store: self.event_store,
            tag_state_persistent: self
                .tag_state_persistent
                .unwrap_or_else(|| Arc::new(InMemoryTagStatePersistent::new())),
            tag_consistency_config: self.tag_consistency_config,
            multi_projection_config: self.multi_projection_config,
            state_store: self.state_store,
            blob: self.blob,
            instances: RwLock::new(HashMap::new()),
        }
    }
}
