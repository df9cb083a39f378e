//! Command execution: the consistency-checked write path.
//!
//! A [`CommandHandler`] reads tag state through a [`CommandContext`] and
//! proposes events. [`CommandExecutor`] then reserves every consistency tag
//! the events carry, writes them in one append, and confirms the
//! reservations. Any failure cancels whatever was reserved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use crate::error::{DcbError, TagReservationFailure};
use crate::event::{Event, EventCandidate, EventMetadata, TagWriteResult, WrittenEvents};
use crate::locator::ActorLocator;
use crate::sortable_id::SortableUniqueId;
use crate::tag::{Tag, validate_tags};
use crate::tag_consistency::{TagConsistencyActor, TagWriteReservation};
use crate::tag_state::{TagProjector, TagState};

/// What a handler sees while deciding: tag state reads, event proposals
/// and the caller's metadata.
///
/// Every tag read through [`get_state`](Self::get_state) is remembered
/// with the position observed; the write is then rejected if that tag has
/// moved on by the time it is reserved.
pub struct CommandContext {
    locator: Arc<ActorLocator>,
    accessed: HashMap<String, SortableUniqueId>,
    appended: Vec<EventCandidate>,
    metadata: EventMetadata,
}

impl CommandContext {
    /// Create a context resolving actors through `locator`.
    pub fn new(locator: Arc<ActorLocator>, metadata: EventMetadata) -> Self {
        Self {
            locator,
            accessed: HashMap::new(),
            appended: Vec::new(),
            metadata,
        }
    }

    /// The state of `tag` under projector `P`, recording the position
    /// observed.
    ///
    /// # Errors
    ///
    /// - [`DcbError::InvalidTags`] if `tag` is malformed; no actor is
    ///   touched.
    /// - Tag state actor failures.
    pub async fn get_state<P: TagProjector>(&mut self, tag: &Tag) -> Result<TagState, DcbError> {
        validate_tags([tag])?;
        let state = self.locator.tag_state::<P>(tag).get_state().await?;
        self.accessed
            .insert(tag.tag_string(), state.last_sorted_unique_id.clone());
        Ok(state)
    }

    /// Typed shorthand for [`get_state`](Self::get_state).
    ///
    /// # Errors
    ///
    /// Also returns [`DcbError::Serialization`] if the payload does not
    /// decode as `P::State`.
    pub async fn get_state_as<P: TagProjector>(&mut self, tag: &Tag) -> Result<P::State, DcbError> {
        self.get_state::<P>(tag).await?.payload_as()
    }

    /// Returns `true` if any event carries `tag`. Not recorded as a read.
    ///
    /// # Errors
    ///
    /// [`DcbError::InvalidTags`] if `tag` is malformed, or event store
    /// failures.
    pub async fn tag_exists(&self, tag: &Tag) -> Result<bool, DcbError> {
        validate_tags([tag])?;
        self.locator.event_store().tag_exists(&tag.tag_string()).await
    }

    /// Queue an event for writing with the command's result.
    pub fn append_event(&mut self, candidate: EventCandidate) {
        self.appended.push(candidate);
    }

    /// Position observed for `tag`, if it was read.
    pub fn accessed_version(&self, tag: &Tag) -> Option<&SortableUniqueId> {
        self.accessed.get(&tag.tag_string())
    }

    /// Caller metadata stamped on every written event.
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Business logic for one command type.
#[async_trait::async_trait]
pub trait CommandHandler<C: Send + Sync>: Send + Sync {
    /// Decide on `command`. Events may be returned, queued on `context`,
    /// or both; returning none and queueing none writes nothing.
    async fn handle(
        &self,
        command: &C,
        context: &mut CommandContext,
    ) -> Result<Option<EventCandidate>, DcbError>;
}

/// Outcome of a successful [`CommandExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Id of the last written event; `None` if nothing was written.
    pub event_id: Option<Uuid>,
    /// Position of the last written event.
    pub sortable_unique_id: Option<SortableUniqueId>,
    /// Every written event, in position order.
    pub events: Vec<Event>,
    /// One result per distinct tag touched.
    pub tag_write_results: Vec<TagWriteResult>,
    /// Wall time spent executing.
    pub duration: Duration,
}

impl ExecutionResult {
    fn empty(duration: Duration) -> Self {
        Self {
            event_id: None,
            sortable_unique_id: None,
            events: Vec::new(),
            tag_write_results: Vec::new(),
            duration,
        }
    }

    fn written(written: WrittenEvents, duration: Duration) -> Self {
        let last = written.events.last();
        Self {
            event_id: last.map(|e| e.id),
            sortable_unique_id: last.map(|e| e.sortable_unique_id.clone()),
            tag_write_results: written.tag_write_results,
            events: written.events,
            duration,
        }
    }

    /// Returns `true` if the command wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

type Reserved = Vec<(Arc<TagConsistencyActor>, TagWriteReservation)>;

/// Runs command handlers as atomic, consistency-checked writes.
#[derive(Clone)]
pub struct CommandExecutor {
    locator: Arc<ActorLocator>,
}

impl CommandExecutor {
    /// Create an executor resolving actors through `locator`.
    pub fn new(locator: Arc<ActorLocator>) -> Self {
        Self { locator }
    }

    /// The locator shared with handlers.
    pub fn locator(&self) -> &Arc<ActorLocator> {
        &self.locator
    }

    /// Run `handler` on `command` and write what it proposes.
    ///
    /// Each consistency tag is reserved against its pinned version, else
    /// the version the handler read, else without a constraint. All
    /// reservations are requested concurrently.
    ///
    /// # Errors
    ///
    /// - Whatever the handler returns, before anything is reserved.
    /// - [`DcbError::InvalidTags`] if a tag fails validation.
    /// - [`DcbError::ReservationFailed`] naming every tag that could not be
    ///   reserved; the others are cancelled.
    /// - The event store's error if the write fails; every reservation is
    ///   cancelled.
    pub async fn execute<C, H>(
        &self,
        command: &C,
        handler: &H,
        metadata: EventMetadata,
    ) -> Result<ExecutionResult, DcbError>
    where
        C: Send + Sync,
        H: CommandHandler<C> + ?Sized,
    {
        let started = Instant::now();
        let mut context = CommandContext::new(Arc::clone(&self.locator), metadata);
        let produced = handler.handle(command, &mut context).await?;
        let CommandContext {
            accessed,
            mut appended,
            metadata,
            ..
        } = context;
        appended.extend(produced);

        if appended.is_empty() {
            tracing::debug!("command produced no events");
            return Ok(ExecutionResult::empty(started.elapsed()));
        }

        let tags = merge_tags(&appended);
        validate_tags(&tags)?;
        let reserved = self.reserve_all(&tags, &accessed).await?;

        let events = build_events(&appended, &metadata);
        match self.locator.event_store().write_events(events).await {
            Ok(written) => {
                for (actor, reservation) in &reserved {
                    actor.confirm_reservation(reservation);
                }
                for tag in tags.iter().filter(|t| !t.is_consistency()) {
                    self.locator.tag_consistency(tag).notify_event_written();
                }
                let result = ExecutionResult::written(written, started.elapsed());
                tracing::info!(
                    events = result.events.len(),
                    tags = tags.len(),
                    reserved = reserved.len(),
                    position = ?result.sortable_unique_id,
                    "command executed"
                );
                Ok(result)
            }
            Err(e) => {
                cancel_all(&reserved);
                tracing::warn!(error = %e, cancelled = reserved.len(), "event write failed");
                Err(e)
            }
        }
    }

    async fn reserve_all(
        &self,
        tags: &[Tag],
        accessed: &HashMap<String, SortableUniqueId>,
    ) -> Result<Reserved, DcbError> {
        let attempts = tags.iter().filter(|t| t.is_consistency()).map(|tag| {
            let actor = self.locator.tag_consistency(tag);
            let expected = expected_version(tag, accessed);
            async move {
                let result = actor.make_reservation(&expected).await;
                (actor, result)
            }
        });

        let mut reserved = Vec::new();
        let mut failures = Vec::new();
        for (actor, result) in join_all(attempts).await {
            match result {
                Ok(reservation) => reserved.push((actor, reservation)),
                Err(e) => failures.push(TagReservationFailure {
                    tag: actor.tag().to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        if failures.is_empty() {
            return Ok(reserved);
        }

        cancel_all(&reserved);
        tracing::warn!(
            failed = failures.len(),
            cancelled = reserved.len(),
            "tag reservation failed; rolled back"
        );
        Err(DcbError::ReservationFailed { failures })
    }
}

fn cancel_all(reserved: &Reserved) {
    for (actor, reservation) in reserved {
        actor.cancel_reservation(reservation);
    }
}

/// Union of all candidate tags. A tag seen as both consistency and
/// non-consistency is a consistency tag; a pinned version wins over none.
fn merge_tags(candidates: &[EventCandidate]) -> Vec<Tag> {
    let mut merged: Vec<Tag> = Vec::new();
    for tag in candidates.iter().flat_map(|c| &c.tags) {
        let key = tag.tag_string();
        match merged.iter_mut().find(|t| t.tag_string() == key) {
            Some(existing) => {
                let upgrade = !existing.is_consistency() && tag.is_consistency();
                let pins = existing.expected_version().is_none() && tag.expected_version().is_some();
                if upgrade || pins {
                    *existing = tag.clone();
                }
            }
            None => merged.push(tag.clone()),
        }
    }
    merged
}

fn expected_version(tag: &Tag, accessed: &HashMap<String, SortableUniqueId>) -> SortableUniqueId {
    tag.expected_version()
        .cloned()
        .or_else(|| accessed.get(&tag.tag_string()).cloned())
        .unwrap_or_default()
}

/// Stamp candidates with ids and strictly increasing positions, 100 ns
/// apart.
fn build_events(candidates: &[EventCandidate], metadata: &EventMetadata) -> Vec<Event> {
    let base = Utc::now();
    candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let id = Uuid::new_v4();
            let at = base + chrono::Duration::nanoseconds(100 * i as i64);
            Event {
                id,
                sortable_unique_id: SortableUniqueId::generate(at, id),
                event_type: candidate.event_type.clone(),
                payload: candidate.payload.clone(),
                metadata: metadata.clone(),
                tags: candidate.tags.iter().map(Tag::tag_string).collect(),
            }
        })
        .collect()
}
