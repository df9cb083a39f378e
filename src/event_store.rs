//! The event store contract and an in-memory implementation.
//!
//! The store is the single source of truth. Every actor in this crate reads
//! from it through the [`EventStore`] trait; concrete backends (SQL, files,
//! columnar stores) live outside the crate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::DcbError;
use crate::event::{Event, SerializableEvent, TagStreamInfo, TagWriteResult, WrittenEvents};
use crate::sortable_id::SortableUniqueId;

/// Append-only, tag-indexed event storage.
///
/// All `since` arguments are exclusive: only events strictly after the
/// given position are returned. Results are ordered by
/// [`SortableUniqueId`].
#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append events atomically. Either every event lands or none does.
    async fn write_events(&self, events: Vec<Event>) -> Result<WrittenEvents, DcbError>;

    /// Read events after `since`, at most `max_count` of them.
    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, DcbError>;

    /// Read events carrying `tag` after `since`.
    async fn read_events_by_tag(
        &self,
        tag: &str,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, DcbError>;

    /// Fetch one event by id.
    async fn read_event(&self, id: Uuid) -> Result<Option<Event>, DcbError>;

    /// Latest position of `tag`, or `None` if it was never written.
    async fn get_latest_tag(&self, tag: &str) -> Result<Option<TagStreamInfo>, DcbError>;

    /// Returns `true` if any event carries `tag`.
    async fn tag_exists(&self, tag: &str) -> Result<bool, DcbError>;

    /// Number of events after `since` (all events when `None`).
    async fn get_event_count(&self, since: Option<&SortableUniqueId>) -> Result<u64, DcbError>;

    /// Append events whose payloads are raw bytes.
    async fn write_serializable_events(
        &self,
        events: Vec<SerializableEvent>,
    ) -> Result<WrittenEvents, DcbError> {
        let events = events
            .into_iter()
            .map(Event::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        self.write_events(events).await
    }

    /// Read events after `since` with payloads as raw bytes.
    async fn read_all_serializable_events(
        &self,
        since: Option<&SortableUniqueId>,
        max_count: Option<usize>,
    ) -> Result<Vec<SerializableEvent>, DcbError> {
        self.read_all_events(since, max_count)
            .await?
            .iter()
            .map(SerializableEvent::try_from)
            .collect()
    }
}

/// Capacity of the live broadcast channel.
const LIVE_CHANNEL_CAPACITY: usize = 4096;

#[derive(Default)]
struct MemoryLog {
    /// Sorted by sortable id.
    events: Vec<Event>,
    ids: HashMap<Uuid, SortableUniqueId>,
    tags: HashMap<String, TagStreamInfo>,
}

/// Event store held entirely in memory.
///
/// Events are kept sorted by sortable id regardless of insertion order.
/// Every written event is also published to live subscribers (see
/// [`subscribe`](InMemoryEventStore::subscribe)). Failures can be injected
/// for tests of retry and rollback paths.
pub struct InMemoryEventStore {
    log: RwLock<MemoryLog>,
    live: broadcast::Sender<Event>,
    failing_writes: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            log: RwLock::new(MemoryLog::default()),
            live,
            failing_writes: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
        }
    }

    /// Receive every event written from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    /// Make the next `count` writes fail with [`DcbError::Store`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads of the full log fail with
    /// [`DcbError::Store`].
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Total number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().expect("event log lock poisoned").events.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the first event strictly after `since`.
fn start_index(events: &[Event], since: Option<&SortableUniqueId>) -> usize {
    match since {
        Some(since) if !since.is_empty() => {
            events.partition_point(|e| e.sortable_unique_id <= *since)
        }
        _ => 0,
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn write_events(&self, events: Vec<Event>) -> Result<WrittenEvents, DcbError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(DcbError::Store("injected write failure".to_string()));
        }

        let written_at = Utc::now();
        let tag_write_results = {
            let mut log = self.log.write().expect("event log lock poisoned");
            if let Some(dup) = events.iter().find(|e| log.ids.contains_key(&e.id)) {
                return Err(DcbError::Store(format!("duplicate event id {}", dup.id)));
            }
            let mut touched: Vec<String> = Vec::new();
            for event in &events {
                let at = log
                    .events
                    .partition_point(|e| e.sortable_unique_id <= event.sortable_unique_id);
                log.events.insert(at, event.clone());
                log.ids.insert(event.id, event.sortable_unique_id.clone());

                for tag in &event.tags {
                    let info = log
                        .tags
                        .entry(tag.clone())
                        .or_insert_with(|| TagStreamInfo {
                            tag: tag.clone(),
                            version: 0,
                            last_sortable_unique_id: SortableUniqueId::default(),
                        });
                    info.version += 1;
                    if event.sortable_unique_id > info.last_sortable_unique_id {
                        info.last_sortable_unique_id = event.sortable_unique_id.clone();
                    }
                    if !touched.contains(tag) {
                        touched.push(tag.clone());
                    }
                }
            }
            touched
                .iter()
                .filter_map(|tag| log.tags.get(tag))
                .map(|info| TagWriteResult {
                    tag: info.tag.clone(),
                    version: info.version,
                    written_at,
                })
                .collect::<Vec<_>>()
        };

        for event in &events {
            // No receivers is fine.
            let _ = self.live.send(event.clone());
        }
        tracing::debug!(count = events.len(), "events appended");

        Ok(WrittenEvents {
            events,
            tag_write_results,
        })
    }

    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, DcbError> {
        if Self::take_failure(&self.failing_reads) {
            return Err(DcbError::Store("injected read failure".to_string()));
        }
        let log = self.log.read().expect("event log lock poisoned");
        let start = start_index(&log.events, since);
        let tail = &log.events[start..];
        let take = max_count.unwrap_or(tail.len()).min(tail.len());
        Ok(tail[..take].to_vec())
    }

    async fn read_events_by_tag(
        &self,
        tag: &str,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, DcbError> {
        let log = self.log.read().expect("event log lock poisoned");
        let start = start_index(&log.events, since);
        Ok(log.events[start..]
            .iter()
            .filter(|e| e.has_tag(tag))
            .cloned()
            .collect())
    }

    async fn read_event(&self, id: Uuid) -> Result<Option<Event>, DcbError> {
        let log = self.log.read().expect("event log lock poisoned");
        let Some(position) = log.ids.get(&id) else {
            return Ok(None);
        };
        let start = log.events.partition_point(|e| e.sortable_unique_id < *position);
        Ok(log.events[start..]
            .iter()
            .take_while(|e| e.sortable_unique_id == *position)
            .find(|e| e.id == id)
            .cloned())
    }

    async fn get_latest_tag(&self, tag: &str) -> Result<Option<TagStreamInfo>, DcbError> {
        let log = self.log.read().expect("event log lock poisoned");
        Ok(log.tags.get(tag).cloned())
    }

    async fn tag_exists(&self, tag: &str) -> Result<bool, DcbError> {
        let log = self.log.read().expect("event log lock poisoned");
        Ok(log.tags.contains_key(tag))
    }

    async fn get_event_count(&self, since: Option<&SortableUniqueId>) -> Result<u64, DcbError> {
        let log = self.log.read().expect("event log lock poisoned");
        let start = start_index(&log.events, since);
        Ok((log.events.len() - start) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_fixtures::*;
    use chrono::Duration;

    #[tokio::test]
    async fn write_then_read_in_sortable_order() {
        let store = InMemoryEventStore::new();
        let base = Utc::now();
        let late = event_at(base + Duration::seconds(2), &created("b"), &[student_tag("b")]);
        let early = event_at(base, &created("a"), &[student_tag("a")]);

        store
            .write_events(vec![late.clone()])
            .await
            .expect("first write should succeed");
        store
            .write_events(vec![early.clone()])
            .await
            .expect("second write should succeed");

        let all = store
            .read_all_events(None, None)
            .await
            .expect("read should succeed");
        assert_eq!(all, vec![early.clone(), late.clone()]);

        let after = store
            .read_all_events(Some(&early.sortable_unique_id), None)
            .await
            .expect("read should succeed");
        assert_eq!(after, vec![late]);
    }

    #[tokio::test]
    async fn read_all_respects_max_count() {
        let store = InMemoryEventStore::new();
        let base = Utc::now();
        let events: Vec<Event> = (0..10)
            .map(|i| event_at(base + Duration::milliseconds(i), &created("s"), &[]))
            .collect();
        store
            .write_events(events.clone())
            .await
            .expect("write should succeed");

        let page = store
            .read_all_events(None, Some(4))
            .await
            .expect("read should succeed");
        assert_eq!(page, events[..4].to_vec());
        assert_eq!(
            store
                .get_event_count(Some(&events[6].sortable_unique_id))
                .await
                .expect("count should succeed"),
            3
        );
    }

    #[tokio::test]
    async fn tag_results_track_version_and_latest_position() {
        let store = InMemoryEventStore::new();
        let base = Utc::now();
        let first = event_at(base, &created("s1"), &[student_tag("s1"), class_tag("c1")]);
        let second = event_at(base + Duration::seconds(1), &created("s1"), &[student_tag("s1")]);

        store
            .write_events(vec![first])
            .await
            .expect("write should succeed");
        let written = store
            .write_events(vec![second.clone()])
            .await
            .expect("write should succeed");

        assert_eq!(written.tag_write_results.len(), 1);
        assert_eq!(written.tag_write_results[0].tag, "Student:s1");
        assert_eq!(written.tag_write_results[0].version, 2);

        let latest = store
            .get_latest_tag("Student:s1")
            .await
            .expect("latest should succeed")
            .expect("tag should exist");
        assert_eq!(latest.last_sortable_unique_id, second.sortable_unique_id);
        assert!(store.tag_exists("Class:c1").await.expect("exists"));
        assert!(!store.tag_exists("Class:c2").await.expect("exists"));
        assert!(store.get_latest_tag("Class:c2").await.expect("latest").is_none());

        let by_tag = store
            .read_events_by_tag("Student:s1", None)
            .await
            .expect("read by tag should succeed");
        assert_eq!(by_tag.len(), 2);
    }

    #[tokio::test]
    async fn read_event_finds_by_id() {
        let store = InMemoryEventStore::new();
        let event = event_at(Utc::now(), &created("s1"), &[]);
        store
            .write_events(vec![event.clone()])
            .await
            .expect("write should succeed");
        let found = store.read_event(event.id).await.expect("read should succeed");
        assert_eq!(found, Some(event));
        assert!(store
            .read_event(Uuid::new_v4())
            .await
            .expect("read should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_reject_the_whole_batch() {
        let store = InMemoryEventStore::new();
        let event = event_at(Utc::now(), &created("s1"), &[]);
        store
            .write_events(vec![event.clone()])
            .await
            .expect("write should succeed");
        let other = event_at(Utc::now(), &created("s2"), &[]);
        let result = store.write_events(vec![other, event]).await;
        assert!(matches!(result, Err(DcbError::Store(_))), "got: {result:?}");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryEventStore::new();
        store.fail_next_writes(1);
        store.fail_next_reads(1);
        let event = event_at(Utc::now(), &created("s1"), &[]);

        assert!(store.write_events(vec![event.clone()]).await.is_err());
        assert!(store.is_empty());
        store
            .write_events(vec![event])
            .await
            .expect("second write should succeed");

        assert!(store.read_all_events(None, None).await.is_err());
        assert_eq!(
            store
                .read_all_events(None, None)
                .await
                .expect("read should succeed")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn subscribers_see_written_events() {
        let store = InMemoryEventStore::new();
        let mut rx = store.subscribe();
        let event = event_at(Utc::now(), &created("s1"), &[]);
        store
            .write_events(vec![event.clone()])
            .await
            .expect("write should succeed");
        let received = rx.recv().await.expect("subscriber should receive event");
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn serializable_variants_round_trip_through_store() {
        let store = InMemoryEventStore::new();
        let event = event_at(Utc::now(), &created("s9"), &[student_tag("s9")]);
        let wire = SerializableEvent::try_from(&event).expect("to serializable");
        store
            .write_serializable_events(vec![wire.clone()])
            .await
            .expect("write should succeed");
        let read = store
            .read_all_serializable_events(None, None)
            .await
            .expect("read should succeed");
        assert_eq!(read, vec![wire]);
    }
}
