//! Event records, candidates and per-tag write bookkeeping.
//!
//! Domain events are adjacently tagged serde enums
//! (`#[serde(tag = "type", content = "data")]`). The `"type"` becomes the
//! event type name and `"data"` becomes the opaque JSON payload. No I/O
//! happens here.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DcbError;
use crate::sortable_id::SortableUniqueId;
use crate::tag::Tag;

/// Caller metadata stamped on every event written by a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identifier of whatever caused this write (usually a command id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Correlation id threading related writes together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// User or service that executed the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_user: Option<String>,
}

impl EventMetadata {
    /// Set the causation id.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the executing user.
    pub fn with_executed_user(mut self, user: impl Into<String>) -> Self {
        self.executed_user = Some(user.into());
        self
    }
}

/// An immutable, persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,
    /// Global ordering key.
    pub sortable_unique_id: SortableUniqueId,
    /// Event type name (the `"type"` of the domain event).
    pub event_type: String,
    /// JSON payload (the `"data"` of the domain event).
    pub payload: serde_json::Value,
    /// Caller metadata.
    pub metadata: EventMetadata,
    /// `group:content` strings of every tag attached at write time.
    pub tags: Vec<String>,
}

impl Event {
    /// Returns `true` if the event carries `tag` (`group:content`).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Decode into an adjacently tagged domain event type.
    ///
    /// Returns `None` for unknown or malformed events so that projectors
    /// can skip event types they do not handle.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        let tagged = if self.payload.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({ "type": self.event_type, "data": self.payload })
        };
        serde_json::from_value(tagged).ok()
    }
}

/// An event with its payload as raw bytes, for storage-agnostic transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Global ordering key.
    pub sortable_unique_id: SortableUniqueId,
    /// Event type name.
    pub event_type: String,
    /// UTF-8 JSON bytes of the payload. Empty means `null`.
    pub payload: Vec<u8>,
    /// Caller metadata.
    pub metadata: EventMetadata,
    /// Tag strings.
    pub tags: Vec<String>,
}

impl TryFrom<&Event> for SerializableEvent {
    type Error = DcbError;

    fn try_from(event: &Event) -> Result<Self, Self::Error> {
        let payload = if event.payload.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&event.payload)?
        };
        Ok(Self {
            id: event.id,
            sortable_unique_id: event.sortable_unique_id.clone(),
            event_type: event.event_type.clone(),
            payload,
            metadata: event.metadata.clone(),
            tags: event.tags.clone(),
        })
    }
}

impl TryFrom<SerializableEvent> for Event {
    type Error = DcbError;

    fn try_from(event: SerializableEvent) -> Result<Self, Self::Error> {
        let payload = if event.payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&event.payload)?
        };
        Ok(Self {
            id: event.id,
            sortable_unique_id: event.sortable_unique_id,
            event_type: event.event_type,
            payload,
            metadata: event.metadata,
            tags: event.tags,
        })
    }
}

/// An event a command handler wants written, not yet assigned an id or
/// position.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCandidate {
    /// Event type name.
    pub event_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Tags to attach.
    pub tags: Vec<Tag>,
}

impl EventCandidate {
    /// Encode an adjacently tagged domain event.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Serialization`] if the event does not serialize
    /// to an object with a string `"type"` field.
    pub fn new<E: Serialize>(event: &E, tags: Vec<Tag>) -> Result<Self, DcbError> {
        // {"type": "Variant"} for unit variants,
        // {"type": "Variant", "data": {...}} otherwise.
        let value = serde_json::to_value(event)?;
        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                <serde_json::Error as serde::ser::Error>::custom(
                    "domain event must be an adjacently tagged enum with a string \"type\"",
                )
            })?
            .to_string();
        let payload = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Ok(Self {
            event_type,
            payload,
            tags,
        })
    }
}

/// Outcome of a write for one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWriteResult {
    /// The `group:content` tag string.
    pub tag: String,
    /// Number of events carrying this tag after the write.
    pub version: u64,
    /// When the write landed.
    pub written_at: DateTime<Utc>,
}

/// Latest known position of a tag in the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStreamInfo {
    /// The `group:content` tag string.
    pub tag: String,
    /// Number of events carrying this tag.
    pub version: u64,
    /// Greatest sortable id among those events.
    pub last_sortable_unique_id: SortableUniqueId,
}

/// Events written in one atomic append, plus per-tag results.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenEvents {
    /// The events as persisted.
    pub events: Vec<Event>,
    /// One result per distinct tag touched.
    pub tag_write_results: Vec<TagWriteResult>,
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// Enrollment domain used across the test suites.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub enum EnrollmentEvent {
        StudentCreated { student_id: String, name: String },
        StudentEnrolled { student_id: String, class_id: String },
        StudentDropped { student_id: String, class_id: String },
        Archived,
    }

    pub fn student_tag(id: &str) -> Tag {
        Tag::consistency("Student", id)
    }

    pub fn class_tag(id: &str) -> Tag {
        Tag::consistency("Class", id)
    }

    /// Build a persisted event stamped at `at`.
    pub fn event_at(at: DateTime<Utc>, domain: &EnrollmentEvent, tags: &[Tag]) -> Event {
        let candidate =
            EventCandidate::new(domain, tags.to_vec()).expect("fixture event should encode");
        let id = Uuid::new_v4();
        Event {
            id,
            sortable_unique_id: SortableUniqueId::generate(at, id),
            event_type: candidate.event_type,
            payload: candidate.payload,
            metadata: EventMetadata::default(),
            tags: tags.iter().map(Tag::tag_string).collect(),
        }
    }

    pub fn created(student_id: &str) -> EnrollmentEvent {
        EnrollmentEvent::StudentCreated {
            student_id: student_id.to_string(),
            name: format!("name-{student_id}"),
        }
    }
}
