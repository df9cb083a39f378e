//! Dynamic consistency boundary event sourcing: tag-scoped optimistic
//! writes over a single event log, with tag and multi-stream projections.

mod command;
mod error;
mod event;
mod event_store;
mod live;
mod locator;
mod multi_projection;
mod projection;
mod scheduler;
mod snapshot;
mod sortable_id;
mod tag;
mod tag_consistency;
mod tag_state;

pub use command::{CommandContext, CommandExecutor, CommandHandler, ExecutionResult};
pub use error::{DcbError, ErrorKind, TagReservationFailure};
pub use event::{
    Event, EventCandidate, EventMetadata, SerializableEvent, TagStreamInfo, TagWriteResult,
    WrittenEvents,
};
pub use event_store::{EventStore, InMemoryEventStore};
pub use live::{LiveHandle, spawn_live_feed, subscribe_live};
pub use locator::{ActorLocator, ActorLocatorBuilder};
pub use multi_projection::{
    CatchUpProgress, CatchUpStatus, EventSource, MultiProjectionActor, MultiProjectionConfig,
    PersistOutcome, Phase,
};
pub use projection::{
    DualState, MultiProjectionState, MultiProjector, ProcessedIdCache, ProjectedView,
};
pub use scheduler::{ScheduledJob, ScheduledTask, Scheduler, TokioScheduler};
pub use snapshot::{
    BlobSnapshotAccessor, DEFAULT_OFFLOAD_THRESHOLD_BYTES, InMemoryBlobStore,
    InMemoryMultiProjectionStateStore, MultiProjectionStateRecord, MultiProjectionStateStore,
    OffloadedSnapshot, SerializableMultiProjectionState, SnapshotEnvelope, offload_scope,
    read_blob, should_offload,
};
pub use sortable_id::SortableUniqueId;
pub use tag::{
    MAX_CONTENT_LENGTH, MAX_GROUP_LENGTH, Tag, TagConsistency, TagStateId, TagValidationError,
    validate_tags,
};
pub use tag_consistency::{
    DEFAULT_RESERVATION_TTL, TagConsistencyActor, TagConsistencyConfig, TagWriteReservation,
};
pub use tag_state::{
    InMemoryTagStatePersistent, TagProjector, TagState, TagStateActor, TagStatePersistent,
};
