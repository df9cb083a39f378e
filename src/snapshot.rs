//! Snapshot envelopes, blob offload and the durable projection record store.
//!
//! A multi projection is snapshotted as a [`SerializableMultiProjectionState`].
//! Small states travel inline; states larger than the offload threshold are
//! written to a [`BlobSnapshotAccessor`] and only the key is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::DcbError;
use crate::projection::{MultiProjector, ProjectedView};
use crate::sortable_id::SortableUniqueId;

/// Default size above which snapshots are offloaded.
pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 1_000_000;

/// Returns `true` if a payload of `size` bytes must be offloaded.
///
/// A payload exactly at the threshold stays inline.
pub fn should_offload(size: usize, threshold: usize) -> bool {
    size > threshold
}

/// Blob scope of a projector's snapshots: `{projector}/{version}`.
pub fn offload_scope(projector_name: &str, projector_version: &str) -> String {
    format!("{projector_name}/{projector_version}")
}

/// A projection state with its payload serialized to bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableMultiProjectionState {
    /// serde_json bytes of the projector payload.
    pub payload: Vec<u8>,
    /// Rust type name of the payload, for diagnostics.
    pub payload_type: String,
    /// Projector name.
    pub projector_name: String,
    /// Projector version the payload was built with.
    pub projector_version: String,
    /// Position of the last applied event.
    pub last_sortable_unique_id: SortableUniqueId,
    /// Id of the last applied event.
    pub last_event_id: Option<Uuid>,
    /// Number of events applied.
    pub version: u64,
    /// Catch-up had completed when the snapshot was taken.
    pub is_caught_up: bool,
    /// The payload excludes everything inside the safe window.
    pub is_safe_state: bool,
    /// Length of `payload`.
    pub payload_size_bytes: usize,
}

impl SerializableMultiProjectionState {
    /// Serialize a projected view of `P`.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Serialization`] if the payload fails to encode.
    pub fn from_view<P: MultiProjector>(
        view: &ProjectedView<P>,
        is_caught_up: bool,
        is_safe_state: bool,
    ) -> Result<Self, DcbError> {
        let payload = serde_json::to_vec(&view.payload)?;
        Ok(Self {
            payload_size_bytes: payload.len(),
            payload,
            payload_type: std::any::type_name::<P>().to_string(),
            projector_name: P::NAME.to_string(),
            projector_version: P::VERSION.to_string(),
            last_sortable_unique_id: view.last_sortable_unique_id.clone(),
            last_event_id: view.last_event_id,
            version: view.version,
            is_caught_up,
            is_safe_state,
        })
    }

    /// Check that this state can seed projector `P`.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::InvalidSnapshot`] when the projector name or
    /// version differs, or when the version counter is zero while the
    /// state claims a position.
    pub fn validate_for<P: MultiProjector>(&self) -> Result<(), DcbError> {
        if self.projector_name != P::NAME {
            return Err(DcbError::InvalidSnapshot(format!(
                "projector name {} does not match {}",
                self.projector_name,
                P::NAME
            )));
        }
        if self.projector_version != P::VERSION {
            return Err(DcbError::InvalidSnapshot(format!(
                "projector version {} does not match {}",
                self.projector_version,
                P::VERSION
            )));
        }
        if self.version == 0 && !self.last_sortable_unique_id.is_empty() {
            return Err(DcbError::InvalidSnapshot(
                "version is 0 but a last position is recorded".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode back into a projected view.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::InvalidSnapshot`] if validation fails and
    /// [`DcbError::Serialization`] if the payload does not decode.
    pub fn to_view<P: MultiProjector>(&self) -> Result<ProjectedView<P>, DcbError> {
        self.validate_for::<P>()?;
        Ok(ProjectedView {
            payload: serde_json::from_slice(&self.payload)?,
            version: self.version,
            last_sortable_unique_id: self.last_sortable_unique_id.clone(),
            last_event_id: self.last_event_id,
        })
    }
}

/// Pointer to a snapshot stored in blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadedSnapshot {
    /// Blob key returned by the accessor.
    pub offload_key: String,
    /// Accessor provider name.
    pub offload_provider: String,
    /// Projector name.
    pub projector_name: String,
    /// Projector version.
    pub projector_version: String,
    /// Position of the last applied event.
    pub last_sortable_unique_id: SortableUniqueId,
    /// Number of events applied.
    pub version: u64,
    /// Size of the offloaded bytes.
    pub payload_size_bytes: usize,
}

/// A snapshot as handed to hosts: inline state or a blob pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "snapshot")]
pub enum SnapshotEnvelope {
    /// State embedded directly.
    Inline(SerializableMultiProjectionState),
    /// State stored in blob storage. The blob holds the serde_json bytes
    /// of a [`SerializableMultiProjectionState`].
    Offloaded(OffloadedSnapshot),
}

impl SnapshotEnvelope {
    /// Wrap `state`, offloading it through `blob` when it is larger than
    /// `threshold` bytes. Without an accessor the state stays inline.
    ///
    /// # Errors
    ///
    /// Propagates blob write failures.
    pub async fn build(
        state: SerializableMultiProjectionState,
        threshold: usize,
        blob: Option<&dyn BlobSnapshotAccessor>,
    ) -> Result<Self, DcbError> {
        let Some(blob) = blob else {
            return Ok(Self::Inline(state));
        };
        let bytes = serde_json::to_vec(&state)?;
        if !should_offload(bytes.len(), threshold) {
            return Ok(Self::Inline(state));
        }
        let scope = offload_scope(&state.projector_name, &state.projector_version);
        let key = blob.write(&bytes, &scope).await?;
        tracing::debug!(key = %key, size = bytes.len(), "snapshot offloaded");
        Ok(Self::Offloaded(OffloadedSnapshot {
            offload_key: key,
            offload_provider: blob.provider_name().to_string(),
            projector_name: state.projector_name,
            projector_version: state.projector_version,
            last_sortable_unique_id: state.last_sortable_unique_id,
            version: state.version,
            payload_size_bytes: bytes.len(),
        }))
    }

    /// Resolve to the inline state, reading the blob if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::InvalidSnapshot`] for an offloaded envelope
    /// without an accessor, and propagates blob and decode failures.
    pub async fn into_inline(
        self,
        blob: Option<&dyn BlobSnapshotAccessor>,
    ) -> Result<SerializableMultiProjectionState, DcbError> {
        match self {
            Self::Inline(state) => Ok(state),
            Self::Offloaded(pointer) => {
                let blob = blob.ok_or_else(|| {
                    DcbError::InvalidSnapshot(format!(
                        "offloaded snapshot {} needs a blob accessor",
                        pointer.offload_key
                    ))
                })?;
                let bytes = read_blob(blob, &pointer.offload_key).await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

/// Byte storage for large snapshots.
#[async_trait::async_trait]
pub trait BlobSnapshotAccessor: Send + Sync + 'static {
    /// Name of the storage provider, recorded for diagnostics.
    fn provider_name(&self) -> &str;

    /// Store `data` under a key chosen by the provider within `scope`.
    async fn write(&self, data: &[u8], scope: &str) -> Result<String, DcbError>;

    /// Open a stream over the bytes stored under `key`.
    async fn open_read(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, DcbError>;
}

/// Read a whole blob into memory.
///
/// # Errors
///
/// Propagates the accessor's open failure and stream I/O errors.
pub async fn read_blob(blob: &dyn BlobSnapshotAccessor, key: &str) -> Result<Vec<u8>, DcbError> {
    let mut reader = blob.open_read(key).await?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

/// Blob storage held in a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("blob map lock poisoned").len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl BlobSnapshotAccessor for InMemoryBlobStore {
    fn provider_name(&self) -> &str {
        "in-memory"
    }

    async fn write(&self, data: &[u8], scope: &str) -> Result<String, DcbError> {
        let key = format!("{scope}/{}", Uuid::new_v4());
        let mut blobs = self.blobs.write().expect("blob map lock poisoned");
        blobs.insert(key.clone(), Arc::new(data.to_vec()));
        Ok(key)
    }

    async fn open_read(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, DcbError> {
        let blobs = self.blobs.read().expect("blob map lock poisoned");
        let data = blobs
            .get(key)
            .cloned()
            .ok_or_else(|| DcbError::NotFound(format!("blob {key}")))?;
        Ok(Box::new(std::io::Cursor::new(data.as_ref().clone())))
    }
}

/// Durable record of a multi projection's latest persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiProjectionStateRecord {
    /// Projector name.
    pub projector_name: String,
    /// Projector version.
    pub projector_version: String,
    /// Rust type name of the payload.
    pub payload_type: String,
    /// Position of the last applied event.
    pub last_sortable_unique_id: SortableUniqueId,
    /// Number of events the state reflects.
    pub events_processed: u64,
    /// serde_json bytes of a [`SerializableMultiProjectionState`], unless
    /// offloaded.
    pub state_data: Option<Vec<u8>>,
    /// The state lives in blob storage.
    pub is_offloaded: bool,
    /// Blob key when offloaded.
    pub offload_key: Option<String>,
    /// Blob provider when offloaded.
    pub offload_provider: Option<String>,
    /// Size of the serialized state.
    pub payload_size_bytes: u64,
    /// Safe-window threshold at the time of the snapshot.
    pub safe_window_threshold: SortableUniqueId,
    /// First write of this record.
    pub created_at: DateTime<Utc>,
    /// Latest write of this record.
    pub updated_at: DateTime<Utc>,
    /// Component that built the state.
    pub build_source: String,
    /// Host that built the state.
    pub build_host: String,
    /// Optimistic concurrency token; 0 for a record never stored.
    pub revision: u64,
}

impl MultiProjectionStateRecord {
    /// A fresh, not yet stored record for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Serialization`] if the state fails to encode.
    pub fn new(
        state: &SerializableMultiProjectionState,
        safe_window_threshold: SortableUniqueId,
        build_source: impl Into<String>,
    ) -> Result<Self, DcbError> {
        let data = serde_json::to_vec(state)?;
        let now = Utc::now();
        Ok(Self {
            projector_name: state.projector_name.clone(),
            projector_version: state.projector_version.clone(),
            payload_type: state.payload_type.clone(),
            last_sortable_unique_id: state.last_sortable_unique_id.clone(),
            events_processed: state.version,
            payload_size_bytes: data.len() as u64,
            state_data: Some(data),
            is_offloaded: false,
            offload_key: None,
            offload_provider: None,
            safe_window_threshold,
            created_at: now,
            updated_at: now,
            build_source: build_source.into(),
            build_host: build_host(),
            revision: 0,
        })
    }

    /// Decode the stored state, reading the blob when offloaded.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::InvalidSnapshot`] if neither inline data nor a
    /// usable offload key is present.
    pub async fn load_state(
        &self,
        blob: Option<&dyn BlobSnapshotAccessor>,
    ) -> Result<SerializableMultiProjectionState, DcbError> {
        let bytes = match (&self.state_data, &self.offload_key, blob) {
            (Some(data), _, _) => data.clone(),
            (None, Some(key), Some(blob)) if self.is_offloaded => read_blob(blob, key).await?,
            _ => {
                return Err(DcbError::InvalidSnapshot(format!(
                    "record {}/{} has no readable state",
                    self.projector_name, self.projector_version
                )));
            }
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn build_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Durable storage for multi projection state records.
#[async_trait::async_trait]
pub trait MultiProjectionStateStore: Send + Sync + 'static {
    /// Latest record for this projector name and version.
    async fn get_latest_for_version(
        &self,
        projector_name: &str,
        projector_version: &str,
    ) -> Result<Option<MultiProjectionStateRecord>, DcbError>;

    /// Latest record for this projector under any version.
    async fn get_latest_any_version(
        &self,
        projector_name: &str,
    ) -> Result<Option<MultiProjectionStateRecord>, DcbError>;

    /// Insert or replace the record, offloading its state when larger
    /// than `offload_threshold_bytes`. Returns the stored record.
    ///
    /// Fails with [`DcbError::WriteConflict`] when `record.revision` is not
    /// the stored revision.
    async fn upsert(
        &self,
        record: MultiProjectionStateRecord,
        offload_threshold_bytes: usize,
    ) -> Result<MultiProjectionStateRecord, DcbError>;

    /// Every stored record.
    async fn list_all(&self) -> Result<Vec<MultiProjectionStateRecord>, DcbError>;

    /// The accessor holding offloaded states, if any.
    fn blob_accessor(&self) -> Option<&dyn BlobSnapshotAccessor>;
}

/// State record store held in a process-local map.
#[derive(Default)]
pub struct InMemoryMultiProjectionStateStore {
    records: RwLock<HashMap<(String, String), MultiProjectionStateRecord>>,
    blob: Option<Arc<dyn BlobSnapshotAccessor>>,
    injected_conflicts: AtomicUsize,
}

impl InMemoryMultiProjectionStateStore {
    /// Create an empty store that never offloads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offload large states to `blob`.
    pub fn with_blob_accessor(mut self, blob: Arc<dyn BlobSnapshotAccessor>) -> Self {
        self.blob = Some(blob);
        self
    }

    /// Make the next `count` upserts fail with a write conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MultiProjectionStateStore for InMemoryMultiProjectionStateStore {
    async fn get_latest_for_version(
        &self,
        projector_name: &str,
        projector_version: &str,
    ) -> Result<Option<MultiProjectionStateRecord>, DcbError> {
        let records = self.records.read().expect("state record lock poisoned");
        Ok(records
            .get(&(projector_name.to_string(), projector_version.to_string()))
            .cloned())
    }

    async fn get_latest_any_version(
        &self,
        projector_name: &str,
    ) -> Result<Option<MultiProjectionStateRecord>, DcbError> {
        let records = self.records.read().expect("state record lock poisoned");
        Ok(records
            .values()
            .filter(|r| r.projector_name == projector_name)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn upsert(
        &self,
        mut record: MultiProjectionStateRecord,
        offload_threshold_bytes: usize,
    ) -> Result<MultiProjectionStateRecord, DcbError> {
        let key = (
            record.projector_name.clone(),
            record.projector_version.clone(),
        );
        let conflict = || DcbError::WriteConflict {
            projector: key.0.clone(),
            version: key.1.clone(),
        };
        if self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(conflict());
        }

        // Checked before offloading so a stale write leaves no orphaned blob.
        let stale = {
            let records = self.records.read().expect("state record lock poisoned");
            records.get(&key).map_or(0, |r| r.revision) != record.revision
        };
        if stale {
            return Err(conflict());
        }

        if let (Some(blob), Some(data)) = (&self.blob, &record.state_data)
            && should_offload(data.len(), offload_threshold_bytes)
        {
            let scope = offload_scope(&record.projector_name, &record.projector_version);
            let key = blob.write(data, &scope).await?;
            record.offload_key = Some(key);
            record.offload_provider = Some(blob.provider_name().to_string());
            record.is_offloaded = true;
            record.state_data = None;
        }

        let mut records = self.records.write().expect("state record lock poisoned");
        let stored_revision = records.get(&key).map_or(0, |r| r.revision);
        if stored_revision != record.revision {
            return Err(conflict());
        }
        if let Some(existing) = records.get(&key) {
            record.created_at = existing.created_at;
        }
        record.revision = stored_revision + 1;
        record.updated_at = Utc::now();
        records.insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn list_all(&self) -> Result<Vec<MultiProjectionStateRecord>, DcbError> {
        let records = self.records.read().expect("state record lock poisoned");
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| {
            (&a.projector_name, &a.projector_version).cmp(&(&b.projector_name, &b.projector_version))
        });
        Ok(all)
    }

    fn blob_accessor(&self) -> Option<&dyn BlobSnapshotAccessor> {
        self.blob.as_deref()
    }
}
