//! The multi-projection actor: one projection folded over the whole log.
//!
//! The actor moves through `Idle -> CatchingUp -> Live`. Catch-up reads the
//! event store in batches from the last known position; once enough
//! consecutive batches come back empty the actor goes live and folds events
//! pushed by a live feed (see [`crate::live`]). A detected gap or an
//! explicit [`refresh`](MultiProjectionActor::refresh) re-enters catch-up.
//!
//! State is kept twice (see [`DualState`]): the unsafe copy answers
//! low-latency reads, the safe copy is what gets persisted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use uuid::Uuid;

use crate::error::DcbError;
use crate::event::Event;
use crate::event_store::EventStore;
use crate::projection::{DualState, MultiProjectionState, MultiProjector, ProjectedView};
use crate::scheduler::{ScheduledJob, ScheduledTask, Scheduler};
use crate::snapshot::{
    BlobSnapshotAccessor, DEFAULT_OFFLOAD_THRESHOLD_BYTES, MultiProjectionStateRecord,
    MultiProjectionStateStore, SerializableMultiProjectionState, SnapshotEnvelope,
};
use crate::sortable_id::SortableUniqueId;

const BUILD_SOURCE: &str = "multi-projection-actor";

/// Tuning for multi-projection actors.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use dcb_es::MultiProjectionConfig;
///
/// let config = MultiProjectionConfig::default()
///     .safe_window(Duration::from_secs(5))
///     .batch_size(500);
/// assert_eq!(config.safe_window, Duration::from_secs(5));
/// assert_eq!(config.max_consecutive_empty_batches, 5);
/// ```
#[derive(Debug, Clone)]
pub struct MultiProjectionConfig {
    /// Trailing interval in which events may still arrive out of order.
    /// Default: 20 seconds.
    pub safe_window: Duration,
    /// Events read per catch-up batch. Default: 3000.
    pub batch_size: usize,
    /// Consecutive empty batches that complete catch-up. Default: 5.
    pub max_consecutive_empty_batches: u32,
    /// How long the live feed collects events before folding them.
    /// Default: 50 ms.
    pub live_flush_delay: Duration,
    /// Persist progress every this many events during catch-up.
    /// Default: 5000.
    pub persist_every_events: u64,
    /// Event ids remembered for deduplication. Default: 200 000.
    pub processed_id_cache_size: usize,
    /// Live events held while catch-up runs. Default: 50 000.
    pub max_pending_stream_events: usize,
    /// Serialized states larger than this are offloaded to blob storage.
    /// Default: 1 000 000 bytes.
    pub offload_threshold_bytes: usize,
    /// Above this many events an empty payload blocks persistence.
    /// Default: 100.
    pub persist_guard_min_events: u64,
    /// Retries after a persistence write conflict. Default: 3.
    pub persist_retry_attempts: u32,
    /// Backoff unit between persistence retries, multiplied by the attempt
    /// number. Default: 50 ms.
    pub persist_retry_backoff: Duration,
    /// Batch limit of one [`refresh`](MultiProjectionActor::refresh).
    /// Default: 20 000.
    pub refresh_max_batches: usize,
    /// Period of the scheduled catch-up tick. Default: 1 second.
    pub catch_up_interval: Duration,
    /// Period of the scheduled persist. Default: 5 minutes.
    pub persist_interval: Duration,
    /// Widen the safe window by the observed live lag. Default: off.
    pub dynamic_safe_window: bool,
    /// Cap on the extra window added by lag tracking. Default: 30 seconds.
    pub max_extra_safe_window: Duration,
    /// Smoothing factor of the lag moving average. Default: 0.3.
    pub lag_ema_alpha: f64,
    /// Per-second decay of tracked lag. Default: 0.98.
    pub lag_decay_per_second: f64,
}

impl MultiProjectionConfig {
    /// Set the safe window.
    pub fn safe_window(mut self, window: Duration) -> Self {
        self.safe_window = window;
        self
    }

    /// Set the catch-up batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set how many consecutive empty batches complete catch-up.
    pub fn max_consecutive_empty_batches(mut self, count: u32) -> Self {
        self.max_consecutive_empty_batches = count.max(1);
        self
    }

    /// Set the live flush delay.
    pub fn live_flush_delay(mut self, delay: Duration) -> Self {
        self.live_flush_delay = delay;
        self
    }

    /// Set the catch-up persistence interval, in events.
    pub fn persist_every_events(mut self, events: u64) -> Self {
        self.persist_every_events = events;
        self
    }

    /// Set the deduplication cache size.
    pub fn processed_id_cache_size(mut self, size: usize) -> Self {
        self.processed_id_cache_size = size;
        self
    }

    /// Set the pending live event limit.
    pub fn max_pending_stream_events(mut self, count: usize) -> Self {
        self.max_pending_stream_events = count;
        self
    }

    /// Set the offload threshold.
    pub fn offload_threshold_bytes(mut self, bytes: usize) -> Self {
        self.offload_threshold_bytes = bytes;
        self
    }

    /// Set the event count above which an empty payload blocks persistence.
    pub fn persist_guard_min_events(mut self, events: u64) -> Self {
        self.persist_guard_min_events = events;
        self
    }

    /// Set the conflict retry count and backoff unit.
    pub fn persist_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_retry_attempts = attempts;
        self.persist_retry_backoff = backoff;
        self
    }

    /// Set the refresh batch limit.
    pub fn refresh_max_batches(mut self, batches: usize) -> Self {
        self.refresh_max_batches = batches;
        self
    }

    /// Set the catch-up tick period.
    pub fn catch_up_interval(mut self, interval: Duration) -> Self {
        self.catch_up_interval = interval;
        self
    }

    /// Set the persist timer period.
    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    /// Enable lag-driven widening of the safe window, capped at `max_extra`.
    pub fn dynamic_safe_window(mut self, max_extra: Duration) -> Self {
        self.dynamic_safe_window = true;
        self.max_extra_safe_window = max_extra;
        self
    }

    /// Set the lag smoothing factor and per-second decay.
    pub fn lag_tracking(mut self, ema_alpha: f64, decay_per_second: f64) -> Self {
        self.lag_ema_alpha = ema_alpha.clamp(0.0, 1.0);
        self.lag_decay_per_second = decay_per_second.clamp(0.0, 1.0);
        self
    }
}

impl Default for MultiProjectionConfig {
    fn default() -> Self {
        Self {
            safe_window: Duration::from_secs(20),
            batch_size: 3000,
            max_consecutive_empty_batches: 5,
            live_flush_delay: Duration::from_millis(50),
            persist_every_events: 5000,
            processed_id_cache_size: 200_000,
            max_pending_stream_events: 50_000,
            offload_threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
            persist_guard_min_events: 100,
            persist_retry_attempts: 3,
            persist_retry_backoff: Duration::from_millis(50),
            refresh_max_batches: 20_000,
            catch_up_interval: Duration::from_secs(1),
            persist_interval: Duration::from_secs(300),
            dynamic_safe_window: false,
            max_extra_safe_window: Duration::from_secs(30),
            lag_ema_alpha: 0.3,
            lag_decay_per_second: 0.98,
        }
    }
}

/// Lifecycle phase of a multi-projection actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not activated yet.
    Idle,
    /// Reading the log in batches.
    CatchingUp,
    /// Folding events pushed by the live feed.
    Live,
}

/// Where events passed to [`add_events`](MultiProjectionActor::add_events)
/// came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Read from the event store by catch-up.
    CatchUp,
    /// Pushed by the live feed.
    Stream,
}

/// Catch-up bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatchUpProgress {
    /// Read cursor: the last position returned by the store.
    pub current_position: SortableUniqueId,
    /// A catch-up run is in progress.
    pub is_active: bool,
    /// Empty batches seen in a row.
    pub consecutive_empty_batches: u32,
    /// Batches read since activation.
    pub batches_processed: u64,
    /// Start of the first catch-up run.
    pub started_at: Option<DateTime<Utc>>,
    /// Last completed batch read.
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Diagnostic snapshot of an actor.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchUpStatus {
    /// Current phase.
    pub phase: Phase,
    /// The actor is live.
    pub is_caught_up: bool,
    /// Catch-up bookkeeping.
    pub progress: CatchUpProgress,
    /// Live events waiting for catch-up to finish.
    pub pending_events: usize,
    /// Events applied to the unsafe copy but not yet safe.
    pub buffered_events: usize,
    /// Version of the safe copy.
    pub safe_version: u64,
    /// Version of the unsafe copy.
    pub unsafe_version: u64,
    /// Safe window in effect, including any lag extension.
    pub safe_window: Duration,
}

/// Result of [`persist`](MultiProjectionActor::persist).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The safe state was written.
    Persisted {
        /// Version written.
        version: u64,
        /// The state went to blob storage.
        offloaded: bool,
    },
    /// No state store is configured.
    NotConfigured,
    /// The durable record already holds a later state.
    StoreAhead {
        /// Events processed by the stored record.
        stored_version: u64,
    },
}

/// Observed lag of live events, decayed over time.
#[derive(Debug, Default)]
struct LagTracker {
    ema_ms: f64,
    max_ms: f64,
    observed_at: Option<Instant>,
}

impl LagTracker {
    fn decay_factor(&self, decay_per_second: f64) -> f64 {
        self.observed_at
            .map_or(1.0, |at| decay_per_second.powf(at.elapsed().as_secs_f64()))
    }

    fn observe(&mut self, lag: Duration, alpha: f64, decay_per_second: f64) {
        let factor = self.decay_factor(decay_per_second);
        let lag_ms = lag.as_secs_f64() * 1000.0;
        self.ema_ms = match self.observed_at {
            None => lag_ms,
            Some(_) => alpha * lag_ms + (1.0 - alpha) * self.ema_ms * factor,
        };
        self.max_ms = (self.max_ms * factor).max(lag_ms);
        self.observed_at = Some(Instant::now());
    }

    fn extra(&self, decay_per_second: f64, cap: Duration) -> Duration {
        let factor = self.decay_factor(decay_per_second);
        let ms = (self.ema_ms * factor).max(self.max_ms * factor);
        Duration::try_from_secs_f64(ms / 1000.0)
            .unwrap_or_default()
            .min(cap)
    }
}

struct Inner<P> {
    dual: DualState<P>,
    phase: Phase,
    progress: CatchUpProgress,
    pending: BTreeMap<(SortableUniqueId, Uuid), Event>,
    events_since_persist: u64,
    last_persisted_version: u64,
    /// Revision of a stored record refused on activation; persist may
    /// overwrite it even though it claims more events.
    rejected_revision: Option<u64>,
    lag: LagTracker,
}

impl<P: MultiProjector> Inner<P> {
    fn new(capacity: usize) -> Self {
        Self {
            dual: DualState::new(capacity),
            phase: Phase::Idle,
            progress: CatchUpProgress::default(),
            pending: BTreeMap::new(),
            events_since_persist: 0,
            last_persisted_version: 0,
            rejected_revision: None,
            lag: LagTracker::default(),
        }
    }

    fn apply(&mut self, events: &[Event], threshold: &SortableUniqueId) -> u64 {
        let mut applied = 0;
        for event in events {
            if self.dual.process(event, threshold) {
                applied += 1;
            }
        }
        self.events_since_persist += applied;
        applied
    }
}

/// Maintains projector `P` over every event in the store.
pub struct MultiProjectionActor<P: MultiProjector> {
    event_store: Arc<dyn EventStore>,
    state_store: Option<Arc<dyn MultiProjectionStateStore>>,
    blob: Option<Arc<dyn BlobSnapshotAccessor>>,
    config: MultiProjectionConfig,
    inner: Mutex<Inner<P>>,
    caught_up: AtomicBool,
    activated: AtomicBool,
    activation_lock: tokio::sync::Mutex<()>,
    catch_up_gate: tokio::sync::Mutex<()>,
    persist_gate: tokio::sync::Mutex<()>,
}

impl<P: MultiProjector> MultiProjectionActor<P> {
    /// Create an idle actor reading from `event_store`.
    pub fn new(event_store: Arc<dyn EventStore>, config: MultiProjectionConfig) -> Self {
        Self {
            event_store,
            state_store: None,
            blob: None,
            inner: Mutex::new(Inner::new(config.processed_id_cache_size)),
            config,
            caught_up: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            activation_lock: tokio::sync::Mutex::new(()),
            catch_up_gate: tokio::sync::Mutex::new(()),
            persist_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore from and persist to `store`.
    pub fn with_state_store(mut self, store: Arc<dyn MultiProjectionStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Offload large snapshots created by
    /// [`create_snapshot`](Self::create_snapshot) to `blob`.
    pub fn with_blob_accessor(mut self, blob: Arc<dyn BlobSnapshotAccessor>) -> Self {
        self.blob = Some(blob);
        self
    }

    /// The actor's configuration.
    pub fn config(&self) -> &MultiProjectionConfig {
        &self.config
    }

    /// Returns `true` while the actor is live.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().expect("multi projection lock poisoned")
    }

    fn blob(&self) -> Option<&dyn BlobSnapshotAccessor> {
        self.blob
            .as_deref()
            .or_else(|| self.state_store.as_ref().and_then(|s| s.blob_accessor()))
    }

    fn safe_window(&self, lag: &LagTracker) -> Duration {
        let mut window = self.config.safe_window;
        if self.config.dynamic_safe_window {
            window += lag.extra(
                self.config.lag_decay_per_second,
                self.config.max_extra_safe_window,
            );
        }
        window
    }

    fn threshold(&self, lag: &LagTracker) -> SortableUniqueId {
        let window = chrono::Duration::from_std(self.safe_window(lag))
            .unwrap_or_else(|_| chrono::Duration::seconds(20));
        SortableUniqueId::safe_threshold(Utc::now() - window)
    }

    /// Load the persisted state, if any, and enter catch-up. Runs once;
    /// later calls return immediately.
    ///
    /// A persisted record that fails validation is logged and ignored, so
    /// the projection rebuilds from the start of the log and the next
    /// persist overwrites it.
    ///
    /// # Errors
    ///
    /// Propagates state store read failures.
    pub async fn activate(&self) -> Result<(), DcbError> {
        if self.activated.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.activation_lock.lock().await;
        if self.activated.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(store) = &self.state_store
            && let Some(record) = store.get_latest_for_version(P::NAME, P::VERSION).await?
        {
            match Self::load_record(&record, store.as_ref()).await {
                Ok(view) => {
                    tracing::info!(
                        projector = P::NAME,
                        version = view.version,
                        position = %view.last_sortable_unique_id,
                        "restored persisted projection state"
                    );
                    self.reset_to(view);
                }
                Err(e) => {
                    tracing::warn!(
                        projector = P::NAME,
                        error = %e,
                        revision = record.revision,
                        "persisted projection state rejected; rebuilding from the log"
                    );
                    self.lock().rejected_revision = Some(record.revision);
                }
            }
        }

        {
            let mut inner = self.lock();
            if inner.phase == Phase::Idle {
                inner.phase = Phase::CatchingUp;
            }
        }
        self.activated.store(true, Ordering::Release);
        Ok(())
    }

    async fn load_record(
        record: &MultiProjectionStateRecord,
        store: &dyn MultiProjectionStateStore,
    ) -> Result<ProjectedView<P>, DcbError> {
        let state = record.load_state(store.blob_accessor()).await?;
        if record.events_processed > 0 && state.version == 0 {
            return Err(DcbError::InvalidSnapshot(format!(
                "record claims {} events but its state version is 0",
                record.events_processed
            )));
        }
        state.to_view::<P>()
    }

    fn reset_to(&self, view: ProjectedView<P>) {
        let mut inner = self.lock();
        inner.progress = CatchUpProgress {
            current_position: view.last_sortable_unique_id.clone(),
            ..CatchUpProgress::default()
        };
        inner.last_persisted_version = view.version;
        inner.events_since_persist = 0;
        inner.pending.clear();
        inner.dual = DualState::from_safe(view, self.config.processed_id_cache_size);
        inner.phase = Phase::CatchingUp;
        self.caught_up.store(false, Ordering::Release);
    }

    /// One scheduled step. Activates if needed, then runs catch-up unless
    /// the actor is live or a run is already in progress.
    ///
    /// Failures are logged; the next tick retries.
    pub async fn catch_up_tick(&self) {
        if let Err(e) = self.activate().await {
            tracing::warn!(projector = P::NAME, error = %e, "activation failed");
            return;
        }
        let live = self.lock().phase == Phase::Live;
        if live {
            let mut inner = self.lock();
            let threshold = self.threshold(&inner.lag);
            inner.dual.promote(&threshold);
            return;
        }
        let Ok(_gate) = self.catch_up_gate.try_lock() else {
            tracing::debug!(projector = P::NAME, "catch-up already running");
            return;
        };
        if let Err(e) = self.catch_up_loop(usize::MAX).await {
            tracing::warn!(
                projector = P::NAME,
                error = %e,
                "catch-up batch failed; retrying on next tick"
            );
        }
    }

    /// Run catch-up in the calling task, bounded by
    /// `refresh_max_batches`. Waits for a run already in progress.
    ///
    /// Returns `true` if catch-up completed.
    ///
    /// # Errors
    ///
    /// Propagates event store and state store read failures.
    pub async fn refresh(&self) -> Result<bool, DcbError> {
        self.activate().await?;
        let _gate = self.catch_up_gate.lock().await;
        self.catch_up_loop(self.config.refresh_max_batches).await
    }

    /// Mark a gap in the live feed. The actor re-enters catch-up from its
    /// safe position on the next tick.
    pub fn request_catch_up(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.phase != Phase::Live {
            return;
        }
        inner.phase = Phase::CatchingUp;
        inner.progress.current_position = inner.dual.safe().last_sortable_unique_id.clone();
        inner.progress.consecutive_empty_batches = 0;
        self.caught_up.store(false, Ordering::Release);
        tracing::warn!(projector = P::NAME, "gap detected; re-entering catch-up");
    }

    async fn catch_up_loop(&self, max_batches: usize) -> Result<bool, DcbError> {
        {
            let mut inner = self.lock();
            inner.phase = Phase::CatchingUp;
            inner.progress.is_active = true;
            inner.progress.consecutive_empty_batches = 0;
            inner.progress.started_at.get_or_insert_with(Utc::now);
        }
        self.caught_up.store(false, Ordering::Release);

        for _ in 0..max_batches {
            let since = self.lock().progress.current_position.clone();
            let since = (!since.is_empty()).then_some(since);
            let events = self
                .event_store
                .read_all_events(since.as_ref(), Some(self.config.batch_size))
                .await?;
            let (complete, persist_due) = self.apply_catch_up_batch(&events);

            if persist_due && let Err(e) = self.persist().await {
                tracing::warn!(projector = P::NAME, error = %e, "catch-up persist failed");
            }
            if complete {
                self.complete_catch_up().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn apply_catch_up_batch(&self, events: &[Event]) -> (bool, bool) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.progress.batches_processed += 1;
        inner.progress.last_attempt = Some(Utc::now());

        if events.is_empty() {
            inner.progress.consecutive_empty_batches += 1;
        } else {
            inner.progress.consecutive_empty_batches = 0;
            let threshold = self.threshold(&inner.lag);
            let applied = inner.apply(events, &threshold);
            if let Some(last) = events.last() {
                inner.progress.current_position = last.sortable_unique_id.clone();
            }
            tracing::debug!(
                projector = P::NAME,
                read = events.len(),
                applied,
                position = %inner.progress.current_position,
                "catch-up batch applied"
            );
        }

        let complete = inner.progress.consecutive_empty_batches
            >= self.config.max_consecutive_empty_batches;
        let persist_due = !complete && inner.events_since_persist >= self.config.persist_every_events;
        (complete, persist_due)
    }

    async fn complete_catch_up(&self) {
        let (replayed, version) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let threshold = self.threshold(&inner.lag);
            let pending: Vec<Event> = std::mem::take(&mut inner.pending).into_values().collect();
            let replayed = inner.apply(&pending, &threshold);
            inner.dual.promote(&threshold);
            inner.phase = Phase::Live;
            inner.progress.is_active = false;
            inner.progress.consecutive_empty_batches = 0;
            (replayed, inner.dual.unsafe_view().version)
        };
        self.caught_up.store(true, Ordering::Release);
        tracing::info!(projector = P::NAME, version, replayed, "catch-up complete");

        if let Err(e) = self.persist().await {
            tracing::warn!(projector = P::NAME, error = %e, "persist after catch-up failed");
        }
    }

    /// Fold `events`. Returns how many were new.
    ///
    /// Stream events that arrive before the actor is live are queued (only
    /// those past the read cursor, up to `max_pending_stream_events`) and
    /// replayed in position order when catch-up completes.
    /// `finished_catch_up` completes catch-up after folding.
    pub async fn add_events(
        &self,
        events: Vec<Event>,
        finished_catch_up: bool,
        source: EventSource,
    ) -> u64 {
        let applied = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if source == EventSource::Stream && inner.phase != Phase::Live {
                self.enqueue_pending(inner, events);
                0
            } else {
                if source == EventSource::Stream && self.config.dynamic_safe_window {
                    self.observe_lag(inner, &events);
                }
                let threshold = self.threshold(&inner.lag);
                let applied = inner.apply(&events, &threshold);
                if source == EventSource::CatchUp
                    && let Some(last) = events.iter().map(|e| &e.sortable_unique_id).max()
                    && *last > inner.progress.current_position
                {
                    inner.progress.current_position = last.clone();
                }
                applied
            }
        };
        if finished_catch_up {
            self.complete_catch_up().await;
        }
        applied
    }

    fn enqueue_pending(&self, inner: &mut Inner<P>, events: Vec<Event>) {
        let mut dropped = 0usize;
        for event in events {
            if event.sortable_unique_id <= inner.progress.current_position
                || inner.dual.has_seen(&event.id)
            {
                continue;
            }
            if inner.pending.len() >= self.config.max_pending_stream_events {
                dropped += 1;
                continue;
            }
            inner
                .pending
                .insert((event.sortable_unique_id.clone(), event.id), event);
        }
        if dropped > 0 {
            tracing::warn!(
                projector = P::NAME,
                dropped,
                "pending stream queue full; catch-up will read the dropped events"
            );
        }
    }

    fn observe_lag(&self, inner: &mut Inner<P>, events: &[Event]) {
        let now = Utc::now();
        let lag = events
            .iter()
            .filter_map(|e| e.sortable_unique_id.timestamp())
            .map(|at| (now - at).to_std().unwrap_or_default())
            .max();
        if let Some(lag) = lag {
            inner.lag.observe(
                lag,
                self.config.lag_ema_alpha,
                self.config.lag_decay_per_second,
            );
        }
    }

    /// The projection. `can_get_unsafe` selects the copy that includes
    /// events still inside the safe window.
    ///
    /// Buffered events that have crossed the threshold are promoted first,
    /// so the safe copy advances with time alone.
    ///
    /// # Errors
    ///
    /// Propagates activation failures.
    pub async fn get_state(
        &self,
        can_get_unsafe: bool,
    ) -> Result<MultiProjectionState<P>, DcbError> {
        self.activate().await?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let threshold = self.threshold(&inner.lag);
        inner.dual.promote(&threshold);
        let buffered = inner.dual.buffered();
        let view = if can_get_unsafe {
            inner.dual.unsafe_view()
        } else {
            inner.dual.safe()
        };
        Ok(MultiProjectionState {
            payload: view.payload.clone(),
            projector_name: P::NAME.to_string(),
            projector_version: P::VERSION.to_string(),
            last_sortable_unique_id: view.last_sortable_unique_id.clone(),
            last_event_id: view.last_event_id,
            version: view.version,
            is_caught_up: self.is_caught_up(),
            is_safe_state: !can_get_unsafe || buffered == 0,
        })
    }

    /// Serialize the projection into an envelope, offloading it when it
    /// exceeds `offload_threshold_bytes` and a blob accessor is available.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Serialization`] or blob write failures.
    pub async fn create_snapshot(&self, can_get_unsafe: bool) -> Result<SnapshotEnvelope, DcbError> {
        let state = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let threshold = self.threshold(&inner.lag);
            inner.dual.promote(&threshold);
            let (view, is_safe) = if can_get_unsafe {
                (inner.dual.unsafe_view(), inner.dual.buffered() == 0)
            } else {
                (inner.dual.safe(), true)
            };
            SerializableMultiProjectionState::from_view(view, self.is_caught_up(), is_safe)?
        };
        SnapshotEnvelope::build(state, self.config.offload_threshold_bytes, self.blob()).await
    }

    /// Replace the projection with a snapshot and catch up from its
    /// position.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::InvalidSnapshot`] when the snapshot belongs to
    /// another projector version or is inconsistent. The projection is
    /// then reset and rebuilt from the start of the log.
    pub async fn restore_snapshot(&self, envelope: SnapshotEnvelope) -> Result<(), DcbError> {
        let restored = match envelope.into_inline(self.blob()).await {
            Ok(state) => state.to_view::<P>(),
            Err(e) => Err(e),
        };
        self.activated.store(true, Ordering::Release);
        match restored {
            Ok(view) => {
                tracing::info!(projector = P::NAME, version = view.version, "snapshot restored");
                self.reset_to(view);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    projector = P::NAME,
                    error = %e,
                    "snapshot rejected; forcing full catch-up"
                );
                self.reset_to(ProjectedView::default());
                Err(e)
            }
        }
    }

    /// Write the safe projection to the state store.
    ///
    /// Refuses to persist an empty payload that claims more than
    /// `persist_guard_min_events` events, or a version below the last one
    /// persisted. Skips the write if the stored record is ahead, unless
    /// that record was refused on activation. Write
    /// conflicts are retried with a fresh read.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::PersistBlocked`] when a guard trips and
    /// [`DcbError::WriteConflict`] once retries are exhausted.
    pub async fn persist(&self) -> Result<PersistOutcome, DcbError> {
        let Some(store) = self.state_store.clone() else {
            return Ok(PersistOutcome::NotConfigured);
        };
        let _gate = self.persist_gate.lock().await;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let (state, threshold, last_persisted) = self.persistable_state()?;
            self.check_persist_guards(&state, last_persisted)?;

            let existing = store.get_latest_for_version(P::NAME, P::VERSION).await?;
            let rejected = self.lock().rejected_revision;
            if let Some(existing) = &existing
                && rejected != Some(existing.revision)
                && existing.events_processed > state.version
            {
                tracing::debug!(
                    projector = P::NAME,
                    stored = existing.events_processed,
                    version = state.version,
                    "stored projection is ahead; skipping persist"
                );
                return Ok(PersistOutcome::StoreAhead {
                    stored_version: existing.events_processed,
                });
            }

            let mut record = MultiProjectionStateRecord::new(&state, threshold, BUILD_SOURCE)?;
            if let Some(existing) = &existing {
                record.revision = existing.revision;
                record.created_at = existing.created_at;
            }

            match store.upsert(record, self.config.offload_threshold_bytes).await {
                Ok(stored) => {
                    {
                        let mut inner = self.lock();
                        inner.last_persisted_version = state.version;
                        inner.events_since_persist = 0;
                        inner.rejected_revision = None;
                    }
                    tracing::info!(
                        projector = P::NAME,
                        version = state.version,
                        offloaded = stored.is_offloaded,
                        size = stored.payload_size_bytes,
                        "projection persisted"
                    );
                    return Ok(PersistOutcome::Persisted {
                        version: state.version,
                        offloaded: stored.is_offloaded,
                    });
                }
                Err(DcbError::WriteConflict { .. })
                    if attempt <= self.config.persist_retry_attempts =>
                {
                    tracing::warn!(
                        projector = P::NAME,
                        attempt,
                        "persist write conflict; retrying"
                    );
                    tokio::time::sleep(self.config.persist_retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn persistable_state(
        &self,
    ) -> Result<(SerializableMultiProjectionState, SortableUniqueId, u64), DcbError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let threshold = self.threshold(&inner.lag);
        inner.dual.promote(&threshold);
        let state =
            SerializableMultiProjectionState::from_view(inner.dual.safe(), self.is_caught_up(), true)?;
        Ok((state, threshold, inner.last_persisted_version))
    }

    fn check_persist_guards(
        &self,
        state: &SerializableMultiProjectionState,
        last_persisted: u64,
    ) -> Result<(), DcbError> {
        if state.version > self.config.persist_guard_min_events && payload_is_empty(&state.payload) {
            return Err(DcbError::PersistBlocked(format!(
                "{} events processed but the payload is empty",
                state.version
            )));
        }
        if state.version < last_persisted {
            return Err(DcbError::PersistBlocked(format!(
                "safe version {} is behind persisted version {last_persisted}",
                state.version
            )));
        }
        Ok(())
    }

    /// Catch-up bookkeeping and buffer sizes.
    pub fn catch_up_status(&self) -> CatchUpStatus {
        let inner = self.lock();
        CatchUpStatus {
            phase: inner.phase,
            is_caught_up: self.is_caught_up(),
            progress: inner.progress.clone(),
            pending_events: inner.pending.len(),
            buffered_events: inner.dual.buffered(),
            safe_version: inner.dual.safe().version,
            unsafe_version: inner.dual.unsafe_view().version,
            safe_window: self.safe_window(&inner.lag),
        }
    }

    /// Returns `true` if the unsafe copy has reached `id`.
    pub fn is_sortable_unique_id_received(&self, id: &SortableUniqueId) -> bool {
        id.is_empty() || self.lock().dual.unsafe_view().last_sortable_unique_id >= *id
    }

    /// Position of the last event in the safe copy.
    pub fn safe_last_sortable_unique_id(&self) -> SortableUniqueId {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let threshold = self.threshold(&inner.lag);
        inner.dual.promote(&threshold);
        inner.dual.safe().last_sortable_unique_id.clone()
    }

    /// Register the catch-up tick and the persist timer with `scheduler`.
    /// Dropping the returned tasks stops both.
    pub fn start(self: &Arc<Self>, scheduler: &dyn Scheduler) -> Vec<ScheduledTask> {
        let tick_actor = Arc::clone(self);
        let tick: ScheduledJob = Arc::new(move || {
            let actor = Arc::clone(&tick_actor);
            async move { actor.catch_up_tick().await }.boxed()
        });
        let persist_actor = Arc::clone(self);
        let persist: ScheduledJob = Arc::new(move || {
            let actor = Arc::clone(&persist_actor);
            async move {
                if let Err(e) = actor.persist().await {
                    tracing::warn!(projector = P::NAME, error = %e, "scheduled persist failed");
                }
            }
            .boxed()
        });

        vec![
            scheduler.schedule(
                &format!("{}:catch-up", P::NAME),
                Duration::ZERO,
                self.config.catch_up_interval,
                tick,
            ),
            scheduler.schedule(
                &format!("{}:persist", P::NAME),
                self.config.persist_interval,
                self.config.persist_interval,
                persist,
            ),
        ]
    }
}

/// A payload with no structure at all: nothing, JSON null, or an empty
/// object or array. A default-valued state is still a real state.
fn payload_is_empty(payload: &[u8]) -> bool {
    matches!(payload.trim_ascii(), b"" | b"null" | b"{}" | b"[]")
}
