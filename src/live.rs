//! Live feed: pushes newly written events into a multi-projection actor.
//!
//! [`spawn_live_feed`] drains a broadcast of written events, collects them
//! for the actor's `live_flush_delay`, and folds each batch with
//! [`EventSource::Stream`]. A lagged receiver means events were skipped, so
//! the actor is told to re-enter catch-up. [`LiveHandle`] stops the loop.

use std::io;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::error::DcbError;
use crate::event::Event;
use crate::event_store::InMemoryEventStore;
use crate::multi_projection::{EventSource, MultiProjectionActor};
use crate::projection::MultiProjector;

/// Handle for controlling a live feed.
///
/// Dropping the handle does **not** stop the loop -- call
/// [`shutdown`](LiveHandle::shutdown) to stop it and fold whatever is still
/// buffered. `Clone` is cheap.
#[derive(Clone)]
pub struct LiveHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LiveHandle {
    /// Returns `true` once the loop has exited, either after shutdown or
    /// because the stream ended.
    pub async fn is_finished(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Signal the loop to stop and wait for it to flush and exit.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::Io`] if the loop task panicked.
    pub async fn shutdown(&self) -> Result<(), DcbError> {
        // The receiver is gone if the loop already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("live feed task panicked: {e}")))?;
        }
        Ok(())
    }
}

/// Feed `stream` into `actor` until the stream ends or the handle shuts it
/// down.
pub fn spawn_live_feed<P, S>(actor: Arc<MultiProjectionActor<P>>, stream: S) -> LiveHandle
where
    P: MultiProjector,
    S: Stream<Item = Result<Event, BroadcastStreamRecvError>> + Send + Unpin + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_live_loop(actor, stream, shutdown_rx));
    LiveHandle {
        shutdown_tx,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

/// Subscribe `actor` to every event written to `store` from now on.
pub fn subscribe_live<P: MultiProjector>(
    actor: Arc<MultiProjectionActor<P>>,
    store: &InMemoryEventStore,
) -> LiveHandle {
    spawn_live_feed(actor, BroadcastStream::new(store.subscribe()))
}

async fn run_live_loop<P, S>(
    actor: Arc<MultiProjectionActor<P>>,
    mut stream: S,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    P: MultiProjector,
    S: Stream<Item = Result<Event, BroadcastStreamRecvError>> + Unpin,
{
    let flush_delay = actor.config().live_flush_delay;
    let mut buffer: Vec<Event> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    buffer.push(event);
                    deadline.get_or_insert_with(|| Instant::now() + flush_delay);
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(projector = P::NAME, skipped, "live feed lagged");
                    actor.request_catch_up();
                }
                None => {
                    tracing::debug!(projector = P::NAME, "live stream ended");
                    break;
                }
            },
            _ = wait_until(deadline) => {
                deadline = None;
                flush(&actor, &mut buffer).await;
            }
            Ok(()) = shutdown_rx.changed() => {
                tracing::info!(projector = P::NAME, "shutdown signal received, stopping live feed");
                break;
            }
        }
    }
    flush(&actor, &mut buffer).await;
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn flush<P: MultiProjector>(actor: &MultiProjectionActor<P>, buffer: &mut Vec<Event>) {
    if buffer.is_empty() {
        return;
    }
    let events = std::mem::take(buffer);
    let received = events.len();
    let applied = actor.add_events(events, false, EventSource::Stream).await;
    tracing::debug!(projector = P::NAME, received, applied, "live batch folded");
}
