//! Collection engine: runs an event source on its own task and hands every
//! event to a caller-supplied sink.
//!
//! A run walks the requested channels in order, reads the events of each one
//! inside the lookback window and delivers them one by one. The stop signal is
//! checked before every delivery, so a stopped run delivers a prefix of what
//! an uninterrupted run would have delivered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::Event;
use crate::source::{CollectError, EventSource, TimeWindow};

/// How long `stop` waits for the run task before aborting it.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiver of collected events.
///
/// `deliver` is called synchronously from the engine task, once per event and
/// in collection order. It must not block for long; errors are the sink's own
/// business and never reach the engine.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn deliver(&self, event: Event) {
        self(event)
    }
}

/// Sink that forwards events into a bounded tokio channel.
///
/// Uses `try_send`, so the engine never waits on a slow reader; events that do
/// not fit are dropped with a warning.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    /// Create a sink and the receiver the caller reads events from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: Event) {
        let id = event.id;
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event_id = id, "Sink channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event_id = id, "Sink channel closed, dropping event");
            }
        }
    }
}

/// Parameters of one collection run.
#[derive(Clone)]
pub struct CollectionRequest {
    categories: Vec<String>,
    lookback: Duration,
    follow: Option<Duration>,
    sink: Arc<dyn EventSink>,
}

impl CollectionRequest {
    /// Build a request. Duplicate categories are removed, first occurrence wins.
    pub fn new<I, S>(categories: I, lookback: Duration, sink: Arc<dyn EventSink>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for category in categories {
            let category = category.into();
            if !unique.contains(&category) {
                unique.push(category);
            }
        }

        Self {
            categories: unique,
            lookback,
            follow: None,
            sink,
        }
    }

    /// Keep polling for new events every `interval` once the lookback window
    /// has been read, until the run is stopped.
    pub fn with_follow(mut self, interval: Duration) -> Self {
        self.follow = Some(interval);
        self
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    pub fn follow(&self) -> Option<Duration> {
        self.follow
    }

    /// Check the request can be run.
    pub fn validate(&self) -> Result<(), CollectError> {
        if self.categories.is_empty() {
            return Err(CollectError::InvalidRequest(
                "at least one category is required".to_string(),
            ));
        }
        if self.lookback.is_zero() {
            return Err(CollectError::InvalidRequest(
                "lookback duration must be greater than zero".to_string(),
            ));
        }
        if matches!(self.follow, Some(interval) if interval.is_zero()) {
            return Err(CollectError::InvalidRequest(
                "follow interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CollectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionRequest")
            .field("categories", &self.categories)
            .field("lookback", &self.lookback)
            .field("follow", &self.follow)
            .finish_non_exhaustive()
    }
}

/// Value of the active run slot when no run is in progress.
const IDLE: u64 = 0;

/// Handle on the task of the active run.
struct ActiveRun {
    id: u64,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs collection requests against an [`EventSource`], one at a time.
pub struct CollectionEngine<S: EventSource> {
    source: Arc<S>,
    /// Id of the run in progress, or `IDLE`
    current: Arc<AtomicU64>,
    next_id: AtomicU64,
    active: Mutex<Option<ActiveRun>>,
    stop_timeout: Duration,
}

impl<S: EventSource> CollectionEngine<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
            current: Arc::new(AtomicU64::new(IDLE)),
            next_id: AtomicU64::new(IDLE + 1),
            active: Mutex::new(None),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Override how long `stop` waits for the run to finish.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.current.load(Ordering::SeqCst) != IDLE
    }

    /// Start a collection run in the background.
    ///
    /// Returns `false` without changing anything when a run is already active
    /// or the request is invalid. Must be called from within a tokio runtime.
    pub fn start(&self, request: CollectionRequest) -> bool {
        if let Err(e) = request.validate() {
            warn!(error = %e, "Rejecting collection request");
            return false;
        }

        let mut active = self.active.lock();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self
            .current
            .compare_exchange(IDLE, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Collection already running");
            return false;
        }

        info!(
            categories = ?request.categories(),
            lookback_secs = request.lookback().as_secs(),
            follow_secs = ?request.follow().map(|d| d.as_secs()),
            "Starting collection"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_collection(
            self.source.clone(),
            request,
            RunningGuard {
                current: self.current.clone(),
                id,
            },
            stop_rx,
        ));

        *active = Some(ActiveRun { id, stop_tx, handle });
        true
    }

    /// Stop the active run, waiting up to the stop timeout for it to end.
    ///
    /// Does nothing when no run was started. Once this returns the sink is
    /// not invoked again by the stopped run.
    pub async fn stop(&self) {
        let run = self.active.lock().take();
        let Some(ActiveRun { id, stop_tx, mut handle }) = run else {
            return;
        };

        let _ = stop_tx.send(true);

        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Collection task failed");
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis(),
                    "Collection task did not stop in time, aborting"
                );
                handle.abort();
            }
        }

        // Only release the slot if it still belongs to this run
        let _ = self
            .current
            .compare_exchange(id, IDLE, Ordering::SeqCst, Ordering::SeqCst);
        info!("Collection stopped");
    }
}

impl<S: EventSource> Drop for CollectionEngine<S> {
    fn drop(&mut self) {
        if let Some(run) = self.active.get_mut().take() {
            let _ = run.stop_tx.send(true);
            run.handle.abort();
        }
    }
}

/// Releases the active run slot when the run task ends, however it ends.
///
/// A guard dropped late (after an aborted run was replaced) leaves the slot
/// of the newer run untouched.
struct RunningGuard {
    current: Arc<AtomicU64>,
    id: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let _ = self
            .current
            .compare_exchange(self.id, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Body of a collection run.
async fn run_collection<S: EventSource>(
    source: Arc<S>,
    request: CollectionRequest,
    guard: RunningGuard,
    mut stop_rx: watch::Receiver<bool>,
) {
    let _guard = guard;
    let pacing = source.pacing();
    let mut window = TimeWindow::lookback(Utc::now(), request.lookback());
    let mut delivered: u64 = 0;

    'run: loop {
        debug!(start = %window.start, end = %window.end, "Collecting window");

        for category in request.categories() {
            if *stop_rx.borrow() {
                break 'run;
            }

            let Some(channel) = source.resolve(category) else {
                warn!(category = %category, "Skipping unknown category");
                continue;
            };

            let events = match source.read(&channel, &window).await {
                Ok(events) => events,
                Err(e) => {
                    error!(category = %category, channel = %channel, error = %e, "Failed to read channel, skipping");
                    continue;
                }
            };

            debug!(channel = %channel, count = events.len(), "Read channel");

            for event in events {
                if *stop_rx.borrow() {
                    break 'run;
                }

                deliver(request.sink.as_ref(), event);
                delivered += 1;

                if !pacing.is_zero() {
                    tokio::select! {
                        _ = stop_rx.changed() => break 'run,
                        _ = tokio::time::sleep(pacing) => {}
                    }
                }
            }
        }

        let Some(interval) = request.follow() else {
            break;
        };

        tokio::select! {
            _ = stop_rx.changed() => break 'run,
            _ = tokio::time::sleep(interval) => {}
        }
        window = TimeWindow::new(window.end, Utc::now());
    }

    info!(delivered = delivered, "Collection finished");
}

/// Hand one event to the sink, containing any panic inside it.
fn deliver(sink: &dyn EventSink, event: Event) {
    let id = event.id;
    if catch_unwind(AssertUnwindSafe(|| sink.deliver(event))).is_err() {
        error!(event_id = id, "Event sink panicked, continuing collection");
    }
}
