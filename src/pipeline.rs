//! Publish pipeline: a bounded queue drained by a single worker task that
//! owns the broker session and reconnects with exponential back-off.
//!
//! Callers only ever touch the queue and the worker's stop signal. The
//! session is created by `connect`, moved into the worker and closed by the
//! worker when it exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::collector::EventSink;
use crate::config::ConnectionConfig;
use crate::event::Event;
use crate::queue::{PublishQueue, QueueConfig};
use crate::transport::{BrokerConnector, BrokerSession, OutboundMessage};

/// How long the worker waits for a queued event before looping again.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `disconnect` waits for the worker before aborting it.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Disconnected,
    /// A connect or reconnect attempt is in flight
    Connecting,
    Connected,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Disconnected => write!(f, "disconnected"),
            PipelineState::Connecting => write!(f, "connecting"),
            PipelineState::Connected => write!(f, "connected"),
        }
    }
}

/// Counters describing pipeline activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Events accepted into the queue
    pub enqueued: u64,

    /// Events refused by a full queue
    pub rejected: u64,

    /// Queued events evicted by a full queue
    pub dropped: u64,

    /// Events confirmed by the broker
    pub published: u64,

    /// Publishes that failed, including serialization failures
    pub publish_failures: u64,

    /// Successful reconnects performed by the worker
    pub reconnects: u64,
}

/// State shared between the pipeline handle and its worker.
struct Shared {
    state: Mutex<PipelineState>,
    worker_active: AtomicBool,
    published: AtomicU64,
    publish_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Disconnected),
            worker_active: AtomicBool::new(false),
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock() = state;
    }
}

/// Handle on the running worker task.
struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Reliable publisher of events to a broker exchange.
///
/// # Example
///
/// ```no_run
/// use eventlog_agent::amqp::AmqpConnector;
/// use eventlog_agent::backoff::BackoffPolicy;
/// use eventlog_agent::config::ConnectionConfig;
/// use eventlog_agent::pipeline::PublishPipeline;
/// use eventlog_agent::queue::QueueConfig;
///
/// # async fn run() {
/// let pipeline = PublishPipeline::new(AmqpConnector::new(), QueueConfig::default(), BackoffPolicy::default());
/// if pipeline.connect(ConnectionConfig::default()).await {
///     // pipeline.publish(event);
/// }
/// pipeline.disconnect().await;
/// # }
/// ```
pub struct PublishPipeline<C: BrokerConnector> {
    connector: Arc<C>,
    queue: Arc<PublishQueue>,
    shared: Arc<Shared>,
    worker: tokio::sync::Mutex<Option<Worker>>,
    backoff: BackoffPolicy,
    dequeue_timeout: Duration,
    join_timeout: Duration,
}

impl<C: BrokerConnector> PublishPipeline<C> {
    /// Create a disconnected pipeline. The overflow policy in `queue` is fixed
    /// for the lifetime of the pipeline.
    pub fn new(connector: C, queue: QueueConfig, backoff: BackoffPolicy) -> Self {
        info!(
            capacity = queue.capacity,
            overflow = %queue.overflow,
            floor_ms = backoff.floor.as_millis(),
            ceiling_ms = backoff.ceiling.as_millis(),
            "Publish pipeline created"
        );

        Self {
            connector: Arc::new(connector),
            queue: Arc::new(PublishQueue::new(queue)),
            shared: Arc::new(Shared::new()),
            worker: tokio::sync::Mutex::new(None),
            backoff,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Override how long the worker waits for an event per iteration.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Override how long `disconnect` waits for the worker.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Replace any existing connection with one to `config`.
    ///
    /// On success exactly one worker is running and `true` is returned. On
    /// failure the pipeline is left disconnected with no worker.
    pub async fn connect(&self, config: ConnectionConfig) -> bool {
        let mut worker = self.worker.lock().await;
        if let Some(previous) = worker.take() {
            info!("Replacing existing broker connection");
            self.stop_worker(previous).await;
        }

        let endpoint = config.endpoint();
        info!(endpoint = %endpoint, exchange = %config.exchange, "Connecting to broker");
        self.shared.set_state(PipelineState::Connecting);

        let session = match self.connector.connect(&config).await {
            Ok(session) => session,
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to connect to broker");
                self.shared.set_state(PipelineState::Disconnected);
                return false;
            }
        };

        self.shared.set_state(PipelineState::Connected);
        self.shared.worker_active.store(true, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(
            self.connector.clone(),
            config,
            session,
            self.queue.clone(),
            self.shared.clone(),
            self.backoff,
            self.dequeue_timeout,
            stop_rx,
        ));
        *worker = Some(Worker { stop_tx, handle });

        info!(endpoint = %endpoint, "Connected to broker");
        true
    }

    /// Stop the worker and close its session. Safe to call when disconnected.
    pub async fn disconnect(&self) {
        let previous = self.worker.lock().await.take();
        match previous {
            Some(worker) => {
                self.stop_worker(worker).await;
                info!(pending = self.queue.len(), "Disconnected from broker");
            }
            None => {
                self.shared.set_state(PipelineState::Disconnected);
                debug!("Disconnect requested with no active worker");
            }
        }
    }

    /// Queue an event for delivery without waiting.
    ///
    /// Returns `false` when no worker is running or the queue refuses the
    /// event. `true` means queued, not delivered.
    pub fn publish(&self, event: Event) -> bool {
        if !self.shared.worker_active.load(Ordering::SeqCst) {
            debug!(event_id = event.id, "Publish with no active connection");
            return false;
        }
        self.queue.push(event)
    }

    pub fn state(&self) -> PipelineState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PipelineState::Connected
    }

    /// Number of events waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PipelineStats {
        let queue = self.queue.stats();
        PipelineStats {
            enqueued: queue.enqueued,
            rejected: queue.rejected,
            dropped: queue.dropped,
            published: self.shared.published.load(Ordering::Relaxed),
            publish_failures: self.shared.publish_failures.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }

    async fn stop_worker(&self, worker: Worker) {
        let Worker { stop_tx, mut handle } = worker;
        self.shared.worker_active.store(false, Ordering::SeqCst);
        let _ = stop_tx.send(true);

        match tokio::time::timeout(self.join_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Publish worker failed");
            }
            Err(_) => {
                // The session is dropped without a close handshake
                warn!(
                    timeout_ms = self.join_timeout.as_millis(),
                    "Publish worker did not stop in time, aborting and abandoning its session"
                );
                handle.abort();
            }
        }

        self.shared.set_state(PipelineState::Disconnected);
    }
}

/// Collection sink that forwards every event into a pipeline.
///
/// Refused events are logged at warn level and counted.
pub struct PipelineSink<C: BrokerConnector> {
    pipeline: Arc<PublishPipeline<C>>,
    refused: AtomicU64,
}

impl<C: BrokerConnector> PipelineSink<C> {
    pub fn new(pipeline: Arc<PublishPipeline<C>>) -> Self {
        Self {
            pipeline,
            refused: AtomicU64::new(0),
        }
    }

    /// Events the pipeline did not accept.
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

impl<C: BrokerConnector> EventSink for PipelineSink<C> {
    fn deliver(&self, event: Event) {
        let id = event.id;
        if !self.pipeline.publish(event) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = id,
                state = %self.pipeline.state(),
                pending = self.pipeline.pending(),
                "Event not accepted for publishing"
            );
        }
    }
}

/// Dropping a connected pipeline signals the worker and detaches it; the
/// worker closes its session on its own once it observes the signal.
impl<C: BrokerConnector> Drop for PublishPipeline<C> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            self.shared.worker_active.store(false, Ordering::SeqCst);
            let _ = worker.stop_tx.send(true);
            if !worker.handle.is_finished() {
                debug!("Pipeline dropped while connected, worker closing session in background");
            }
        }
    }
}

/// Body of the publish worker.
#[allow(clippy::too_many_arguments)]
async fn run_worker<C: BrokerConnector>(
    connector: Arc<C>,
    config: ConnectionConfig,
    session: C::Session,
    queue: Arc<PublishQueue>,
    shared: Arc<Shared>,
    policy: BackoffPolicy,
    dequeue_timeout: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let endpoint = config.endpoint();
    let mut session = Some(session);
    let mut backoff = Backoff::new(policy);

    debug!(endpoint = %endpoint, "Publish worker started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let Some(active) = session.as_mut() else {
            if !config.auto_reconnect {
                // Stay disconnected until told to stop
                if stop_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }

            let delay = backoff.current();
            info!(
                endpoint = %endpoint,
                delay_ms = delay.as_millis(),
                attempt = backoff.failures() + 1,
                "Reconnecting to broker"
            );
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            shared.set_state(PipelineState::Connecting);
            let attempt = tokio::select! {
                _ = stop_rx.changed() => break,
                result = connector.connect(&config) => result,
            };

            match attempt {
                Ok(reconnected) => {
                    backoff.reset();
                    shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    shared.set_state(PipelineState::Connected);
                    info!(endpoint = %endpoint, pending = queue.len(), "Reconnected to broker");
                    session = Some(reconnected);
                }
                Err(e) => {
                    let next = backoff.on_failure();
                    shared.set_state(PipelineState::Disconnected);
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        next_delay_ms = next.as_millis(),
                        "Reconnect failed"
                    );
                }
            }
            continue;
        };

        let lost = tokio::select! {
            _ = stop_rx.changed() => break,
            next = queue.pop_timeout(dequeue_timeout) => match next {
                Some(event) => publish_event(active, &event, &config, &shared).await,
                None if !active.is_open() => Some("connection closed while idle".to_string()),
                None => None,
            },
        };

        if let Some(reason) = lost {
            warn!(endpoint = %endpoint, reason = %reason, "Broker connection lost");
            if let Some(dead) = session.take() {
                dead.close().await;
            }
            shared.set_state(PipelineState::Disconnected);
        }
    }

    if let Some(open) = session.take() {
        open.close().await;
    }
    shared.set_state(PipelineState::Disconnected);
    debug!(endpoint = %endpoint, "Publish worker stopped");
}

/// Publish one event. Returns the reason the session must be dropped, if any.
async fn publish_event<S: BrokerSession>(
    session: &mut S,
    event: &Event,
    config: &ConnectionConfig,
    shared: &Shared,
) -> Option<String> {
    let message = match OutboundMessage::from_event(event, config) {
        Ok(message) => message,
        Err(e) => {
            shared.publish_failures.fetch_add(1, Ordering::Relaxed);
            error!(event_id = event.id, error = %e, "Failed to serialize event, discarding");
            return None;
        }
    };

    match session.publish(&message).await {
        Ok(()) => {
            shared.published.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = event.id, message_id = %message.message_id, "Event published");
            None
        }
        Err(e) => {
            shared.publish_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                event_id = event.id,
                message_id = %message.message_id,
                error = %e,
                "Publish failed, in-flight event lost"
            );
            Some(e.to_string())
        }
    }
}
