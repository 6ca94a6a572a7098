//! Event Log Agent - collects event log records and forwards them to RabbitMQ
//!
//! This service reads events from the configured log channels, queues them
//! and publishes each one as a persistent JSON message to a topic exchange.
//!
//! ## Features
//!
//! - Collection on its own task with prompt cancellation
//! - Bounded publish queue drained by a single worker
//! - Reconnect with exponential back-off (5s doubling to 60s)
//! - Graceful shutdown on Ctrl+C, draining the queue first
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`eventlog_agent::config::AgentConfig`]. `RUST_LOG` overrides
//! `EVENTLOG_AGENT_LOG_LEVEL`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use eventlog_agent::amqp::AmqpConnector;
use eventlog_agent::backoff::{Backoff, BackoffPolicy};
use eventlog_agent::collector::{CollectionEngine, CollectionRequest};
use eventlog_agent::config::AgentConfig;
use eventlog_agent::logging;
use eventlog_agent::pipeline::{PipelineSink, PublishPipeline};
use eventlog_agent::source::{SyntheticConfig, SyntheticSource};

/// Maximum time spent draining the publish queue on shutdown
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for collection or the queue drain
const POLL_INTERVAL_MS: u64 = 200;

#[tokio::main]
async fn main() {
    // Load configuration before logging so the log directory is known
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        endpoint = %config.connection.endpoint(),
        exchange = %config.connection.exchange,
        routing_key = %config.connection.routing_key,
        channels = ?config.channels,
        lookback_secs = config.lookback.as_secs(),
        queue_capacity = config.queue.capacity,
        overflow = %config.queue.overflow,
        "Starting Event Log Agent..."
    );

    let pipeline = Arc::new(PublishPipeline::new(
        AmqpConnector::new(),
        config.queue,
        BackoffPolicy::default(),
    ));

    if !connect_with_retry(&pipeline, &config).await {
        info!("Shutdown requested before a broker connection was made");
        drop(log_guard);
        return;
    }

    let source = SyntheticSource::new(SyntheticConfig {
        origin_host: config.origin_host.clone(),
        ..SyntheticConfig::default()
    });
    let engine = CollectionEngine::new(source);

    let mut request = CollectionRequest::new(
        config.channels.iter().cloned(),
        config.lookback,
        Arc::new(PipelineSink::new(pipeline.clone())),
    );
    if let Some(interval) = config.follow {
        request = request.with_follow(interval);
    }

    if !engine.start(request) {
        error!("Failed to start collection");
        pipeline.disconnect().await;
        drop(log_guard);
        std::process::exit(1);
    }

    info!("Event Log Agent running. Press Ctrl+C to stop.");
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
        _ = wait_for_collection(&engine) => info!("Collection complete"),
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    engine.stop().await;

    drain_queue(&pipeline).await;
    pipeline.disconnect().await;

    let stats = pipeline.stats();
    info!(
        published = stats.published,
        publish_failures = stats.publish_failures,
        rejected = stats.rejected,
        dropped = stats.dropped,
        reconnects = stats.reconnects,
        pending = pipeline.pending(),
        "Event Log Agent stopped"
    );

    // Flush the file writer last
    drop(log_guard);
}

/// Connect the pipeline, retrying with back-off until it succeeds.
///
/// Returns `false` if Ctrl+C arrives first.
async fn connect_with_retry(pipeline: &PublishPipeline<AmqpConnector>, config: &AgentConfig) -> bool {
    let mut backoff = Backoff::new(BackoffPolicy::default());

    loop {
        if pipeline.connect(config.connection.clone()).await {
            return true;
        }

        let delay = backoff.current();
        warn!(
            delay_secs = delay.as_secs(),
            attempt = backoff.failures() + 1,
            "Broker unavailable, retrying"
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff.on_failure();
    }
}

/// Resolve once the collection run has ended on its own.
async fn wait_for_collection(engine: &CollectionEngine<SyntheticSource>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    loop {
        ticker.tick().await;
        if !engine.is_running() {
            return;
        }
    }
}

/// Give the worker a bounded amount of time to publish what is queued.
async fn drain_queue(pipeline: &PublishPipeline<AmqpConnector>) {
    let pending = pipeline.pending();
    if pending == 0 {
        return;
    }

    info!(pending = pending, "Draining publish queue");
    let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
        while pipeline.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            pending = pipeline.pending(),
            "Publish queue not drained after {:?}", SHUTDOWN_DRAIN_TIMEOUT
        );
    }
}
