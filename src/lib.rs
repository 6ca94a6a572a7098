//! Event Log Agent Library
//!
//! This library provides the components of an event collection agent that
//! forwards events to a RabbitMQ topic exchange:
//!
//! - **event**: The event record and its JSON wire form
//! - **source**: Event sources and the built-in synthetic Windows log catalog
//! - **collector**: Collection engine delivering events to a sink on its own task
//! - **queue**: Bounded FIFO with a fixed overflow policy
//! - **backoff**: Exponential reconnect delay
//! - **transport**: Broker connector/session traits
//! - **amqp**: `lapin` implementation of the transport
//! - **pipeline**: Publish worker with reconnect and back-off
//! - **config**: Environment-based configuration for the agent binary
//! - **logging**: Console and daily rotated file logging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use eventlog_agent::amqp::AmqpConnector;
//! use eventlog_agent::backoff::BackoffPolicy;
//! use eventlog_agent::collector::{CollectionEngine, CollectionRequest};
//! use eventlog_agent::config::ConnectionConfig;
//! use eventlog_agent::pipeline::PublishPipeline;
//! use eventlog_agent::queue::QueueConfig;
//! use eventlog_agent::source::SyntheticSource;
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = Arc::new(PublishPipeline::new(
//!         AmqpConnector::new(),
//!         QueueConfig::default(),
//!         BackoffPolicy::default(),
//!     ));
//!     if !pipeline.connect(ConnectionConfig::default()).await {
//!         return;
//!     }
//!
//!     let engine = CollectionEngine::new(SyntheticSource::with_defaults());
//!     let sink = pipeline.clone();
//!     let request = CollectionRequest::new(
//!         ["System", "Application"],
//!         Duration::from_secs(3600),
//!         Arc::new(move |event| {
//!             sink.publish(event);
//!         }),
//!     );
//!     engine.start(request);
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     engine.stop().await;
//!     pipeline.disconnect().await;
//! }
//! ```

// Module declarations
pub mod amqp;
pub mod backoff;
pub mod collector;
pub mod config;
pub mod event;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use amqp::{AmqpConnector, AmqpSession};
pub use backoff::{Backoff, BackoffPolicy};
pub use collector::{ChannelSink, CollectionEngine, CollectionRequest, EventSink};
pub use config::{AgentConfig, ConfigError, ConnectionConfig, LoggingConfig};
pub use event::{Event, Severity};
pub use logging::{LoggingError, LoggingGuard};
pub use pipeline::{PipelineSink, PipelineState, PipelineStats, PublishPipeline};
pub use queue::{OverflowPolicy, PublishQueue, QueueConfig, QueueStats};
pub use source::{CollectError, EventSource, SyntheticConfig, SyntheticSource, TimeWindow};
pub use transport::{BrokerConnector, BrokerSession, OutboundMessage, TransportError};
