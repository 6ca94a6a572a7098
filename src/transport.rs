//! Broker transport abstraction.
//!
//! The publish pipeline talks to the broker only through [`BrokerConnector`]
//! and [`BrokerSession`]. The AMQP implementation lives in [`crate::amqp`];
//! tests use the in-memory broker in [`memory`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::event::Event;

/// Content type of every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// Content encoding of every published message.
pub const CONTENT_ENCODING: &str = "utf-8";

/// Errors raised by broker transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open a connection or channel
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The connection attempt did not finish in time
    #[error("connection to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// Declaring the target exchange failed
    #[error("failed to declare exchange '{exchange}': {reason}")]
    Declare { exchange: String, reason: String },

    /// The broker or channel refused a publish
    #[error("publish failed: {0}")]
    Publish(String),

    /// The broker negatively acknowledged a message
    #[error("broker rejected message {message_id}")]
    Nack { message_id: String },
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub persistent: bool,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Serialize an event for the exchange and routing key of `config`.
    pub fn from_event(event: &Event, config: &ConnectionConfig) -> Result<Self, serde_json::Error> {
        Ok(Self {
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
            message_id: Uuid::new_v4().to_string(),
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
            persistent: true,
            body: event.to_json_bytes()?,
        })
    }
}

/// Opens broker sessions.
///
/// `connect` must leave the session ready to publish: connection open,
/// channel created and the target exchange declared.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Session: BrokerSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Session, TransportError>;
}

/// An open connection and channel, owned by the publish worker.
#[async_trait]
pub trait BrokerSession: Send + 'static {
    /// Publish one message. Any error means the session is unusable.
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Whether the underlying connection is still open.
    fn is_open(&self) -> bool {
        true
    }

    /// Close the channel and connection, logging rather than returning errors.
    async fn close(self);
}

/// In-memory broker used to exercise the pipeline without a server.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Inner {
        published: Mutex<Vec<OutboundMessage>>,
        declared: Mutex<Vec<String>>,
        fail_connects: AtomicU32,
        fail_publishes: AtomicU32,
        refuse_connects: AtomicBool,
        stall_publishes: AtomicBool,
        connects: AtomicUsize,
        closes: AtomicUsize,
        open_sessions: AtomicUsize,
        generation: AtomicUsize,
    }

    /// Shared handle on a fake broker.
    #[derive(Clone, Default)]
    pub struct MemoryBroker {
        inner: Arc<Inner>,
    }

    impl MemoryBroker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` connection attempts fail.
        pub fn fail_next_connects(&self, n: u32) {
            self.inner.fail_connects.store(n, Ordering::SeqCst);
        }

        /// Make every connection attempt fail until called with `false`.
        pub fn refuse_connects(&self, refuse: bool) {
            self.inner.refuse_connects.store(refuse, Ordering::SeqCst);
        }

        /// Make the next `n` publishes fail.
        pub fn fail_next_publishes(&self, n: u32) {
            self.inner.fail_publishes.store(n, Ordering::SeqCst);
        }

        /// Make publishes hang until the session is dropped.
        pub fn stall_publishes(&self, stall: bool) {
            self.inner.stall_publishes.store(stall, Ordering::SeqCst);
        }

        /// Drop every open session, as a broker restart would.
        pub fn sever_connections(&self) {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }

        pub fn published(&self) -> Vec<OutboundMessage> {
            self.inner.published.lock().clone()
        }

        pub fn published_events(&self) -> Vec<Event> {
            self.published()
                .iter()
                .map(|m| Event::from_json_bytes(&m.body).expect("valid event body"))
                .collect()
        }

        pub fn declared_exchanges(&self) -> Vec<String> {
            self.inner.declared.lock().clone()
        }

        pub fn connects(&self) -> usize {
            self.inner.connects.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.inner.closes.load(Ordering::SeqCst)
        }

        pub fn open_sessions(&self) -> usize {
            self.inner.open_sessions.load(Ordering::SeqCst)
        }
    }

    pub struct MemorySession {
        inner: Arc<Inner>,
        generation: usize,
    }

    #[async_trait]
    impl BrokerConnector for MemoryBroker {
        type Session = MemorySession;

        async fn connect(&self, config: &ConnectionConfig) -> Result<MemorySession, TransportError> {
            self.inner.connects.fetch_add(1, Ordering::SeqCst);

            let refused = self.inner.refuse_connects.load(Ordering::SeqCst);
            let scripted_failure = self
                .inner
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused || scripted_failure {
                return Err(TransportError::Connect {
                    endpoint: config.endpoint(),
                    reason: "connection refused".to_string(),
                });
            }

            self.inner.declared.lock().push(config.exchange.clone());
            self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
            Ok(MemorySession {
                inner: self.inner.clone(),
                generation: self.inner.generation.load(Ordering::SeqCst),
            })
        }
    }

    #[async_trait]
    impl BrokerSession for MemorySession {
        async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
            if !self.is_open() {
                return Err(TransportError::Publish("connection reset".to_string()));
            }
            if self.inner.stall_publishes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self
                .inner
                .fail_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Publish("channel closed by broker".to_string()));
            }
            self.inner.published.lock().push(message.clone());
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.generation == self.inner.generation.load(Ordering::SeqCst)
        }

        async fn close(self) {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures;

    #[test]
    fn test_outbound_message_from_event() {
        let config = ConnectionConfig::default();
        let event = fixtures::event(11);
        let message = OutboundMessage::from_event(&event, &config).unwrap();

        assert_eq!(message.exchange, "windows_logs");
        assert_eq!(message.routing_key, "system.logs");
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.content_encoding, "utf-8");
        assert!(message.persistent);
        assert!(Uuid::parse_str(&message.message_id).is_ok());
        assert_eq!(Event::from_json_bytes(&message.body).unwrap(), event);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let config = ConnectionConfig::default();
        let event = fixtures::event(1);
        let a = OutboundMessage::from_event(&event, &config).unwrap();
        let b = OutboundMessage::from_event(&event, &config).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Connect {
            endpoint: "amqp://broker:5672/".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "connection to amqp://broker:5672/ failed: connection refused"
        );

        let err = TransportError::Timeout {
            endpoint: "amqp://broker:5672/".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("timed out after 10s"));
    }

    #[tokio::test]
    async fn test_memory_broker_scripted_failures() {
        let broker = memory::MemoryBroker::new();
        let config = ConnectionConfig::default();

        broker.fail_next_connects(1);
        assert!(broker.connect(&config).await.is_err());
        let mut session = broker.connect(&config).await.unwrap();
        assert_eq!(broker.declared_exchanges(), vec!["windows_logs".to_string()]);

        let message = OutboundMessage::from_event(&fixtures::event(1), &config).unwrap();
        broker.fail_next_publishes(1);
        assert!(session.publish(&message).await.is_err());
        assert!(session.publish(&message).await.is_ok());

        broker.sever_connections();
        assert!(!session.is_open());
        assert!(session.publish(&message).await.is_err());

        session.close().await;
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.published().len(), 1);
    }
}
