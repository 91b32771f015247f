//! Broker transport seam
//!
//! The supervisor never talks to `lapin` directly. It drives these traits,
//! which the [`lapin_transport`](super::lapin_transport) module implements for
//! a real broker and the test suite implements with a recording mock.
//!
//! Asynchronous broker events (a connection or channel dropping, a message
//! being delivered) are reported through a [`LinkNotifier`] handed to the
//! transport when the resource is created.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::AmqpConfiguration;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker could not be reached or refused the connection
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// An exchange, queue or binding is missing or was refused
    #[error("Topology error: {0}")]
    Topology(String),
}

/// How exchanges and queues are brought into existence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclareMode {
    /// Create if absent
    Active,
    /// Only assert existence, fail if missing
    Passive,
}

impl DeclareMode {
    pub fn from_flag(declare: bool) -> Self {
        if declare {
            DeclareMode::Active
        } else {
            DeclareMode::Passive
        }
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, DeclareMode::Passive)
    }
}

/// A message handed to the consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum LinkEvent {
    ConnectionLost(String),
    ChannelLost(String),
    Delivery(InboundDelivery),
}

/// Callback sink for asynchronous broker events
///
/// Cheap to clone; every clone forwards to the same sink. Notifying never
/// blocks, so it is safe to call from library callbacks.
#[derive(Clone)]
pub struct LinkNotifier {
    sink: Arc<dyn Fn(LinkEvent) + Send + Sync>,
}

impl LinkNotifier {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn notify(&self, event: LinkEvent) {
        (self.sink)(event)
    }
}

impl fmt::Debug for LinkNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkNotifier").finish_non_exhaustive()
    }
}

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &AmqpConfiguration,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self, notifier: LinkNotifier)
        -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Durable topic exchange
    async fn declare_exchange(&self, exchange: &str, mode: DeclareMode) -> Result<(), BrokerError>;

    /// Durable queue
    async fn declare_queue(&self, queue: &str, mode: DeclareMode) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Starts consuming and returns the consumer tag; deliveries arrive as
    /// [`LinkEvent::Delivery`] on `notifier`.
    async fn consume(&self, queue: &str, notifier: LinkNotifier) -> Result<String, BrokerError>;

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8])
        -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
