//! Recording in-memory broker for unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::transport::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, DeclareMode, InboundDelivery,
    LinkEvent, LinkNotifier,
};
use crate::config::AmqpConfiguration;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    Connect,
    OpenChannel,
    DeclareExchange { name: String, passive: bool },
    DeclareQueue { name: String, passive: bool },
    Bind { queue: String, exchange: String, routing_key: String },
    Prefetch(u16),
    Consume { queue: String },
    Publish { routing_key: String, body: Value },
    Ack(u64),
    Cancel(String),
    CloseChannel,
    CloseConnection,
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    failing_connects: usize,
    missing_exchange: bool,
    failing_publishes: bool,
    failing_cancel: bool,
    connect_gate: Option<Arc<Notify>>,
    connection_notifier: Option<LinkNotifier>,
    channel_notifier: Option<LinkNotifier>,
    consumer_notifier: Option<LinkNotifier>,
    consumers: usize,
    next_delivery_tag: u64,
}

#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    shared: Arc<Mutex<Shared>>,
}

impl MockBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next `count` connection attempts are refused
    pub(crate) fn with_failing_connects(self, count: usize) -> Self {
        self.lock().failing_connects = count;
        self
    }

    /// Passive exchange declarations fail as if the exchange did not exist
    pub(crate) fn with_missing_exchange(self) -> Self {
        self.lock().missing_exchange = true;
        self
    }

    pub(crate) fn with_failing_publishes(self) -> Self {
        self.lock().failing_publishes = true;
        self
    }

    pub(crate) fn with_failing_cancel(self) -> Self {
        self.lock().failing_cancel = true;
        self
    }

    /// Connection attempts block until the returned gate is notified
    pub(crate) fn gate_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().connect_gate = Some(gate.clone());
        gate
    }

    /// A channel on this broker, for exercising components directly
    pub(crate) fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::new(MockChannel {
            shared: self.shared.clone(),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn count(&self, matcher: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matcher(call)).count()
    }

    pub(crate) fn connects(&self) -> usize {
        self.count(|call| matches!(call, Call::Connect))
    }

    pub(crate) fn publishes(&self) -> Vec<(String, Value)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Publish { routing_key, body } => Some((routing_key.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Ack(tag) => Some(*tag),
                _ => None,
            })
            .collect()
    }

    /// Pushes a message to the most recent consumer and returns its tag
    pub(crate) fn deliver(&self, body: &[u8]) -> u64 {
        let (notifier, delivery_tag) = {
            let mut shared = self.lock();
            shared.next_delivery_tag += 1;
            (shared.consumer_notifier.clone(), shared.next_delivery_tag)
        };
        let notifier = notifier.expect("no consumer registered");
        notifier.notify(LinkEvent::Delivery(InboundDelivery {
            delivery_tag,
            body: body.to_vec(),
        }));
        delivery_tag
    }

    pub(crate) fn drop_channel(&self, reason: &str) {
        let notifier = self.lock().channel_notifier.clone();
        notifier
            .expect("no channel opened")
            .notify(LinkEvent::ChannelLost(reason.to_string()));
    }

    pub(crate) fn drop_connection(&self, reason: &str) {
        let notifier = self.lock().connection_notifier.clone();
        notifier
            .expect("no connection opened")
            .notify(LinkEvent::ConnectionLost(reason.to_string()));
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(
        &self,
        _config: &AmqpConfiguration,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let gate = {
            let mut shared = self.lock();
            shared.calls.push(Call::Connect);
            shared.connect_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut shared = self.lock();
        if shared.failing_connects > 0 {
            shared.failing_connects -= 1;
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        shared.connection_notifier = Some(notifier);
        Ok(Arc::new(MockConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MockConnection {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(
        &self,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::OpenChannel);
        shared.channel_notifier = Some(notifier);
        Ok(Arc::new(MockChannel {
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.lock().unwrap().calls.push(Call::CloseConnection);
        Ok(())
    }
}

struct MockChannel {
    shared: Arc<Mutex<Shared>>,
}

impl MockChannel {
    fn push(&self, call: Call) {
        self.shared.lock().unwrap().calls.push(call);
    }

    /// Records `call` and keeps the state locked for inspection
    fn record(&self, call: Call) -> MutexGuard<'_, Shared> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(call);
        shared
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, exchange: &str, mode: DeclareMode) -> Result<(), BrokerError> {
        let shared = self.record(Call::DeclareExchange {
            name: exchange.to_string(),
            passive: mode.is_passive(),
        });
        if shared.missing_exchange && mode.is_passive() {
            return Err(BrokerError::Topology(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, mode: DeclareMode) -> Result<(), BrokerError> {
        self.push(Call::DeclareQueue {
            name: queue.to_string(),
            passive: mode.is_passive(),
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.push(Call::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.push(Call::Prefetch(count));
        Ok(())
    }

    async fn consume(&self, queue: &str, notifier: LinkNotifier) -> Result<String, BrokerError> {
        let mut shared = self.record(Call::Consume {
            queue: queue.to_string(),
        });
        shared.consumers += 1;
        shared.consumer_notifier = Some(notifier);
        Ok(format!("ctag-{}", shared.consumers))
    }

    async fn publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let body = serde_json::from_slice(body).expect("published body is JSON");
        let shared = self.record(Call::Publish {
            routing_key: routing_key.to_string(),
            body,
        });
        if shared.failing_publishes {
            return Err(BrokerError::Unavailable("publish rejected".into()));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.push(Call::Ack(delivery_tag));
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let shared = self.record(Call::Cancel(consumer_tag.to_string()));
        if shared.failing_cancel {
            return Err(BrokerError::Unavailable("cancel rejected".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.push(Call::CloseChannel);
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after a generous timeout
pub(crate) async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Bounds a future so a stuck supervisor fails the test instead of hanging it
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(60), future)
        .await
        .expect("timed out")
}
