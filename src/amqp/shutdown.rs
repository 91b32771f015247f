//! Ordered drain run when the supervisor terminates
//!
//! ```text
//! Flushing ──► Cancelling ──► ClosingChannel ──► Drained
//! (snapshot)   (consumer)     (channel)
//! ```
//!
//! Each stage is a separate type so a step can neither be skipped nor run
//! twice. Failures are logged and the sequence always reaches `Drained`.

use statum::{machine, state};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::message::ConfigurationMessage;
use super::publisher::{PublishOutcome, Publisher};
use super::transport::BrokerChannel;

/// Source of the current device configuration
///
/// Registered with the supervisor as a weak reference: once the provider is
/// dropped it counts as absent and nothing is flushed.
pub trait SnapshotProvider: Send + Sync + 'static {
    /// `None` while no configuration is known
    fn snapshot(&self) -> Option<ConfigurationMessage>;
}

/// Resolves a weak provider registration to a snapshot, if any
pub fn current_snapshot(
    provider: Option<&Weak<dyn SnapshotProvider>>,
) -> Option<ConfigurationMessage> {
    let Some(provider) = provider else {
        debug!("No configuration snapshot provider registered");
        return None;
    };
    let Some(provider) = provider.upgrade() else {
        debug!("Configuration snapshot provider is gone");
        return None;
    };
    provider.snapshot()
}

#[state]
#[derive(Debug, Clone)]
pub enum DrainStage {
    Flushing,
    Cancelling,
    ClosingChannel,
    Drained,
}

#[machine]
pub struct Drain<S: DrainStage> {
    channel: Option<Arc<dyn BrokerChannel>>,
    consumer_tag: Option<String>,
    flushed: bool,
    channel_closed: bool,
}

impl Drain<Flushing> {
    pub fn create(channel: Option<Arc<dyn BrokerChannel>>, consumer_tag: Option<String>) -> Self {
        debug!(
            "Starting drain, channel: {}, consumer: {:?}",
            channel.is_some(),
            consumer_tag
        );
        Self::new(channel, consumer_tag, false, false)
    }

    /// Publishes the last known configuration, best effort
    pub async fn flush(
        mut self,
        publisher: &Publisher,
        provider: Option<&Weak<dyn SnapshotProvider>>,
    ) -> Drain<Cancelling> {
        match current_snapshot(provider) {
            Some(snapshot) => {
                info!("Flushing last known configuration");
                let outcome = publisher
                    .publish_configuration(self.channel.as_deref(), &snapshot)
                    .await;
                self.flushed = outcome == PublishOutcome::Published;
            }
            None => debug!("No configuration to flush"),
        }
        self.transition()
    }
}

impl Drain<Cancelling> {
    pub async fn cancel_consumer(mut self) -> Drain<ClosingChannel> {
        if let (Some(channel), Some(tag)) = (self.channel.as_ref(), self.consumer_tag.take()) {
            match channel.cancel(&tag).await {
                Ok(()) => info!("Consumer {} cancelled", tag),
                Err(e) => warn!("Failed to cancel consumer {}: {}", tag, e),
            }
        }
        self.transition()
    }
}

impl Drain<ClosingChannel> {
    pub async fn close_channel(mut self) -> Drain<Drained> {
        if let Some(channel) = self.channel.take() {
            match channel.close().await {
                Ok(()) => debug!("Channel closed"),
                Err(e) => warn!("Failed to close channel: {}", e),
            }
            self.channel_closed = true;
        }
        self.transition()
    }
}

impl Drain<Drained> {
    /// Whether a channel existed and was closed by this drain
    pub fn channel_closed(&self) -> bool {
        self.channel_closed
    }

    pub fn flushed(&self) -> bool {
        self.flushed
    }
}
