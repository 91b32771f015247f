use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::message::{ConfigurationMessage, KeyEvent};
use super::transport::BrokerChannel;
use crate::config::AmqpConfiguration;

/// Result of a single publish attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// No channel was open, or the target routing key does not exist
    Discarded,
    /// The broker or the encoder rejected the message
    Failed,
}

/// Outbound side of the connector
///
/// Owns no channel. Every call receives the supervisor's current channel, if
/// any, and a missing channel is an ordinary condition: the message is
/// dropped with a warning and the caller carries on.
#[derive(Clone, Debug)]
pub struct Publisher {
    config: Arc<AmqpConfiguration>,
}

impl Publisher {
    pub fn new(config: Arc<AmqpConfiguration>) -> Self {
        Self { config }
    }

    /// Free-form status payload on the status routing key
    pub async fn publish_status<T: Serialize + ?Sized>(
        &self,
        channel: Option<&dyn BrokerChannel>,
        payload: &T,
    ) -> PublishOutcome {
        self.publish(channel, self.config.status_routing_key(), payload)
            .await
    }

    /// `{"key": index}` on the routing key of the 1-based `index`
    pub async fn publish_key_event(
        &self,
        channel: Option<&dyn BrokerChannel>,
        index: u8,
    ) -> PublishOutcome {
        match self.config.key_routing_key(index) {
            Some(routing_key) => {
                self.publish(channel, routing_key, &KeyEvent { key: index })
                    .await
            }
            None => {
                warn!("Key event for unknown key {} has been discarded", index);
                PublishOutcome::Discarded
            }
        }
    }

    /// Configuration snapshot on the configuration routing key
    pub async fn publish_configuration(
        &self,
        channel: Option<&dyn BrokerChannel>,
        snapshot: &ConfigurationMessage,
    ) -> PublishOutcome {
        match self.config.configuration_routing_key() {
            Some(routing_key) => self.publish(channel, routing_key, snapshot).await,
            None => {
                debug!("No configuration routing key configured, snapshot not published");
                PublishOutcome::Discarded
            }
        }
    }

    async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: Option<&dyn BrokerChannel>,
        routing_key: &str,
        body: &T,
    ) -> PublishOutcome {
        let Some(channel) = channel else {
            warn!(
                "Message to {} has been discarded because a channel was not available!",
                routing_key
            );
            return PublishOutcome::Discarded;
        };

        let body = match serde_json::to_vec(body) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode message to {}: {}", routing_key, e);
                return PublishOutcome::Failed;
            }
        };

        match channel
            .publish(self.config.exchange(), routing_key, &body)
            .await
        {
            Ok(()) => {
                debug!("Published {} bytes to {}", body.len(), routing_key);
                PublishOutcome::Published
            }
            Err(e) => {
                error!("Failed to publish message to {}: {}", routing_key, e);
                PublishOutcome::Failed
            }
        }
    }
}
