use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::message::{ConfigurationMessage, StatusError};
use super::publisher::Publisher;
use super::transport::{BrokerChannel, InboundDelivery};

/// Receives decoded configuration messages
///
/// The return value reports whether the configuration was applied; it is
/// logged and does not influence acknowledgement.
pub trait ConfigurationHandler: Send + 'static {
    fn on_configuration(&mut self, message: ConfigurationMessage) -> bool;
}

impl<F> ConfigurationHandler for F
where
    F: FnMut(ConfigurationMessage) -> bool + Send + 'static,
{
    fn on_configuration(&mut self, message: ConfigurationMessage) -> bool {
        self(message)
    }
}

/// What happened to one inbound delivery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    /// Left for redelivery after a restart
    Unacknowledged,
}

/// Inbound side of the connector
#[derive(Default)]
pub struct ConfigurationChannel {
    handler: Option<Box<dyn ConfigurationHandler>>,
}

impl fmt::Debug for ConfigurationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationChannel")
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl ConfigurationChannel {
    pub fn set_handler(&mut self, handler: Box<dyn ConfigurationHandler>) {
        if self.handler.replace(handler).is_some() {
            debug!("Replaced configuration handler");
        }
    }

    /// Decodes, dispatches and acknowledges one delivery
    ///
    /// A body that is not JSON at all is reported on the status routing key.
    /// Snippets of a JSON body that do not fit are logged and skipped, the
    /// rest still reaches the handler. Once the supervisor is terminating
    /// nothing is handed to the handler and nothing is acknowledged.
    pub async fn on_delivery(
        &mut self,
        channel: Option<&dyn BrokerChannel>,
        publisher: &Publisher,
        delivery: InboundDelivery,
        terminating: bool,
    ) -> DeliveryOutcome {
        match serde_json::from_slice::<Value>(&delivery.body) {
            Ok(body) if terminating => {
                debug!(
                    "Configuration {} arrived during shutdown, leaving it for redelivery: {}",
                    delivery.delivery_tag, body
                );
            }
            Ok(body) => {
                let (message, rejected) = ConfigurationMessage::from_value_lenient(&body);
                for reason in &rejected {
                    warn!("Invalid configuration snippet: {}", reason);
                }
                self.dispatch(delivery.delivery_tag, message);
            }
            Err(e) => {
                warn!("Could not decode configuration: {}", e);
                let report = StatusError::invalid_configuration(e.to_string(), &delivery.body);
                publisher.publish_status(channel, &report).await;
            }
        }

        if terminating {
            return DeliveryOutcome::Unacknowledged;
        }

        match channel {
            Some(channel) => {
                if let Err(e) = channel.ack(delivery.delivery_tag).await {
                    error!(
                        "Failed to acknowledge configuration {}: {}",
                        delivery.delivery_tag, e
                    );
                }
                DeliveryOutcome::Acknowledged
            }
            None => {
                warn!(
                    "Configuration {} cannot be acknowledged without a channel",
                    delivery.delivery_tag
                );
                DeliveryOutcome::Unacknowledged
            }
        }
    }

    fn dispatch(&mut self, delivery_tag: u64, message: ConfigurationMessage) {
        match self.handler.as_mut() {
            Some(handler) => {
                let applied = handler.on_configuration(message);
                debug!("Configuration {} handled, applied: {}", delivery_tag, applied);
            }
            None => info!(
                "No configuration handler registered, dropping configuration {}",
                delivery_tag
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::testing::{Call, MockBroker};
    use crate::config::AmqpConfiguration;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;

    fn publisher() -> Publisher {
        Publisher::new(Arc::new(
            AmqpConfiguration::builder("localhost", "user").build().unwrap(),
        ))
    }

    fn delivery(tag: u64, body: &str) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            body: body.as_bytes().to_vec(),
        }
    }

    fn recording_channel() -> (ConfigurationChannel, Arc<Mutex<Vec<ConfigurationMessage>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut configuration = ConfigurationChannel::default();
        configuration.set_handler(Box::new(move |message: ConfigurationMessage| {
            sink.lock().unwrap().push(message);
            false
        }));
        (configuration, received)
    }

    #[tokio::test]
    async fn valid_configuration_is_handled_and_acked() {
        let broker = MockBroker::new();
        let channel = broker.channel();
        let (mut configuration, received) = recording_channel();

        let outcome = configuration
            .on_delivery(
                Some(channel.as_ref()),
                &publisher(),
                delivery(7, r#"{"configuration": {"brightness": 42}}"#),
                false,
            )
            .await;

        // A handler returning false still gets its message acknowledged.
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(broker.acks(), vec![7]);
        assert_eq!(received.lock().unwrap()[0].configuration.brightness, Some(42));
    }

    #[tokio::test]
    async fn malformed_body_is_reported_once_and_acked_once() {
        let broker = MockBroker::new();
        let channel = broker.channel();
        let (mut configuration, received) = recording_channel();

        let outcome = configuration
            .on_delivery(Some(channel.as_ref()), &publisher(), delivery(3, "{nope"), false)
            .await;

        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert!(received.lock().unwrap().is_empty());
        assert_eq!(broker.acks(), vec![3]);

        let published = broker.publishes();
        assert_eq!(published.len(), 1);
        let (routing_key, body) = &published[0];
        assert_eq!(routing_key, "status");
        assert_eq!(body["error"]["message"], json!(StatusError::INVALID_CONFIGURATION));
        assert_eq!(body["error"]["original"], json!("{nope"));
        assert!(body["error"]["details"].as_str().is_some());
    }

    #[tokio::test]
    async fn nothing_is_acked_while_terminating() {
        let broker = MockBroker::new();
        let channel = broker.channel();
        let (mut configuration, received) = recording_channel();
        let publisher = publisher();

        let valid = configuration
            .on_delivery(
                Some(channel.as_ref()),
                &publisher,
                delivery(1, r#"{"configuration": {}}"#),
                true,
            )
            .await;
        let malformed = configuration
            .on_delivery(Some(channel.as_ref()), &publisher, delivery(2, "[1,"), true)
            .await;

        assert_eq!(valid, DeliveryOutcome::Unacknowledged);
        assert_eq!(malformed, DeliveryOutcome::Unacknowledged);
        assert!(received.lock().unwrap().is_empty());
        assert!(!broker.calls().iter().any(|call| matches!(call, Call::Ack(_))));
        // The decode failure is still reported.
        assert_eq!(broker.publishes().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn bad_snippet_does_not_drop_the_rest() {
        let broker = MockBroker::new();
        let channel = broker.channel();
        let (mut configuration, received) = recording_channel();

        let outcome = configuration
            .on_delivery(
                Some(channel.as_ref()),
                &publisher(),
                delivery(
                    4,
                    r#"{"configuration": {"brightness": 10,
                        "blink": [{"idx": 1, "mode": "FAST", "color": [0, 0, 0]}]}}"#,
                ),
                false,
            )
            .await;

        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(broker.acks(), vec![4]);
        assert!(broker.publishes().is_empty());
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].configuration.brightness, Some(10));
        assert!(received[0].configuration.blink.is_empty());
        assert!(logs_contain("Invalid configuration snippet"));
    }

    #[tokio::test]
    async fn without_handler_message_is_still_acked() {
        let broker = MockBroker::new();
        let channel = broker.channel();
        let mut configuration = ConfigurationChannel::default();

        let outcome = configuration
            .on_delivery(Some(channel.as_ref()), &publisher(), delivery(9, "{}"), false)
            .await;

        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(broker.acks(), vec![9]);
    }
}
