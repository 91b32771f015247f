//! [`Connector`] implementation on top of `lapin`
//!
//! Library callbacks (`on_error`, the consumer stream) only forward into the
//! [`LinkNotifier`]; every decision is left to the supervisor.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, warn};

use super::transport::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, DeclareMode, InboundDelivery,
    LinkEvent, LinkNotifier,
};
use crate::config::AmqpConfiguration;

const REPLY_SUCCESS: u16 = 200;
const JSON_CONTENT_TYPE: &str = "application/json";

/// Connects to a real broker
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }

    fn uri(config: &AmqpConfiguration) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = config.host().to_string();
        uri.authority.port = config.port();
        uri.authority.userinfo.username = config.user().to_string();
        uri.authority.userinfo.password = config.password().unwrap_or_default().to_string();
        uri
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new("pingboard-bridge")
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        config: &AmqpConfiguration,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect_uri(Self::uri(config), properties)
            .await
            .map_err(|e| {
                BrokerError::Unavailable(format!("{}:{}: {}", config.host(), config.port(), e))
            })?;

        connection.on_error(move |err| {
            notifier.notify(LinkEvent::ConnectionLost(err.to_string()));
        });

        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(
        &self,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await?;
        debug!("Opened channel {}", channel.id());

        channel.on_error(move |err| {
            notifier.notify(LinkEvent::ChannelLost(err.to_string()));
        });

        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection.close(REPLY_SUCCESS, "Normal shutdown").await?;
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, exchange: &str, mode: DeclareMode) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            passive: mode.is_passive(),
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(exchange, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Topology(format!("exchange {exchange}: {e}")))?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, mode: DeclareMode) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            passive: mode.is_passive(),
            durable: true,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Topology(format!("queue {queue}: {e}")))?;
        debug!(
            "Queue {} holds {} messages for {} consumers",
            queue,
            declared.message_count(),
            declared.consumer_count()
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Topology(format!("binding {queue} to {exchange}/{routing_key}: {e}"))
            })?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, notifier: LinkNotifier) -> Result<String, BrokerError> {
        // An empty tag lets the broker pick one.
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().as_str().to_string();

        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => notifier.notify(LinkEvent::Delivery(InboundDelivery {
                        delivery_tag: delivery.delivery_tag,
                        body: delivery.data,
                    })),
                    Err(e) => {
                        warn!("Consumer {} failed: {}", consumer_tag, e);
                        notifier.notify(LinkEvent::ChannelLost(e.to_string()));
                        break;
                    }
                }
            }
            debug!("Consumer {} stream ended", consumer_tag);
        });

        Ok(tag)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(REPLY_SUCCESS, "Normal shutdown").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_carries_credentials_and_port() {
        let config = AmqpConfiguration::builder("broker.local", "pingboard")
            .port(5673)
            .password("secret")
            .build()
            .unwrap();
        let uri = AmqpConnector::uri(&config);

        assert_eq!(uri.authority.host, "broker.local");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "pingboard");
        assert_eq!(uri.authority.userinfo.password, "secret");
    }
}
