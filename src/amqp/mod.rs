//! # AMQP connector
//!
//! Connects the Pingboard to a RabbitMQ style broker. Key presses and status
//! reports go out on a topic exchange; configuration for the board comes in
//! on a durable queue.
//!
//! ## Module Architecture
//!
//! ```text
//! amqp/
//! ├── supervisor.rs             - Connection state machine and public handle
//! ├── publisher.rs              - Outbound status, key and configuration messages
//! ├── configuration_channel.rs  - Inbound configuration decoding and acks
//! ├── shutdown.rs               - Drain sequence run on stop()
//! ├── message.rs                - JSON wire payloads
//! ├── state.rs                  - Connection and channel state labels
//! ├── transport.rs              - Broker traits the supervisor drives
//! └── lapin_transport.rs        - Transport implementation on lapin
//! ```
//!
//! Only the supervisor holds the connection and the channel. Publisher and
//! configuration channel borrow the channel per call, so a dropped or
//! replaced channel never leaves a dangling handle behind.

pub mod configuration_channel;
pub mod lapin_transport;
pub mod message;
pub mod publisher;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use configuration_channel::ConfigurationHandler;
pub use lapin_transport::AmqpConnector;
pub use message::{BlinkMode, ConfigurationMessage, DeviceConfiguration, KeyBlink, KeyColor};
pub use shutdown::SnapshotProvider;
pub use state::{ChannelState, ConnectionState};
pub use supervisor::{HealthReport, SupervisorHandle, SupervisorSettings};
pub use transport::{BrokerError, Connector};
