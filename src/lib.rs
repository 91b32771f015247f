//! Bridge between a Pingboard and an AMQP broker
//!
//! [`amqp::SupervisorHandle`] keeps the broker connection alive, publishes
//! key presses and status, and hands inbound configuration to the device.
//! [`device::DeviceState`] remembers that configuration so it can be flushed
//! back to the broker on shutdown. [`health::HealthRegistry`] aggregates the
//! health of both.

pub mod amqp;
pub mod config;
pub mod device;
pub mod health;
