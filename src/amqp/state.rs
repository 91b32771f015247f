use serde::Serialize;
use std::fmt;

/// Lifecycle of the broker connection, owned by the supervisor
///
/// The happy path runs top to bottom; failures go back to `Disconnected`
/// (waiting for a retry) and `stop()` leads through `Terminating` to `Closed`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectionOpen,
    ChannelOpen,
    ExchangeVerified,
    QueueVerified,
    Bound,
    Consuming,
    Terminating,
    Closed,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectionOpen => "connection_open",
            ConnectionState::ChannelOpen => "channel_open",
            ConnectionState::ExchangeVerified => "exchange_verified",
            ConnectionState::QueueVerified => "queue_verified",
            ConnectionState::Bound => "bound",
            ConnectionState::Consuming => "consuming",
            ConnectionState::Terminating => "terminating",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether the supervisor currently holds a usable channel
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Open,
    #[default]
    Closed,
}

impl ChannelState {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
