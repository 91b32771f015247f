//! Connection supervisor
//!
//! A single tokio task owns the connection, the channel, the consumer tag and
//! the [`ConnectionState`]. Everything that can change them arrives as an
//! [`Event`] on one unbounded queue and is handled in order:
//!
//! ```text
//! Disconnected ─► Connecting ─► ConnectionOpen ─► ChannelOpen ─► ExchangeVerified
//!       ▲                                                              │
//!       │ retry after delay                                            ▼
//!       └──────────── any failure ◄──── Consuming ◄──── Bound ◄── QueueVerified
//!
//! stop() ─► Terminating ─► (drain) ─► Closed
//! ```
//!
//! Handshake steps run in spawned tasks and post their result back tagged
//! with the attempt epoch. A failure bumps the epoch, so results and broker
//! callbacks belonging to an abandoned attempt are recognised and dropped.
//! Publishing, acknowledging and the shutdown drain are awaited inline by the
//! actor, which keeps them in queue order.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::configuration_channel::{ConfigurationChannel, ConfigurationHandler};
use super::publisher::Publisher;
use super::shutdown::{current_snapshot, Drain, SnapshotProvider};
use super::state::{ChannelState, ConnectionState};
use super::transport::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, DeclareMode, LinkEvent, LinkNotifier,
};
use crate::config::AmqpConfiguration;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;
pub const DEFAULT_CONNECTION_NAME: &str = "pingboard-bridge";

/// Runtime behaviour of the supervisor
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// Fixed delay before a failed attempt is restarted
    ///
    /// `None` disables retrying: the first failure closes the supervisor.
    pub retry_delay: Option<Duration>,

    /// Unacknowledged deliveries the broker may push at once
    pub prefetch_count: u16,

    /// Reported to the broker as the client connection name
    pub connection_name: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            retry_delay: Some(DEFAULT_RETRY_DELAY),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            connection_name: DEFAULT_CONNECTION_NAME.to_string(),
        }
    }
}

/// Point-in-time view of the supervisor
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub host: String,
    pub connection: ConnectionState,
    pub channel: ChannelState,
    pub terminating: bool,
    /// When `connection` last changed
    pub since: DateTime<Local>,
    pub last_error: Option<String>,
    pub healthy: bool,
}

impl HealthReport {
    fn initial(host: &str) -> Self {
        Self {
            host: host.to_string(),
            connection: ConnectionState::Disconnected,
            channel: ChannelState::Closed,
            terminating: false,
            since: Local::now(),
            last_error: None,
            healthy: false,
        }
    }
}

enum Outbound {
    Status(Value),
    KeyEvent(u8),
    Configuration,
}

enum StepOutcome {
    Connected(Arc<dyn BrokerConnection>),
    ChannelOpened(Arc<dyn BrokerChannel>),
    ExchangeVerified,
    QueueVerified,
    Bound,
    Consuming(String),
}

impl StepOutcome {
    /// Releases whatever a step from an abandoned attempt opened
    fn discard(self) {
        match self {
            StepOutcome::Connected(connection) => {
                tokio::spawn(async move {
                    if let Err(e) = connection.close().await {
                        debug!("Failed to close stale connection: {}", e);
                    }
                });
            }
            StepOutcome::ChannelOpened(channel) => {
                tokio::spawn(async move {
                    if let Err(e) = channel.close().await {
                        debug!("Failed to close stale channel: {}", e);
                    }
                });
            }
            _ => {}
        }
    }
}

enum Event {
    Setup,
    Stop,
    Publish(Outbound),
    SetHandler(Box<dyn ConfigurationHandler>),
    SetSnapshotProvider(Option<Weak<dyn SnapshotProvider>>),
    Step {
        epoch: u64,
        result: Result<StepOutcome, BrokerError>,
    },
    RetryDue {
        epoch: u64,
    },
    Link {
        epoch: u64,
        event: LinkEvent,
    },
}

struct Supervisor {
    config: Arc<AmqpConfiguration>,
    connector: Arc<dyn Connector>,
    settings: SupervisorSettings,

    state: ConnectionState,
    state_since: DateTime<Local>,
    terminating: bool,
    last_error: Option<String>,

    epoch: u64,
    in_flight: bool,
    retry_timer: Option<CancellationToken>,

    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    consumer_tag: Option<String>,

    publisher: Publisher,
    configuration: ConfigurationChannel,
    snapshot_provider: Option<Weak<dyn SnapshotProvider>>,

    events: mpsc::WeakUnboundedSender<Event>,
    health: watch::Sender<HealthReport>,
}

impl Supervisor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        debug!("Supervisor for {} started", self.config.host());
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }

        // Every handle is gone, nobody can call stop() any more.
        if self.state != ConnectionState::Closed {
            info!("All supervisor handles dropped, shutting down");
            self.begin_termination();
            self.finish_termination().await;
        }
        debug!("Supervisor for {} finished", self.config.host());
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Setup => self.on_setup(),
            Event::Stop => self.on_stop().await,
            Event::Publish(outbound) => self.on_publish(outbound).await,
            Event::SetHandler(handler) => self.configuration.set_handler(handler),
            Event::SetSnapshotProvider(provider) => {
                debug!("Snapshot provider registered: {}", provider.is_some());
                self.snapshot_provider = provider;
            }
            Event::Step { epoch, result } => self.on_step(epoch, result).await,
            Event::RetryDue { epoch } => self.on_retry_due(epoch),
            Event::Link { epoch, event } => self.on_link(epoch, event).await,
        }
    }

    fn on_setup(&mut self) {
        let idle = self.state == ConnectionState::Disconnected
            && self.retry_timer.is_none()
            && !self.in_flight
            && !self.terminating;
        if idle {
            info!("Connecting to {}:{}", self.config.host(), self.config.port());
            self.begin_attempt();
        } else {
            debug!("Setup ignored in state {}", self.state);
        }
    }

    async fn on_stop(&mut self) {
        if self.terminating || self.state == ConnectionState::Closed {
            debug!("Stop ignored in state {}", self.state);
            return;
        }
        info!("Stopping connection to {}", self.config.host());
        self.begin_termination();

        if self.in_flight {
            debug!("Waiting for the running handshake step before draining");
            return;
        }
        self.finish_termination().await;
    }

    async fn on_publish(&mut self, outbound: Outbound) {
        let channel = self.channel.as_deref();
        match outbound {
            Outbound::Status(payload) => {
                self.publisher.publish_status(channel, &payload).await;
            }
            Outbound::KeyEvent(index) => {
                self.publisher.publish_key_event(channel, index).await;
            }
            Outbound::Configuration => match current_snapshot(self.snapshot_provider.as_ref()) {
                Some(snapshot) => {
                    self.publisher
                        .publish_configuration(channel, &snapshot)
                        .await;
                }
                None => debug!("No configuration snapshot to publish"),
            },
        }
    }

    async fn on_step(&mut self, epoch: u64, result: Result<StepOutcome, BrokerError>) {
        if epoch != self.epoch {
            debug!("Discarding result of abandoned attempt {}", epoch);
            if let Ok(outcome) = result {
                outcome.discard();
            }
            return;
        }
        self.in_flight = false;

        match result {
            Ok(outcome) => {
                let reached = self.absorb(outcome);
                if self.terminating {
                    debug!("Handshake reached {} during shutdown", reached);
                    self.finish_termination().await;
                } else {
                    self.set_state(reached);
                    self.advance();
                }
            }
            Err(e) if self.terminating => {
                debug!("Handshake step failed during shutdown: {}", e);
                self.finish_termination().await;
            }
            Err(e) => self.fail_attempt(e.to_string()),
        }
    }

    fn on_retry_due(&mut self, epoch: u64) {
        if epoch != self.epoch || self.terminating || self.state != ConnectionState::Disconnected
        {
            debug!("Ignoring stale retry for attempt {}", epoch);
            return;
        }
        self.retry_timer = None;
        info!("Retrying connection to {}", self.config.host());
        self.begin_attempt();
    }

    async fn on_link(&mut self, epoch: u64, event: LinkEvent) {
        if epoch != self.epoch {
            debug!("Ignoring {:?} from abandoned attempt {}", event, epoch);
            return;
        }

        match event {
            LinkEvent::Delivery(delivery) => {
                self.configuration
                    .on_delivery(
                        self.channel.as_deref(),
                        &self.publisher,
                        delivery,
                        self.terminating,
                    )
                    .await;
            }
            LinkEvent::ConnectionLost(reason) | LinkEvent::ChannelLost(reason)
                if self.terminating || self.state == ConnectionState::Closed =>
            {
                debug!("Broker link dropped during shutdown: {}", reason);
            }
            LinkEvent::ConnectionLost(reason) => {
                warn!("Connection to {} lost: {}", self.config.host(), reason);
                self.fail_attempt(reason);
            }
            LinkEvent::ChannelLost(reason) => {
                warn!("Channel closed unexpectedly: {}", reason);
                self.fail_attempt(reason);
            }
        }
    }

    /// Stores what a step opened and returns the state it reached
    fn absorb(&mut self, outcome: StepOutcome) -> ConnectionState {
        match outcome {
            StepOutcome::Connected(connection) => {
                self.connection = Some(connection);
                ConnectionState::ConnectionOpen
            }
            StepOutcome::ChannelOpened(channel) => {
                self.channel = Some(channel);
                ConnectionState::ChannelOpen
            }
            StepOutcome::ExchangeVerified => ConnectionState::ExchangeVerified,
            StepOutcome::QueueVerified => ConnectionState::QueueVerified,
            StepOutcome::Bound => ConnectionState::Bound,
            StepOutcome::Consuming(tag) => {
                self.consumer_tag = Some(tag);
                ConnectionState::Consuming
            }
        }
    }

    fn begin_attempt(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let connector = self.connector.clone();
        let config = self.config.clone();
        let notifier = self.link_notifier();
        self.dispatch(async move {
            connector
                .connect(&config, notifier)
                .await
                .map(StepOutcome::Connected)
        });
    }

    /// Starts the step that leads out of the current state
    fn advance(&mut self) {
        let mode = DeclareMode::from_flag(self.config.declare());
        match self.state {
            ConnectionState::ConnectionOpen => {
                let Some(connection) = self.connection.clone() else {
                    return self.fail_attempt("connection vanished during handshake".into());
                };
                let notifier = self.link_notifier();
                self.dispatch(async move {
                    connection
                        .open_channel(notifier)
                        .await
                        .map(StepOutcome::ChannelOpened)
                });
            }
            ConnectionState::ChannelOpen => {
                let exchange = self.config.exchange().to_string();
                self.channel_step(move |channel| async move {
                    channel
                        .declare_exchange(&exchange, mode)
                        .await
                        .map(|()| StepOutcome::ExchangeVerified)
                });
            }
            ConnectionState::ExchangeVerified => {
                let queue = self.config.configuration_queue().to_string();
                self.channel_step(move |channel| async move {
                    channel
                        .declare_queue(&queue, mode)
                        .await
                        .map(|()| StepOutcome::QueueVerified)
                });
            }
            ConnectionState::QueueVerified => {
                match (self.config.declare(), self.config.configuration_routing_key()) {
                    (true, Some(routing_key)) => {
                        let queue = self.config.configuration_queue().to_string();
                        let exchange = self.config.exchange().to_string();
                        let routing_key = routing_key.to_string();
                        self.channel_step(move |channel| async move {
                            channel
                                .bind_queue(&queue, &exchange, &routing_key)
                                .await
                                .map(|()| StepOutcome::Bound)
                        });
                    }
                    (true, None) => {
                        warn!("No configuration routing key configured, queue binding skipped");
                        self.set_state(ConnectionState::Bound);
                        self.advance();
                    }
                    (false, _) => {
                        self.set_state(ConnectionState::Bound);
                        self.advance();
                    }
                }
            }
            ConnectionState::Bound => {
                let queue = self.config.configuration_queue().to_string();
                let prefetch = self.settings.prefetch_count;
                let notifier = self.link_notifier();
                self.channel_step(move |channel| async move {
                    channel.set_prefetch(prefetch).await?;
                    channel
                        .consume(&queue, notifier)
                        .await
                        .map(StepOutcome::Consuming)
                });
            }
            ConnectionState::Consuming => {
                info!(
                    "Consuming configuration from {} on {}",
                    self.config.configuration_queue(),
                    self.config.host()
                );
            }
            other => debug!("Nothing to advance from {}", other),
        }
    }

    fn channel_step<F, Fut>(&mut self, step: F)
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<StepOutcome, BrokerError>> + Send + 'static,
    {
        match self.channel.clone() {
            Some(channel) => self.dispatch(step(channel)),
            None => self.fail_attempt("channel vanished during handshake".into()),
        }
    }

    fn dispatch<F>(&mut self, step: F)
    where
        F: Future<Output = Result<StepOutcome, BrokerError>> + Send + 'static,
    {
        let epoch = self.epoch;
        let events = self.events.clone();
        self.in_flight = true;
        tokio::spawn(async move {
            let result = step.await;
            let Some(events) = events.upgrade() else {
                debug!("Supervisor gone, releasing handshake result");
                if let Ok(outcome) = result {
                    outcome.discard();
                }
                return;
            };
            if let Err(mpsc::error::SendError(Event::Step {
                result: Ok(outcome),
                ..
            })) = events.send(Event::Step { epoch, result })
            {
                outcome.discard();
            }
        });
    }

    /// Notifier tagged with the current attempt
    fn link_notifier(&self) -> LinkNotifier {
        let epoch = self.epoch;
        let events = self.events.clone();
        LinkNotifier::new(move |event| {
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::Link { epoch, event });
            }
        })
    }

    /// Abandons the current attempt and schedules the next one
    fn fail_attempt(&mut self, reason: String) {
        self.epoch += 1;
        self.in_flight = false;
        self.last_error = Some(reason.clone());
        self.release_resources();

        match self.settings.retry_delay {
            Some(delay) => {
                warn!(
                    "Connection attempt to {} failed: {}, retrying in {:?}",
                    self.config.host(),
                    reason,
                    delay
                );
                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry(delay);
            }
            None => {
                error!(
                    "Connection attempt to {} failed and retrying is disabled: {}",
                    self.config.host(),
                    reason
                );
                self.set_state(ConnectionState::Closed);
            }
        }
    }

    /// Best-effort close of a half-built or broken link
    fn release_resources(&mut self) {
        let channel = self.channel.take();
        let connection = self.connection.take();
        self.consumer_tag = None;
        if channel.is_none() && connection.is_none() {
            return;
        }
        tokio::spawn(async move {
            if let Some(channel) = channel {
                if let Err(e) = channel.close().await {
                    debug!("Failed to close abandoned channel: {}", e);
                }
            }
            if let Some(connection) = connection {
                if let Err(e) = connection.close().await {
                    debug!("Failed to close abandoned connection: {}", e);
                }
            }
        });
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.retry_timer.replace(token.clone()) {
            previous.cancel();
        }
        let epoch = self.epoch;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Retry for attempt {} cancelled", epoch),
                _ = tokio::time::sleep(delay) => {
                    if let Some(events) = events.upgrade() {
                        let _ = events.send(Event::RetryDue { epoch });
                    }
                }
            }
        });
    }

    fn begin_termination(&mut self) {
        self.terminating = true;
        if let Some(timer) = self.retry_timer.take() {
            debug!("Cancelling pending retry");
            timer.cancel();
        }
        self.set_state(ConnectionState::Terminating);
    }

    async fn finish_termination(&mut self) {
        let drained = Drain::create(self.channel.take(), self.consumer_tag.take())
            .flush(&self.publisher, self.snapshot_provider.as_ref())
            .await
            .cancel_consumer()
            .await
            .close_channel()
            .await;
        debug!(
            "Drain finished, flushed: {}, channel closed: {}",
            drained.flushed(),
            drained.channel_closed()
        );

        if let Some(connection) = self.connection.take() {
            match connection.close().await {
                Ok(()) => debug!("Connection closed"),
                Err(e) => warn!("Failed to close connection: {}", e),
            }
        }
        self.set_state(ConnectionState::Closed);
        info!("Connection to {} closed", self.config.host());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {} -> {}", self.state, state);
            self.state = state;
            self.state_since = Local::now();
        }
        self.health.send_replace(self.report());
    }

    fn report(&self) -> HealthReport {
        HealthReport {
            host: self.config.host().to_string(),
            connection: self.state,
            channel: if self.channel.is_some() {
                ChannelState::Open
            } else {
                ChannelState::Closed
            },
            terminating: self.terminating,
            since: self.state_since,
            last_error: self.last_error.clone(),
            healthy: self.state == ConnectionState::Consuming && !self.terminating,
        }
    }
}

/// Cloneable entry point to a running supervisor
///
/// Every call only enqueues an event and returns immediately; the effect is
/// observable through [`health`](Self::health) and [`subscribe`](Self::subscribe).
/// The supervisor shuts down on its own once the last handle is dropped.
#[derive(Clone)]
pub struct SupervisorHandle {
    events: mpsc::UnboundedSender<Event>,
    health: watch::Receiver<HealthReport>,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("health", &*self.health.borrow())
            .finish()
    }
}

impl SupervisorHandle {
    /// Spawns the supervisor task; must be called inside a tokio runtime
    pub fn spawn(
        config: AmqpConfiguration,
        connector: Arc<dyn Connector>,
        settings: SupervisorSettings,
    ) -> Self {
        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(HealthReport::initial(config.host()));
        debug!("Spawning supervisor with {:?}", settings);

        let supervisor = Supervisor {
            publisher: Publisher::new(config.clone()),
            config,
            connector,
            settings,
            state: ConnectionState::Disconnected,
            state_since: Local::now(),
            terminating: false,
            last_error: None,
            epoch: 0,
            in_flight: false,
            retry_timer: None,
            connection: None,
            channel: None,
            consumer_tag: None,
            configuration: ConfigurationChannel::default(),
            snapshot_provider: None,
            events: tx.downgrade(),
            health: health_tx,
        };
        let span = info_span!("supervisor", host = %supervisor.config.host());
        tokio::spawn(supervisor.run(rx).instrument(span));

        Self {
            events: tx,
            health: health_rx,
        }
    }

    /// Starts connecting; a no-op unless the supervisor is idle
    pub fn setup(&self) {
        self.send(Event::Setup, "setup");
    }

    /// Drains and closes the connection; repeated calls are no-ops
    pub fn stop(&self) {
        if self.state() == ConnectionState::Closed {
            debug!("Stop requested on a closed supervisor");
            return;
        }
        self.send(Event::Stop, "stop");
    }

    pub fn publish_status<T: Serialize>(&self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(Event::Publish(Outbound::Status(value)), "status"),
            Err(e) => error!("Failed to encode status payload: {}", e),
        }
    }

    /// Publishes a press of the 1-based key `index`
    pub fn publish_key_event(&self, index: u8) {
        self.send(Event::Publish(Outbound::KeyEvent(index)), "key event");
    }

    /// Publishes the registered provider's current snapshot, if any
    pub fn publish_configuration(&self) {
        self.send(Event::Publish(Outbound::Configuration), "configuration");
    }

    pub fn set_configuration_handler(&self, handler: impl ConfigurationHandler) {
        self.send(Event::SetHandler(Box::new(handler)), "configuration handler");
    }

    /// Registers the source of the configuration flushed on shutdown
    ///
    /// Only a weak reference is kept; dropping the provider unregisters it.
    pub fn set_snapshot_provider<P: SnapshotProvider>(&self, provider: &Arc<P>) {
        let provider: Weak<P> = Arc::downgrade(provider);
        let provider: Weak<dyn SnapshotProvider> = provider;
        self.send(Event::SetSnapshotProvider(Some(provider)), "snapshot provider");
    }

    pub fn clear_snapshot_provider(&self) {
        self.send(Event::SetSnapshotProvider(None), "snapshot provider");
    }

    pub fn health(&self) -> HealthReport {
        self.health.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.health.borrow().connection
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.health.clone()
    }

    /// Resolves with the first report matching `predicate`
    ///
    /// If the supervisor task is gone the last known report is returned.
    pub async fn wait_for<F>(&self, mut predicate: F) -> HealthReport
    where
        F: FnMut(&HealthReport) -> bool,
    {
        let mut health = self.health.clone();
        if let Ok(report) = health.wait_for(|report| predicate(report)).await {
            return report.clone();
        }
        let report = health.borrow().clone();
        report
    }

    pub async fn wait_closed(&self) -> HealthReport {
        self.wait_for(|report| report.connection == ConnectionState::Closed)
            .await
    }

    fn send(&self, event: Event, what: &str) {
        if self.events.send(event).is_err() {
            warn!("Supervisor is not running, {} request dropped", what);
        }
    }
}
