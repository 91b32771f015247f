use color_eyre::{eyre::eyre, Result};
use pingboard_bridge::amqp::{AmqpConnector, SupervisorHandle, SupervisorSettings};
use pingboard_bridge::config::AmqpConfiguration;
use pingboard_bridge::device::DeviceState;
use pingboard_bridge::health::{HealthRegistry, VersionHealthProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

const CONFIG_ENV: &str = "PINGBOARD_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = load_config()?;
    info!("Using {:?}", config);

    let settings = SupervisorSettings::default();
    let connector = Arc::new(AmqpConnector::new(settings.connection_name.clone()));
    let supervisor = SupervisorHandle::spawn(config, connector, settings);

    let device = Arc::new(DeviceState::new());
    supervisor.set_configuration_handler(device.handler());
    supervisor.set_snapshot_provider(&device);

    let mut health = HealthRegistry::new();
    health.add_provider("version", Arc::new(VersionHealthProvider))?;
    health.add_provider("amqp", Arc::new(supervisor.clone()))?;

    supervisor.setup();

    wait_for_termination().await?;
    info!("Termination requested");

    supervisor.stop();
    let report = supervisor.wait_closed().await;
    debug!("Final health: {}", health.report().0);
    health.remove_provider("amqp");
    health.remove_provider("version");
    info!("Service terminated in state {}", report.connection);
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// `$PINGBOARD_CONFIG`, then `<config dir>/pingboard/amqp.toml`, then the environment
fn load_config() -> Result<AmqpConfiguration> {
    let file = match std::env::var_os(CONFIG_ENV) {
        Some(path) => Some(PathBuf::from(path)),
        None => dirs::config_dir()
            .map(|dir| dir.join("pingboard").join("amqp.toml"))
            .filter(|path| path.is_file()),
    };

    let config = match file {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            AmqpConfiguration::from_toml_file(&path)?
        }
        None => {
            info!("Loading configuration from the environment");
            AmqpConfiguration::from_environment()?
        }
    };
    Ok(config)
}

async fn wait_for_termination() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e)),
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))
    }
}
