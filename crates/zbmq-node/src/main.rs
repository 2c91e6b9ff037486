//! zbmq - ZigBee mesh to MQTT bridge daemon
//!
//! This binary runs one bridge between a serial-attached mesh coordinator and
//! an MQTT broker:
//! - Configuration from defaults, an optional JSON file, then command line flags
//! - Logging via tracing-subscriber, filtered by `loglevel` or `RUST_LOG`
//! - Clean shutdown on Ctrl-C, publishing the offline status first

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zbmq_bridge::{
    BridgeConfig, BridgeConfigBuilder, DeviceDirectory, JsonFileStore, MeshBridge, MqttClient,
    SerialCoordinator, VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "zbmq")]
#[command(about = "Bridge a ZigBee mesh coordinator to an MQTT broker")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Root of all MQTT topics
    #[arg(long)]
    root_topic: Option<String>,

    /// Broker URL (mqtt://, mqtts://, tcp:// or ssl://)
    #[arg(long, short)]
    broker: Option<String>,

    /// Broker username
    #[arg(long)]
    username: Option<String>,

    /// Broker password
    #[arg(long)]
    password: Option<String>,

    /// Coordinator serial port
    #[arg(long, short)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Device directory file
    #[arg(long)]
    device_db: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    loglevel: Option<String>,

    /// Also publish each frame on the sender's own response topic
    #[arg(long)]
    expand_response_topics: Option<bool>,

    /// Start with an empty device directory if the file is corrupt
    #[arg(long)]
    reset_corrupt_device_db: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    /// Layer command line flags over a loaded configuration
    fn apply(&self, config: BridgeConfig) -> BridgeConfig {
        let mut builder = BridgeConfigBuilder::from_config(config);

        if let Some(root_topic) = &self.root_topic {
            builder = builder.root_topic(root_topic.clone());
        }
        if let Some(broker) = &self.broker {
            builder = builder.broker(broker.clone());
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            builder = builder.credentials(username.clone(), password.clone());
        }
        if let Some(port) = &self.port {
            builder = builder.serial_port(port.clone());
        }
        if let Some(device_db) = &self.device_db {
            builder = builder.device_db(device_db.clone());
        }
        if let Some(loglevel) = &self.loglevel {
            builder = builder.loglevel(loglevel.clone());
        }
        if let Some(expand) = self.expand_response_topics {
            builder = builder.expand_response_topics(expand);
        }
        if self.reset_corrupt_device_db {
            builder = builder.reset_corrupt_device_db(true);
        }

        let mut config = builder.build();
        if let Some(baud) = self.baud {
            config.baud = baud;
        }
        config
    }
}

async fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let base = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    let config = args.apply(base);
    config.validate()?;
    Ok(config)
}

fn init_logging(loglevel: &str, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { loglevel };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{}`", level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging setup failed: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args).await?;
    init_logging(&config.loglevel, args.verbose)?;

    info!(version = VERSION, broker = %config.broker, port = %config.port, "Starting zbmq");

    let store = JsonFileStore::new(&config.device_db);
    let directory = if config.reset_corrupt_device_db {
        DeviceDirectory::load_or_reset(store).await?
    } else {
        DeviceDirectory::load(store).await?
    };

    let (bridge, handle) =
        MeshBridge::new(SerialCoordinator::new(), MqttClient::new(), directory, config);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Received Ctrl-C, shutting down");
        if let Err(e) = handle.shutdown().await {
            error!(error = %e, "Failed to request shutdown");
        }
    });

    bridge.run().await?;
    info!("zbmq stopped");
    Ok(())
}
