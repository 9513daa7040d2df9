//! stomp-pubsub command line
//!
//! Publish to and consume from a STOMP broker using a TOML configuration.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use stomp_pubsub::observability::{init_default_logging, init_logging, LogFormat};
use stomp_pubsub::{
    new_uuid, BridgeConfig, ConnectionManager, Message, Publisher, StompConnector, Subscriber,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

/// Publish/subscribe bridge for STOMP brokers
#[derive(Parser)]
#[command(name = "stomp-pubsub")]
#[command(about = "Publish/subscribe bridge for STOMP brokers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "STOMP_PUBSUB_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message in a transaction
    Publish {
        /// Destination to send to
        #[arg(short, long)]
        destination: String,
        /// Message payload
        #[arg(short, long)]
        payload: String,
        /// Metadata entries as key=value
        #[arg(short = 'H', long = "header", value_parser = parse_key_value)]
        headers: Vec<(String, String)>,
    },
    /// Consume a topic and print each message as a JSON line
    Consume {
        /// Topic to subscribe to
        #[arg(short, long)]
        topic: String,
        /// Nack every message instead of acking it
        #[arg(long)]
        nack: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialise logging: {e}");
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            destination,
            payload,
            headers,
        } => publish(config, &destination, payload, headers).await,
        Commands::Consume { topic, nack } => consume(config, &topic, nack).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => ["stomp-pubsub.toml", "config/stomp-pubsub.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or("no configuration file found; pass one with -c/--config")?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(BridgeConfig::load_from_file(&path)?)
}

async fn connect(config: &BridgeConfig) -> Result<Arc<ConnectionManager>, Box<dyn std::error::Error>> {
    let manager = ConnectionManager::new(config.connection.clone(), Arc::new(StompConnector))?;
    manager.connect().await?;
    Ok(Arc::new(manager))
}

async fn publish(
    config: BridgeConfig,
    destination: &str,
    payload: String,
    headers: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate_publisher()?;
    let manager = connect(&config).await?;
    let publisher = Publisher::new(manager.clone(), Arc::new(config.marshaler.build()));

    let mut msg = Message::new(new_uuid(), payload);
    for (key, value) in headers {
        msg.metadata.set(key, value);
    }
    let uuid = msg.uuid.clone();

    let result = publisher.publish(destination, &[msg]).await;
    manager.close().await?;
    result?;

    info!(message_uuid = %uuid, destination, "Message published");
    Ok(())
}

async fn consume(
    config: BridgeConfig,
    topic: &str,
    nack: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate_subscriber()?;
    let manager = connect(&config).await?;
    let subscriber = Subscriber::new(
        manager.clone(),
        Arc::new(config.queue.clone()),
        Arc::new(config.marshaler.build()),
    )
    .with_backoff(config.subscriber.reconnect_backoff());

    let ctx = CancellationToken::new();
    let mut messages = subscriber.subscribe(ctx.clone(), topic)?;
    info!(topic, destination = %subscriber.destination(topic), "Consuming, press Ctrl-C to stop");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            next = messages.recv() => {
                let Some(msg) = next else {
                    warn!("Subscription ended");
                    break;
                };
                let line = json!({
                    "uuid": msg.uuid,
                    "metadata": msg.metadata,
                    "payload": String::from_utf8_lossy(&msg.payload),
                });
                println!("{line}");
                if nack {
                    msg.nack();
                } else {
                    msg.ack();
                }
            }
        }
    }

    ctx.cancel();
    manager.close().await?;
    info!(stats = ?manager.stats(), "Shutdown complete");
    Ok(())
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
