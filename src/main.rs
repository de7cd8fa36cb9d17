//! team-mqtt command line entry point

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use team_mqtt::config::AppConfig;
use team_mqtt::consumer::{
    ActionOutcome, DynamicSubscription, MqttIn, MqttOut, PublisherConfig, SubscriberAction,
    SubscriberConfig,
};
use team_mqtt::observability::{init_default_logging, init_logging, LogFormat};
use team_mqtt::{ConnectionStatus, DataType, OutboundMessage, SharedBroker};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["team-mqtt.toml", "config/team-mqtt.toml"];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared team broker client
#[derive(Parser)]
#[command(name = "team-mqtt")]
#[command(about = "Multiplexed MQTT client for the team broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and log every message until Ctrl-C
    Run {
        /// Topic filter, repeatable
        #[arg(long = "topic", value_name = "FILTER", required = true)]
        topics: Vec<String>,
        /// Output type: buffer, base64, utf8, json, auto, auto-detect
        #[arg(long, default_value = "utf8")]
        datatype: String,
    },
    /// Publish a single message
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { topics, datatype } => run_subscriber(config, topics, &datatype).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
        } => publish_once(config, topic, payload, qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AppConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create team-mqtt.toml".into())
}

async fn run_subscriber(
    config: AppConfig,
    topics: Vec<String>,
    datatype: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let datatype: DataType = datatype.parse()?;
    let broker = SharedBroker::from_config(config)?;

    let subscriptions = topics
        .iter()
        .map(|topic| DynamicSubscription::parse(&Value::String(topic.clone()), broker.is_v5()))
        .collect::<Result<Vec<_>, _>>()?;

    let (sink, mut messages) = mpsc::unbounded_channel();
    let consumer = MqttIn::new(
        SubscriberConfig::dynamic("cli-subscriber").with_datatype(datatype),
        broker,
        sink,
    )?;
    if let Err(e) = consumer.start().await {
        warn!("Broker registration failed, waiting for link recovery: {}", e);
    }
    consumer
        .handle_action(SubscriberAction::Subscribe(subscriptions))
        .await?;
    info!(topics = ?topics, "Listening, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            delivery = messages.recv() => match delivery {
                Some(Ok(message)) => info!(topic = %message.topic, message = %message.to_json(), "Message received"),
                Some(Err(e)) => warn!(topic = %e.topic, code = %e.code, "Message could not be decoded"),
                None => break,
            },
        }
    }

    consumer.close(true).await;
    Ok(())
}

async fn publish_once(
    config: AppConfig,
    topic: String,
    payload: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = SharedBroker::from_config(config)?;
    let mut status = broker.subscribe_status();
    let publisher = MqttOut::new(PublisherConfig::new("cli-publisher"), broker);
    publisher.start().await?;

    let connected = matches!(
        tokio::time::timeout(
            CONNECT_TIMEOUT,
            status.wait_for(|s| *s == ConnectionStatus::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        publisher.close(true).await;
        return Err("Timed out waiting for the broker connection".into());
    }

    let message = OutboundMessage::new(topic, payload)
        .with_qos(qos)
        .with_retain(retain);
    let outcome = publisher.handle(message).await;
    publisher.close(true).await;

    match outcome? {
        ActionOutcome::Published(result) => info!(?result, "Publish finished"),
        other => warn!(?other, "Nothing published"),
    }
    Ok(())
}

fn handle_config_command(config: &AppConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration is valid");
    Ok(())
}
