//! nodelink: run a control-plane broker or a node.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodelink_broker::{Broker, BrokerBuilder, BrokerServer};
use nodelink_core::shutdown::ShutdownCoordinator;
use nodelink_node::{ConnectorConfig, NodeConnector, TungsteniteDialer};
use nodelink_settings::{LogFormat, NodelinkSettings};
use serde_json::{Map, Value};

/// Grace period for tracked tasks after ctrl-c.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "nodelink", about = "Control-plane broker and node")]
struct Cli {
    /// Settings file (defaults to ~/.nodelink/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept node connections.
    Broker {
        /// Host to bind to (overrides settings).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to (overrides settings, 0 = auto).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a broker and stay connected.
    Node {
        /// Broker WebSocket URL (overrides settings).
        #[arg(long)]
        broker_url: Option<String>,
        /// Topics to subscribe to; deliveries are logged.
        #[arg(long = "subscribe", value_name = "TOPIC")]
        topics: Vec<String>,
    },
}

fn load(path: Option<&Path>) -> Result<NodelinkSettings> {
    let settings = match path {
        Some(path) => nodelink_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => nodelink_settings::load_settings().context("Failed to load settings")?,
    };
    Ok(settings)
}

fn init_logging(settings: &NodelinkSettings) {
    match settings.logging.format {
        LogFormat::Compact => nodelink_core::logging::init_subscriber(&settings.logging.level),
        LogFormat::Json => nodelink_core::logging::init_json_subscriber(&settings.logging.level),
    }
}

fn log_push(topic: &str, payload: &Map<String, Value>) {
    tracing::info!(topic, fields = payload.len(), "topic message");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(cli.settings.as_deref())?;
    init_logging(&settings);

    let coordinator = ShutdownCoordinator::new();
    match cli.command {
        Command::Broker { host, port } => {
            if let Some(host) = host {
                settings.broker.host = host;
            }
            if let Some(port) = port {
                settings.broker.port = port;
            }
            run_broker(&settings, &coordinator).await?;
        }
        Command::Node { broker_url, topics } => {
            if let Some(url) = broker_url {
                settings.node.broker_url = Some(url);
            }
            run_node(&settings, topics, &coordinator).await?;
        }
    }

    coordinator.drain(Some(DRAIN_TIMEOUT)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_broker(settings: &NodelinkSettings, coordinator: &ShutdownCoordinator) -> Result<()> {
    let broker: Arc<Broker> = BrokerBuilder::from_settings(settings).build();
    let addr = format!("{}:{}", settings.broker.host, settings.broker.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr().context("Failed to read bound address")?;
    tracing::info!(%local, "broker listening");

    coordinator.track(Arc::clone(&broker).spawn_supervisor(coordinator.token()));

    let server = BrokerServer::new(broker);
    let cancel = coordinator.token();
    let serve = tokio::spawn(async move {
        if let Err(error) = server.serve(listener, cancel).await {
            tracing::error!(%error, "broker server failed");
        }
    });
    coordinator.track(serve);

    coordinator.wait_for_signal().await;
    tracing::info!("Shutting down...");
    Ok(())
}

async fn run_node(settings: &NodelinkSettings, topics: Vec<String>, coordinator: &ShutdownCoordinator) -> Result<()> {
    let config = ConnectorConfig::from_settings(settings, "node");
    let mut builder = NodeConnector::builder(config, Arc::new(TungsteniteDialer));
    if let Some(url) = settings.node.broker_url.clone().filter(|_| settings.node.is_configured()) {
        builder = builder.broker_url(url);
    }
    let node = builder.build();

    if !topics.is_empty() {
        let _ = node
            .topic_sub(topics, Arc::new(log_push))
            .await
            .context("Failed to register topic listener")?;
    }
    if let Err(error) = node.start().await {
        // The supervisor keeps redialling once a URL is configured.
        tracing::warn!(%error, "initial connect failed");
    }
    coordinator.track(Arc::clone(&node).spawn_supervisor(coordinator.token()));

    coordinator.wait_for_signal().await;
    tracing::info!("Shutting down...");
    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_defaults() {
        let cli = Cli::parse_from(["nodelink", "broker"]);
        assert!(cli.settings.is_none());
        match cli.command {
            Command::Broker { host, port } => {
                assert!(host.is_none());
                assert!(port.is_none());
            }
            Command::Node { .. } => panic!("expected broker"),
        }
    }

    #[test]
    fn broker_overrides() {
        let cli = Cli::parse_from(["nodelink", "broker", "--host", "0.0.0.0", "--port", "9100"]);
        match cli.command {
            Command::Broker { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9100));
            }
            Command::Node { .. } => panic!("expected broker"),
        }
    }

    #[test]
    fn node_with_topics() {
        let cli = Cli::parse_from([
            "nodelink",
            "node",
            "--broker-url",
            "ws://127.0.0.1:8930/api/ws/node",
            "--subscribe",
            "quotes",
            "--subscribe",
            "fills",
        ]);
        match cli.command {
            Command::Node { broker_url, topics } => {
                assert_eq!(broker_url.as_deref(), Some("ws://127.0.0.1:8930/api/ws/node"));
                assert_eq!(topics, vec!["quotes", "fills"]);
            }
            Command::Broker { .. } => panic!("expected node"),
        }
    }

    #[test]
    fn settings_flag_is_global() {
        let cli = Cli::parse_from(["nodelink", "node", "--settings", "/tmp/s.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/s.json")));
    }

    #[test]
    fn subcommand_required() {
        assert!(Cli::try_parse_from(["nodelink"]).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"broker":{"port":9200},"logging":{"format":"json"}}"#).unwrap();
        let settings = load(Some(&path)).unwrap();
        assert_eq!(settings.broker.port, 9200);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
