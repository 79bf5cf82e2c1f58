//! EdgeHub Router
//!
//! Reads messages as JSON lines on stdin, routes them through the configured
//! route table and delivers them to HTTP endpoints with durable checkpoints.
//!
//! ## Configuration
//!
//! - **Routes file** (`EH_ROUTES_FILE`): `{ "routes": [...], "endpoints": [...] }`. The file is
//!   polled for changes every `EH_CONFIG_RELOAD_INTERVAL_SECS` and reloaded atomically.
//!
//! - **Checkpoints** (`EH_CHECKPOINT_PATH`): sled database holding per-endpoint offsets.
//!
//! - **Metrics** (`EH_METRICS_PORT`): Prometheus scrape endpoint, disabled when unset.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use eh_checkpoint::SledCheckpointStore;
use eh_common::{system_properties, Message, MessageSource, RouterConfig};
use eh_router::{
    router_metrics, ChannelSourceFactory, EndpointExecutorConfig, LifecycleConfig, LifecycleManager,
    Router, SourceFactory, SpecEndpointFactory,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppConfig {
    hub_name: String,
    routes_file: Option<PathBuf>,
    checkpoint_path: PathBuf,
    metrics_port: Option<u16>,
    reload_interval: Duration,
    executor: EndpointExecutorConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting EdgeHub Router");

    let config = load_app_config();

    // 1. Metrics exporter
    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        router_metrics::describe();
        info!(port, "Prometheus metrics exporter listening");
    }

    // 2. Checkpoint store
    let store = Arc::new(
        SledCheckpointStore::open(&config.checkpoint_path)
            .with_context(|| format!("failed to open checkpoint store at {}", config.checkpoint_path.display()))?,
    );

    // 3. Router with the initial route table
    let router = Router::new(
        config.hub_name.clone(),
        Arc::new(SpecEndpointFactory::new()),
        store,
        config.executor.clone(),
    );

    let last_modified = match &config.routes_file {
        Some(path) => {
            let (initial, modified) = read_routes_file(path)?;
            router.apply_config(&initial).await?;
            modified
        }
        None => {
            warn!("EH_ROUTES_FILE not set - starting with an empty route table");
            None
        }
    };

    // 4. Lifecycle tasks and configuration reload
    let (config_tx, config_rx) = mpsc::channel(4);
    let lifecycle = LifecycleManager::start(router.clone(), config_rx, LifecycleConfig::default());
    let cancel = CancellationToken::new();

    if let Some(path) = config.routes_file.clone() {
        let cancel = cancel.clone();
        let interval = config.reload_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_modified = last_modified;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let modified = file_modified(&path);
                        if modified.is_none() || modified == last_modified {
                            continue;
                        }
                        match read_routes_file(&path) {
                            Ok((update, modified)) => {
                                last_modified = modified;
                                info!(path = %path.display(), "Routes file changed");
                                if config_tx.send(update).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                last_modified = modified;
                                error!(path = %path.display(), error = %e, "Failed to read routes file");
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("Routes file watcher shutting down");
                        break;
                    }
                }
            }
        });
    }

    // 5. Source fed from stdin
    let sources = ChannelSourceFactory::new(config.executor.queue_capacity);
    let sender = sources.sender(None);
    let source = sources
        .create(&config.hub_name, None, router.clone(), cancel.clone())
        .await?;
    let source_handle = tokio::spawn(async move {
        if let Err(e) = source.run().await {
            error!(error = %e, "Source stopped with error");
        }
    });

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match parse_inbound(&line) {
                        Ok(message) => {
                            if sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed input line"),
                    },
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read input");
                        break;
                    }
                }
            }
        });
    }

    log_startup_summary(&config, &router);
    info!("EdgeHub Router started. Press Ctrl+C to shutdown.");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Graceful shutdown
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(30), source_handle).await;
    lifecycle.shutdown().await;
    router.close().await?;

    info!("EdgeHub Router shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("EH_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Load router configuration from environment variables
fn load_app_config() -> AppConfig {
    let defaults = EndpointExecutorConfig::default();

    let hub_name = std::env::var("EH_HUB_NAME").unwrap_or_else(|_| "edgehub".to_string());

    let routes_file = std::env::var("EH_ROUTES_FILE").ok().map(PathBuf::from);

    let checkpoint_path = std::env::var("EH_CHECKPOINT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/checkpoints"));

    let metrics_port = std::env::var("EH_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok());

    let reload_secs = std::env::var("EH_CONFIG_RELOAD_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let max_consecutive_failures = std::env::var("EH_MAX_CONSECUTIVE_FAILURES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.max_consecutive_failures);

    let initial_backoff_ms = std::env::var("EH_INITIAL_BACKOFF_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.initial_backoff.as_millis() as u64);

    let max_backoff_ms = std::env::var("EH_MAX_BACKOFF_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.max_backoff.as_millis() as u64);

    let drain_timeout_secs = std::env::var("EH_SHUTDOWN_DRAIN_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.shutdown_drain_timeout.as_secs());

    AppConfig {
        hub_name,
        routes_file,
        checkpoint_path,
        metrics_port,
        reload_interval: Duration::from_secs(reload_secs.max(1)),
        executor: EndpointExecutorConfig {
            max_consecutive_failures,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            shutdown_drain_timeout: Duration::from_secs(drain_timeout_secs),
            ..defaults
        },
    }
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_routes_file(path: &Path) -> Result<(RouterConfig, Option<SystemTime>)> {
    let modified = file_modified(path);
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read routes file {}", path.display()))?;
    let config = RouterConfig::from_json(&raw)
        .with_context(|| format!("invalid routes file {}", path.display()))?;
    Ok((config, modified))
}

/// One line of input
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundMessage {
    #[serde(default = "default_source")]
    source: String,
    body: serde_json::Value,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(default)]
    system_properties: BTreeMap<String, String>,
}

fn default_source() -> String {
    "/messages".to_string()
}

fn parse_inbound(line: &str) -> Result<Message> {
    let inbound: InboundMessage = serde_json::from_str(line)?;
    let source = MessageSource::parse(&inbound.source)?;

    let mut system = inbound.system_properties;
    let body = match inbound.body {
        serde_json::Value::String(text) => text.into_bytes(),
        other => {
            system
                .entry(system_properties::CONTENT_TYPE.to_string())
                .or_insert_with(|| "application/json".to_string());
            serde_json::to_vec(&other)?
        }
    };
    system
        .entry(system_properties::MESSAGE_ID.to_string())
        .or_insert_with(|| uuid::Uuid::new_v4().to_string());

    Ok(Message::builder(source, body)
        .properties(inbound.properties)
        .system_properties(system)
        .build())
}

/// Log startup summary
fn log_startup_summary(config: &AppConfig, router: &Router) {
    info!("=== EdgeHub Router Startup Summary ===");
    info!("  Hub: {}", config.hub_name);
    info!("  Routes: {}", router.route_table().len());
    info!("  Endpoints: {}", router.executor_statuses().len());
    info!("  Checkpoints: {}", config.checkpoint_path.display());
    match config.metrics_port {
        Some(port) => info!("  Metrics: http://0.0.0.0:{}/metrics", port),
        None => info!("  Metrics: Disabled"),
    }
    match &config.routes_file {
        Some(path) => info!("  Config Reload: every {:?} from {}", config.reload_interval, path.display()),
        None => info!("  Config Reload: Disabled"),
    }
    info!("======================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound_json_body() {
        let message = parse_inbound(
            r#"{"source":"/messages/modules/filter/outputs/out1","body":{"temp":30},"properties":{"alert":"yes"}}"#,
        )
        .unwrap();
        assert_eq!(message.source().path(), "/messages/modules/filter/outputs/out1");
        assert_eq!(message.body().as_ref(), b"{\"temp\":30}");
        assert_eq!(message.properties().get("alert"), Some("yes"));
        assert_eq!(
            message.system_properties().get(system_properties::CONTENT_TYPE),
            Some("application/json")
        );
        assert!(message.message_id().is_some());
    }

    #[test]
    fn test_parse_inbound_text_body() {
        let message = parse_inbound(r#"{"body":"plain","systemProperties":{"messageId":"m-1"}}"#).unwrap();
        assert_eq!(message.source(), &MessageSource::TELEMETRY);
        assert_eq!(message.body().as_ref(), b"plain");
        assert_eq!(message.message_id(), Some("m-1"));
        assert_eq!(message.system_properties().get(system_properties::CONTENT_TYPE), None);
    }

    #[test]
    fn test_parse_inbound_rejects_bad_source() {
        assert!(parse_inbound(r#"{"source":"messages","body":"x"}"#).is_err());
    }
}
