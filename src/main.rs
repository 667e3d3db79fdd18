//! BACnet Event Gateway server binary.
//!
//! Loads the configuration, wires the pipeline (event store -> decoder ->
//! registry/cache -> BACnet COV), and runs until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use bacnet_gateway::cache::RedisStore;
use bacnet_gateway::config::{GatewayConfig, LoggingConfig};
use bacnet_gateway::consumer::LongPollTransport;
use bacnet_gateway::Gateway;

const LOG_TO_STDOUT: u8 = 1;
const LOG_TO_FILE: u8 = 2;

/// BACnet Event Gateway
#[derive(Parser, Debug)]
#[command(name = "bacnet-gateway")]
#[command(about = "Event-store to BACnet gateway with COV notifications", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/bacnet-gateway/config.json")]
    config: PathBuf,
}

fn level_directive(level: &str) -> &str {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => level,
        // The config knows "fatal"; tracing does not.
        "fatal" => "error",
        _ => "info",
    }
}

fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guard = None;

    if config.outputs & LOG_TO_STDOUT != 0 || config.outputs == 0 {
        let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format == "json" {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(config.colorize)
                .boxed()
        };
        layers.push(layer);
    }

    if config.outputs & LOG_TO_FILE != 0 && !config.file.is_empty() {
        let path = std::path::Path::new(&config.file);
        let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bacnet-gateway.log".to_string());
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format == "json" {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed()
        };
        layers.push(layer);
    }

    tracing_subscriber::registry().with(layers).with(filter).init();
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("received terminate signal, shutting down...");
        },
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match GatewayConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.logging);

    info!(
        "BACnet Event Gateway v{} starting (device instance {})",
        env!("CARGO_PKG_VERSION"),
        config.server.device_instance
    );

    let cache_store = match RedisStore::new(
        &config.cache_url(),
        std::time::Duration::from_millis(config.cache.connection_timeout_ms),
        std::time::Duration::from_millis(config.cache.command_timeout_ms),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot set up cache client: {}", e);
            std::process::exit(1);
        }
    };

    let transport = match LongPollTransport::from_config(&config.event_store) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("cannot set up event store client: {}", e);
            std::process::exit(1);
        }
    };

    let gateway = match Gateway::start(config, cache_store, transport).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    gateway.shutdown().await;
}
