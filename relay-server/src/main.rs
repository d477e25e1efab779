//! Relay server binary
//!
//! Streams the progress log of a scripted background task to HTTP clients.
//! Send SIGHUP to re-read the config file and swap log destinations without
//! dropping connected clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::config::RelayConfig;
use relay_core::driver::StreamDriver;
use relay_core::logging::{init_logging, LoggingHandle};
use relay_core::registry::ObserverRegistry;
use relay_core::task::{ScriptedTaskFactory, TaskFactory};
use relay_server::AppState;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Stream a background task's process log over server-sent events")]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(short, long, env = "RELAY_PORT", default_value = "8000")]
    port: u16,

    /// Console log level, overrides the config file
    #[arg(short, long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => RelayConfig::default(),
        };
        if let Some(level) = &self.log_level {
            config.log.console_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let registry = Arc::new(ObserverRegistry::new());
    let logging = init_logging(&config.log, Arc::clone(&registry))?;

    info!("Relay server v{}", env!("CARGO_PKG_VERSION"));
    info!("Poll interval: {}ms", config.stream.poll_interval_ms);
    info!("Cancel policy: {:?}", config.stream.cancel_policy);

    let driver = StreamDriver::new(registry, config.stream.clone());
    let factory: Arc<dyn TaskFactory> = Arc::new(ScriptedTaskFactory::new(config.agent.clone()));
    let state = AppState::new(driver, factory);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    watch_reload(cli.config.clone(), cli.log_level.clone(), logging);

    relay_server::serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for ctrl-c: {}", e),
    }
}

/// Re-read log settings on SIGHUP
#[cfg(unix)]
fn watch_reload(path: Option<PathBuf>, log_level: Option<String>, logging: LoggingHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let Some(path) = path else {
        return;
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let reloaded = RelayConfig::load(&path).and_then(|mut config| {
                if let Some(level) = &log_level {
                    config.log.console_level = level.clone();
                }
                logging.reconfigure(&config.log)
            });
            match reloaded {
                Ok(()) => info!("Log settings reloaded from {}", path.display()),
                Err(e) => error!("Failed to reload {}: {}", path.display(), e),
            }
        }
    });
}

#[cfg(not(unix))]
fn watch_reload(_path: Option<PathBuf>, _log_level: Option<String>, _logging: LoggingHandle) {}
