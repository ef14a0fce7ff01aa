//! Waypoint Daemon - Service registration and discovery
//!
//! `waypointd` keeps one local service instance registered under a renewed
//! lease and follows the instance sets of any number of other services:
//! - Layered configuration (defaults, file, `WAYPOINT_*` env, CLI flags)
//! - Structured logging, optionally as JSON
//! - Graceful deregistration on Ctrl+C / SIGTERM

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waypoint_daemon::config::{LoggingConfig, ServiceConfig, StoreConfig};
use waypoint_daemon::{connect_store, shutdown_signal, DaemonConfig, DaemonResult, Node};
use waypoint_registry::Registry;

/// Waypoint Daemon CLI
#[derive(Parser)]
#[command(name = "waypointd")]
#[command(about = "Waypoint Daemon - Lease-based service registration and discovery", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WAYPOINT_CONFIG")]
    config: Option<String>,

    /// Log level or filter directive
    #[arg(long, env = "WAYPOINT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "WAYPOINT_LOG_JSON")]
    json: bool,

    /// etcd endpoints; switches the store to etcd
    #[arg(long, value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Name of the local service to register
    #[arg(long, requires_all = ["address", "port"])]
    service: Option<String>,

    /// Address the local service listens on
    #[arg(long)]
    address: Option<String>,

    /// Port the local service listens on
    #[arg(long)]
    port: Option<u16>,

    /// Lease TTL in seconds for the local service
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Services to watch, comma separated
    #[arg(short, long, value_delimiter = ',')]
    watch: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut DaemonConfig) -> DaemonResult<()> {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json {
            config.logging.json = true;
        }

        if !self.etcd_endpoints.is_empty() {
            match &mut config.store {
                StoreConfig::Etcd { endpoints, .. } => *endpoints = self.etcd_endpoints.clone(),
                store @ StoreConfig::Memory => {
                    *store = StoreConfig::Etcd {
                        endpoints: self.etcd_endpoints.clone(),
                        dial_timeout_secs: 5,
                        keep_alive_secs: 30,
                        username: None,
                        password: None,
                    }
                }
            }
        }

        if let (Some(name), Some(address), Some(port)) = (&self.service, &self.address, self.port) {
            config.service = Some(ServiceConfig {
                name: name.clone(),
                address: address.clone(),
                port,
                ttl_secs: self.ttl_secs.unwrap_or(10),
            });
        } else if let (Some(ttl), Some(service)) = (self.ttl_secs, config.service.as_mut()) {
            service.ttl_secs = ttl;
        }

        if !self.watch.is_empty() {
            config.watch.services = self.watch.clone();
        }

        config.validate()
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration, then override with CLI args
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;

    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        prefix = %config.registry.prefix,
        service = ?config.service.as_ref().map(|s| &s.name),
        watch = ?config.watch.services,
        "Starting waypointd"
    );

    let store = connect_store(&config.store).await?;
    let registry = Registry::new(store, config.registry.to_registry_config())?;

    let node = match Node::start(&registry, &config).await {
        Ok(node) => node,
        Err(e) => {
            registry.shutdown().await;
            return Err(e);
        }
    };

    shutdown_signal().await;

    node.stop();
    registry.shutdown().await;
    info!("waypointd stopped");

    Ok(())
}
