//! Storage Motion Orchestrator
//!
//! Runs a live VM migration with volumes against the host agents listed in an
//! inventory document, or serves health and metrics endpoints.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_motion::domain::model::{HostId, PoolId};
use storage_motion::domain::ports::AgentChannelRef;
use storage_motion::driver::HostEndpointSelector;
use storage_motion::{
    DriverRegistry, Error, HttpAgentChannel, HttpManagedStorageClient, Inventory,
    ManagedPrimaryDriver, MigrationRequest, MotionMetrics, OrchestratorConfig, PoolHostListener,
    Result, StorageMotionStrategy, StrategyPriority,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Motion Orchestrator - live VM migration with attached volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, env = "STORAGE_MOTION_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Agent listen port, overrides the configuration file
    #[arg(long, env = "AGENT_PORT", global = true)]
    agent_port: Option<u16>,

    /// Per-command agent timeout in seconds, overrides the configuration file
    #[arg(long, env = "COMMAND_TIMEOUT_SECS", global = true)]
    command_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate a VM and its volumes as described by a request file
    Migrate {
        /// Inventory document (hosts, pools, volumes, snapshots)
        #[arg(long)]
        inventory: PathBuf,

        /// Migration request (vm, source, destination, volume moves)
        #[arg(long)]
        plan: PathBuf,

        /// Report format
        #[arg(long, value_enum, default_value = "yaml")]
        output: OutputFormat,
    },

    /// Attach a pool to a host and report the pool's capacity
    ConnectPool {
        #[arg(long)]
        inventory: PathBuf,

        #[arg(long)]
        pool: String,

        #[arg(long)]
        host: String,
    },

    /// Serve health and metrics endpoints
    Serve {
        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: String,

        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;
    info!("Starting {} {}", storage_motion::NAME, storage_motion::VERSION);

    match args.command {
        Commands::Migrate {
            inventory,
            plan,
            output,
        } => migrate(config, inventory, plan, output).await,
        Commands::ConnectPool {
            inventory,
            pool,
            host,
        } => connect_pool(config, inventory, pool, host).await,
        Commands::Serve {
            health_addr,
            metrics_addr,
        } => serve(health_addr, metrics_addr).await,
    }
}

fn load_config(args: &Args) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(port) = args.agent_port {
        config.agent.port = port;
    }
    if let Some(secs) = args.command_timeout_secs {
        config.agent.command_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Commands
// =============================================================================

async fn migrate(
    config: OrchestratorConfig,
    inventory_path: PathBuf,
    plan_path: PathBuf,
    output: OutputFormat,
) -> Result<()> {
    let inventory = Arc::new(Inventory::from_file(&inventory_path)?);
    let request = MigrationRequest::from_file(&plan_path)?;
    let resolved = inventory.resolve(&request)?;

    let channel: AgentChannelRef = Arc::new(HttpAgentChannel::new(config.agent.clone())?);
    let repos = inventory.repositories();
    let drivers = DriverRegistry::new(
        channel.clone(),
        Arc::new(HostEndpointSelector::new(repos.hosts.clone())),
        &config.driver,
    );
    let managed_timeout = Duration::from_secs(config.driver.managed_timeout_secs);
    for pool in inventory.managed_pools() {
        let client = HttpManagedStorageClient::for_pool(&pool, managed_timeout)?;
        drivers.register_managed(pool.id.clone(), Arc::new(ManagedPrimaryDriver::new(Arc::new(client))));
    }
    let drivers = Arc::new(drivers);

    let metrics = Arc::new(MotionMetrics::new(prometheus::default_registry())?);
    let strategy = StorageMotionStrategy::new(
        channel,
        drivers.clone(),
        repos,
        config.motion.clone(),
        Some(metrics),
    );

    if strategy.can_handle(&resolved.source, &resolved.destination) == StrategyPriority::CantHandle {
        return Err(Error::Configuration(format!(
            "hosts {} and {} cannot live-migrate storage",
            resolved.source.id, resolved.destination.id
        )));
    }

    let outcome = strategy
        .migrate_vm_with_volumes(
            &resolved.vm,
            &resolved.source,
            &resolved.destination,
            &resolved.plan,
        )
        .await;
    drivers.shutdown().await;
    let report = outcome?;

    let rendered = match output {
        OutputFormat::Yaml => serde_yaml::to_string(&report)?,
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
    };
    println!("{}", rendered);
    Ok(())
}

async fn connect_pool(
    config: OrchestratorConfig,
    inventory_path: PathBuf,
    pool_id: String,
    host_id: String,
) -> Result<()> {
    let inventory = Arc::new(Inventory::from_file(&inventory_path)?);
    let repos = inventory.repositories();

    let pool = repos
        .pools
        .get(&PoolId::new(pool_id.as_str()))
        .await?
        .ok_or_else(|| Error::ResourceNotFound {
            kind: "StoragePool".into(),
            name: pool_id.clone(),
        })?;
    let host = repos
        .hosts
        .get(&HostId::new(host_id.as_str()))
        .await?
        .ok_or_else(|| Error::ResourceNotFound {
            kind: "Host".into(),
            name: host_id.clone(),
        })?;

    let channel: AgentChannelRef = Arc::new(HttpAgentChannel::new(config.agent)?);
    let listener = PoolHostListener::new(channel, repos.pools.clone());
    match listener.host_connected(&pool, &host).await? {
        Some(info) => println!("{}", serde_yaml::to_string(&info)?),
        None => info!("Pool {} is managed; nothing to attach", pool.id),
    }
    Ok(())
}

async fn serve(health_addr: String, metrics_addr: String) -> Result<()> {
    // Registered so the families are exported before the first migration
    let _metrics = MotionMetrics::new(prometheus::default_registry())?;

    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    run_metrics_server(&metrics_addr).await?;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("log directive {}: {}", directive, e)))?,
        );
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
