//! S3 Volume Agent
//!
//! Node and controller agent exposing S3 buckets as mountable volumes.
//!
//! ```text
//! lifecycle request ──▶ REST API ──▶ Driver ──▶ S3 / systemd / mount(2)
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use s3_volume_agent::{
    AgentConfig, AgentMetrics, ApiServer, ApiServerConfig, Driver, Error, HostPorts, Result,
    S3ObjectStoreFactory, SecretResolver,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// S3 Volume Agent - S3 buckets as Kubernetes volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identity of this node
    #[arg(long, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Optional YAML configuration file
    #[arg(long, env = "AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Backend for volumes that do not choose one
    #[arg(long, env = "DEFAULT_MOUNTER")]
    default_mounter: Option<String>,

    /// Plugin directory as seen from the host
    #[arg(long, env = "PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;

    info!("Starting S3 Volume Agent");
    info!("  Version: {}", s3_volume_agent::VERSION);
    info!("  Driver: {}", config.driver.name);
    info!("  Node: {}", config.driver.node_id);
    info!("  Default mounter: {}", config.driver.default_mounter);
    info!("  REST API: {}", args.api_addr);

    let metrics = Arc::new(AgentMetrics::new()?);

    let secrets = match kube::Client::try_default().await {
        Ok(client) => SecretResolver::new().with_client(client),
        Err(e) => {
            warn!("Kubernetes client unavailable, secret references disabled: {}", e);
            SecretResolver::new()
        }
    };

    let ports = HostPorts::linux(config.systemd.clone());
    let driver = Arc::new(Driver::new(
        config,
        ports,
        Arc::new(S3ObjectStoreFactory),
        secrets,
        metrics.clone(),
    ));

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let exported = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exported).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = ApiServer::new(api_config, driver);

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown.send(());
        }
    });

    api_server.run().await?;

    info!("Agent shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if !args.node_id.is_empty() {
        config.driver.node_id = args.node_id.clone();
    }
    if let Some(mounter) = &args.default_mounter {
        config.driver.default_mounter = mounter.clone();
    }
    if let Some(dir) = &args.plugin_dir {
        config.mounter.host_plugin_dir = dir.clone();
    }
    if config.driver.node_id.is_empty() {
        return Err(Error::Configuration("node id is required".into()));
    }
    config.validate()?;
    Ok(config)
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
    for directive in [
        "hyper=warn",
        "kube=info",
        "tower=warn",
        "axum=info",
        "aws_config=warn",
        "aws_smithy_runtime=warn",
    ] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("log filter {}: {}", directive, e)))?,
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

fn plain_response(
    status: hyper::StatusCode,
    body: &'static str,
) -> hyper::Response<hyper::Body> {
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
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

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

async fn run_metrics_server(addr: &str, metrics: Arc<AgentMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
                            }
                        },
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
