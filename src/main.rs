// src/main.rs
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use url::Url;

use license_proxy::{
    config::{self, ProxyConfig},
    health::HealthChecker,
    metrics::MetricsRegistry,
    proxy::{Backend, BackendPool, Proxy},
    server::{RequestHandler, ServerBuilder},
};

#[derive(Parser)]
#[command(name = "license-proxy", version)]
#[command(about = "Detects license servers and proxies to the fastest available one")]
struct Cli {
    /// Spaces used to indent JSON output (0 prints compact JSON)
    #[arg(short, long, default_value_t = 2, global = true)]
    format: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a license server. Outputs JSON.
    Check { url: Url },

    /// Check a list of license servers, one per line. Outputs JSON.
    CheckAll(CheckAllArgs),

    /// Run an HTTP proxy that uses the fastest available license server
    Proxy(ProxyArgs),
}

#[derive(Args)]
struct CheckAllArgs {
    /// Server list file; '-' or nothing reads standard input
    file: Option<String>,

    /// Output only available servers
    #[arg(long)]
    available: bool,

    /// Output only online servers
    #[arg(long)]
    online: bool,

    /// Output only server URLs separated by new lines
    #[arg(long)]
    newline: bool,
}

#[derive(Args)]
struct ProxyArgs {
    /// Port to listen on [default: 8080]
    #[arg(short, long)]
    port: Option<u16>,

    /// Server list file; '-' reads standard input
    #[arg(long)]
    servers: Option<String>,

    /// Access token file. When set, clients must prefix paths with a token:
    /// http://localhost:8080/<token>
    #[arg(long)]
    tokens: Option<String>,

    /// YAML or JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("license_proxy=info,hyper=info")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { url } => check(url, cli.format).await,
        Commands::CheckAll(args) => check_all(args, cli.format).await,
        Commands::Proxy(args) => run_proxy(args).await,
    }
}

async fn check(url: Url, indent: usize) -> Result<()> {
    let pool = BackendPool::new(vec![url], default_interval(), Default::default())?;
    pool.run_sweep().await;
    print_json(&pool.backends()[0].status(), indent)
}

async fn check_all(args: CheckAllArgs, indent: usize) -> Result<()> {
    let data = config::read_source(args.file.as_deref()).await?;
    let servers = config::parse_server_list(&data)?;

    let pool = BackendPool::new(servers, default_interval(), Default::default())?;
    pool.run_sweep().await;

    let selected: Vec<&Arc<Backend>> = pool
        .backends()
        .iter()
        .filter(|b| !args.available || b.is_available())
        .filter(|b| !args.online || b.is_online())
        .collect();

    if args.newline {
        let urls: Vec<&str> = selected.iter().map(|b| b.endpoint().as_str()).collect();
        println!("{}", urls.join("\n"));
        return Ok(());
    }

    let statuses: Vec<_> = selected.iter().map(|b| b.status()).collect();
    print_json(&statuses, indent)
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => config::load_config(path).await?,
        None => ProxyConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(source) = &args.servers {
        config.servers = config::parse_server_list(&config::read_source(Some(source.as_str())).await?)?;
    }
    if let Some(source) = &args.tokens {
        config.tokens = config::parse_token_list(&config::read_source(Some(source.as_str())).await?);
    }
    config.validate().context("invalid proxy configuration")?;

    info!(
        servers = config.servers.len(),
        port = config.port,
        sweep_interval_secs = config.sweep_interval_secs,
        "Configuration loaded"
    );

    let metrics_registry = if config.metrics.enabled {
        Some(MetricsRegistry::new()?)
    } else {
        None
    };
    let metrics = metrics_registry.as_ref().map(MetricsRegistry::collector);

    let pool = Arc::new(BackendPool::new(
        config.servers.clone(),
        config.sweep_interval(),
        config.probe.clone(),
    )?);
    let checker = Arc::new(HealthChecker::new(pool.clone(), metrics.clone()));
    let proxy = Arc::new(Proxy::new(pool, config.tokens.clone(), metrics));

    if let Some(registry) = metrics_registry {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        start_metrics_server(metrics_addr, registry, config.metrics.path.clone()).await?;
    }

    // Initial sweep, so the first proxied request already has a ranking
    checker.sweep().await;
    let sweeper = tokio::spawn(checker.clone().start());

    let stop = {
        let checker = checker.clone();
        async move {
            shutdown_signal().await;
            checker.shutdown();
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    ServerBuilder::new(addr)
        .with_handler(RequestHandler::new(proxy))
        .serve_with_shutdown(stop)
        .await?;

    checker.shutdown();
    if tokio::time::timeout(Duration::from_secs(5), sweeper).await.is_err() {
        warn!("Sweep still in progress at exit");
    }

    info!("Goodbye!");
    Ok(())
}

fn default_interval() -> Duration {
    Duration::from_secs(config::DEFAULT_SWEEP_INTERVAL_SECS)
}

fn print_json<T: Serialize>(value: &T, indent: usize) -> Result<()> {
    let out = if indent == 0 {
        serde_json::to_string(value)?
    } else {
        let indent = vec![b' '; indent];
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser)?;
        String::from_utf8(buf)?
    };
    println!("{out}");
    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    if req.uri().path() != path.as_str() {
                        return Ok::<_, Infallible>(text_response(StatusCode::NOT_FOUND, "Not Found"));
                    }
                    let response = match registry.gather() {
                        Ok(metrics) => {
                            let mut response = Response::new(Body::from(metrics));
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static("text/plain; version=0.0.4"),
                            );
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?
        .serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
