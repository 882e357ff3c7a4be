//! Node Disk Operator
//!
//! Runs the block device probe on a single node and publishes the devices
//! it finds as BlockDevice resources.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_disk_operator::domain::ports::{BlockDeviceStoreRef, PartitionerRef};
use node_disk_operator::{
    Controller, Error, FilterConfig, HardwareScanner, InMemoryBlockDeviceStore,
    KubeBlockDeviceStore, KubeStoreConfig, ProbeConfig, ProbeDaemon, ProbeEvent, ProbeMetrics,
    Result, ScannerConfig, SgdiskPartitioner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Disk Operator - block device probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubernetes node name
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Hostname recorded on resources, defaults to the node name
    #[arg(long, env = "HOSTNAME_OVERRIDE")]
    hostname: Option<String>,

    /// Namespace holding BlockDevice resources
    #[arg(long, env = "NAMESPACE", default_value = "openebs")]
    namespace: String,

    /// Path to sysfs
    #[arg(long, env = "SYSFS_PATH", default_value = "/sys")]
    sysfs_path: PathBuf,

    /// Path to the udev database
    #[arg(long, env = "UDEV_DATA_PATH", default_value = "/run/udev/data")]
    udev_data_path: PathBuf,

    /// Path to the mountinfo file
    #[arg(long, env = "MOUNTINFO_PATH", default_value = "/proc/self/mountinfo")]
    mountinfo_path: PathBuf,

    /// Base directory of local PV hostpath volumes
    #[arg(long, env = "LOCAL_PV_BASE_PATH", default_value = "/var/openebs/local")]
    local_pv_base_path: PathBuf,

    /// Rescan interval in seconds
    #[arg(long, env = "RESCAN_INTERVAL", default_value = "30")]
    rescan_interval_secs: u64,

    /// Upper bound in seconds for retrying a single device
    #[arg(long, env = "MAX_RETRY_ELAPSED", default_value = "120")]
    max_retry_elapsed_secs: u64,

    /// YAML file with device path filters
    #[arg(long, env = "FILTER_CONFIG")]
    filter_config: Option<PathBuf>,

    /// sgdisk binary used to partition raw disks
    #[arg(long, env = "SGDISK_BINARY", default_value = "sgdisk")]
    sgdisk_binary: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn probe_config(&self) -> Result<ProbeConfig> {
        let filters = match &self.filter_config {
            Some(path) => FilterConfig::load(path)?,
            None => FilterConfig::default(),
        };
        let config = ProbeConfig {
            node_name: self.node_name.clone(),
            hostname: self.hostname.clone().unwrap_or_else(|| self.node_name.clone()),
            sysfs_path: self.sysfs_path.clone(),
            udev_data_path: self.udev_data_path.clone(),
            mountinfo_path: self.mountinfo_path.clone(),
            local_pv_base_path: self.local_pv_base_path.clone(),
            rescan_interval: Duration::from_secs(self.rescan_interval_secs),
            max_retry_elapsed: Duration::from_secs(self.max_retry_elapsed_secs),
            filters,
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = args.probe_config()?;

    info!("Starting Node Disk Operator probe");
    info!("  Version: {}", node_disk_operator::VERSION);
    info!("  Node: {}", config.node_name);
    info!("  Rescan interval: {:?}", config.rescan_interval);
    info!("  Standalone mode: {}", args.standalone);

    let store: BlockDeviceStoreRef = if args.standalone {
        Arc::new(InMemoryBlockDeviceStore::new())
    } else {
        let client = kube::Client::try_default().await?;
        Arc::new(KubeBlockDeviceStore::new(
            client,
            KubeStoreConfig {
                namespace: args.namespace.clone(),
                hostname: config.hostname.clone(),
            },
        ))
    };
    let partitioner: PartitionerRef = Arc::new(SgdiskPartitioner::with_binary(args.sgdisk_binary.clone()));

    let metrics = ProbeMetrics::new()?;
    let controller = Arc::new(Controller::new(store, partitioner, metrics.clone()));
    let scanner = HardwareScanner::new(ScannerConfig::from_probe_config(&config)?);
    let daemon = ProbeDaemon::new(scanner, ProbeEvent::new(controller), &config);
    let ready = daemon.readiness();

    let shutdown = CancellationToken::new();

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    daemon.run(shutdown).await?;

    info!("Probe shutdown complete");
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
    for directive in ["hyper=warn", "kube=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
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

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.clone();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready.load(Ordering::Relaxed) => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "initial scan pending"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
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

async fn run_metrics_server(addr: &str, metrics: ProbeMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match (req.uri().path(), metrics.encode()) {
                        ("/metrics", Ok(buffer)) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(TextEncoder::new().format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        ("/metrics", Err(e)) => {
                            warn!("Unable to encode metrics: {}", e);
                            let mut response = Response::new(Body::from("encoding failed"));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
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
