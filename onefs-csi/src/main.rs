//! OneFS CSI Driver
//!
//! Kubernetes CSI driver that provisions NFS volumes on a OneFS cluster
//! through directory quotas, NFS exports and snapshots.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use onefs_csi::backend::{BackendConnector, MemoryBackend, MemoryConnector, OneFsConnector};
use onefs_csi::csi::controller_server::ControllerServer;
use onefs_csi::csi::identity_server::IdentityServer;
use onefs_csi::csi::node_server::NodeServer;
use onefs_csi::identity::DRIVER_VERSION;
use onefs_csi::metrics;
use onefs_csi::mount::LinuxMounter;
use onefs_csi::types::{BackendKind, ServiceMode};
use onefs_csi::{ControllerService, DriverConfig, IdentityService, NodeService, Session};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "onefs-csi")]
#[command(about = "OneFS NFS CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path/to.sock or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    csi_endpoint: String,

    /// Services to run (controller, node, all)
    #[arg(long, env = "X_CSI_MODE", default_value = "all")]
    mode: ServiceMode,

    /// Driver name
    #[arg(long, env = "X_CSI_DRIVER_NAME", default_value = onefs_csi::config::DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "X_CSI_NODE_NAME")]
    node_id: Option<String>,

    /// Node IP, advertised as a topology segment
    #[arg(long, env = "X_CSI_NODE_IP")]
    node_ip: Option<String>,

    /// Storage backend (onefs, memory)
    #[arg(long, env = "X_CSI_BACKEND", default_value = "onefs")]
    backend: BackendKind,

    /// OneFS platform API endpoint (e.g., https://10.0.0.1:8080)
    #[arg(long, env = "X_CSI_ISI_ENDPOINT")]
    isi_endpoint: Option<String>,

    #[arg(long, env = "X_CSI_ISI_USER", default_value = "")]
    isi_user: String,

    #[arg(long, env = "X_CSI_ISI_PASSWORD", default_value = "", hide_env_values = true)]
    isi_password: String,

    /// Skip TLS certificate verification
    #[arg(long, env = "X_CSI_ISI_INSECURE", default_value_t = false, action = clap::ArgAction::Set)]
    isi_insecure: bool,

    /// Default access zone
    #[arg(long, env = "X_CSI_ISI_ACCESS_ZONE", default_value = onefs_csi::config::DEFAULT_ACCESS_ZONE)]
    isi_access_zone: String,

    /// Default parent directory for volumes
    #[arg(long, env = "X_CSI_ISI_PATH", default_value = onefs_csi::config::DEFAULT_BASE_PATH)]
    isi_path: String,

    /// Enforce quota hard thresholds
    #[arg(long, env = "X_CSI_ISI_QUOTA_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    isi_quota_enabled: bool,

    /// Connect to the cluster on demand before data operations
    #[arg(long, env = "X_CSI_ISI_AUTOPROBE", default_value_t = true, action = clap::ArgAction::Set)]
    isi_auto_probe: bool,

    /// Accept NodeStageVolume requests without an access mode
    #[arg(long, env = "X_CSI_ALLOW_OMITTED_ACCESS_MODE", default_value_t = false, action = clap::ArgAction::Set)]
    allow_omitted_access_mode: bool,

    /// Extra NFS mount options (comma-separated)
    #[arg(long, env = "X_CSI_NFS_MOUNT_OPTIONS", value_delimiter = ',')]
    nfs_mount_options: Vec<String>,

    /// OneFS request timeout in seconds
    #[arg(long, env = "X_CSI_ISI_REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9090)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Listen {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

fn parse_endpoint(endpoint: &str) -> Result<Listen, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(format!("Invalid CSI endpoint '{}': empty socket path", endpoint));
        }
        return Ok(Listen::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        return addr
            .parse()
            .map(Listen::Tcp)
            .map_err(|e| format!("Invalid CSI endpoint '{}': {}", endpoint, e));
    }
    if endpoint.starts_with('/') {
        return Ok(Listen::Unix(PathBuf::from(endpoint)));
    }
    Err(format!(
        "Invalid CSI endpoint '{}': expected unix:// or tcp://",
        endpoint
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    let config = DriverConfig {
        driver_name: args.driver_name,
        mode: args.mode,
        node_id,
        node_ip: args.node_ip,
        backend: args.backend,
        endpoint: args.isi_endpoint,
        user: args.isi_user,
        password: args.isi_password,
        insecure: args.isi_insecure,
        access_zone: args.isi_access_zone,
        base_path: args.isi_path,
        quota_enabled: args.isi_quota_enabled,
        auto_probe: args.isi_auto_probe,
        allow_omitted_access_mode: args.allow_omitted_access_mode,
        nfs_mount_options: args
            .nfs_mount_options
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect(),
        request_timeout: Duration::from_secs(args.request_timeout_secs),
    };
    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;
    let listen = parse_endpoint(&args.csi_endpoint)?;

    info!(
        driver_name = %config.driver_name,
        version = DRIVER_VERSION,
        endpoint = %args.csi_endpoint,
        mode = %config.mode,
        backend = ?config.backend,
        node_id = %config.node_id,
        access_zone = %config.access_zone,
        base_path = %config.base_path,
        "Starting OneFS CSI Driver"
    );

    let connector: Option<Arc<dyn BackendConnector>> = if config.mode.runs_controller() {
        match config.backend {
            BackendKind::OneFs => Some(Arc::new(OneFsConnector::new(config.onefs_settings()))),
            BackendKind::Memory => {
                warn!("Using the in-memory backend; volumes are not persisted");
                let backend = Arc::new(MemoryBackend::with_zone(config.access_zone.clone()));
                Some(Arc::new(MemoryConnector::new(backend)))
            }
        }
    } else {
        None
    };

    let mode = config.mode;
    let session = Arc::new(Session::new(config, connector));

    // Initial probe; the CO retries through Probe if this fails
    match session.probe().await {
        Ok(()) => info!("Initial probe succeeded"),
        Err(e) => error!(error = %e, "Initial probe failed, continuing"),
    }

    let controller = mode
        .runs_controller()
        .then(|| ControllerServer::new(ControllerService::new(session.clone())));
    let node = mode.runs_node().then(|| {
        NodeServer::new(NodeService::new(
            session.clone(),
            Arc::new(LinuxMounter::new()),
        ))
    });

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new(session.clone())))
        .add_optional_service(controller)
        .add_optional_service(node);

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match listen {
        Listen::Unix(path) => {
            // Remove a socket left behind by a previous run
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let listener = UnixListener::bind(&path)?;
            info!("gRPC server listening on unix://{}", path.display());
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;

            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(error = %e, path = %path.display(), "Failed to remove socket");
            }
        }
        Listen::Tcp(addr) => {
            info!("gRPC server listening on {}", addr);
            router.serve_with_shutdown(addr, shutdown).await?;
        }
    }

    info!("OneFS CSI Driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        _ = recv_signal(sigterm.as_mut()) => info!("Received SIGTERM"),
        _ = recv_signal(sigint.as_mut()) => info!("Received SIGINT"),
        _ = recv_signal(sighup.as_mut()) => info!("Received SIGHUP, shutting down"),
    }
}

/// A handler that failed to install never fires.
async fn recv_signal(sig: Option<&mut signal::unix::Signal>) -> Option<()> {
    match sig {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}
