//! iSCSI SAN CSI Node Plugin
//!
//! Serves the CSI Identity and Node services on the kubelet plugin socket.

use std::path::PathBuf;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use csi_node::config::{DEFAULT_ENDPOINT, DEFAULT_STATE_DIR, ListenAddress};
use csi_node::csi::identity_server::IdentityServer;
use csi_node::csi::node_server::NodeServer;
use csi_node::host;
use csi_node::lifecycle::PersistMode;
use csi_node::metrics;
use csi_node::platform::{IscsiLogging, Tools};
use csi_node::{IdentityService, NodeConfig, NodeService};

/// CLI arguments for the node plugin
#[derive(Parser, Debug)]
#[command(name = "csi-node")]
#[command(about = "iSCSI SAN CSI node plugin for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Directory for connector records
    #[arg(long, env = "CSI_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// open-iscsi initiator name file, source of the node ID
    #[arg(long, default_value = host::INITIATOR_NAME_FILE)]
    initiator_name_file: PathBuf,

    /// Write connector records only after a successful mount
    #[arg(long, default_value = "false")]
    persist_after_mount: bool,

    /// Log the raw output of iscsiadm and multipath tools
    #[arg(long, default_value = "false")]
    iscsi_verbose: bool,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let endpoint: ListenAddress = self.endpoint.parse()?;
        let metrics_addr = self
            .metrics_addr
            .map(|addr| {
                addr.parse::<std::net::SocketAddr>()
                    .map_err(|e| format!("Invalid metrics address '{}': {}", addr, e))
            })
            .transpose()?;

        Ok(NodeConfig {
            endpoint,
            state_dir: self.state_dir,
            initiator_name_file: self.initiator_name_file,
            proc_modules: PathBuf::from(host::PROC_MODULES),
            persist_mode: if self.persist_after_mount {
                PersistMode::AfterMount
            } else {
                PersistMode::AfterConnect
            },
            iscsi_logging: IscsiLogging {
                verbose: self.iscsi_verbose,
            },
            metrics_addr,
        })
    }
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

    let config = args.into_config()?;

    if let Some(addr) = config.metrics_addr
        && let Err(e) = metrics::init_metrics(addr)
    {
        return Err(format!("Failed to initialize metrics: {}", e).into());
    }

    info!(
        driver_name = %csi_node::identity::DRIVER_NAME,
        version = %csi_node::identity::DRIVER_VERSION,
        endpoint = %config.endpoint,
        state_dir = %config.state_dir.display(),
        persist_mode = ?config.persist_mode,
        iscsi_verbose = config.iscsi_logging.verbose,
        "Starting CSI node plugin"
    );

    match host::read_initiator_name(&config.initiator_name_file) {
        Ok(name) => info!(node_id = %name, "Using iSCSI initiator name as node ID"),
        Err(e) => warn!(error = %e, "Initiator name unavailable, NodeGetInfo will fail"),
    }

    let node = NodeService::from_config(&config, Tools::linux(config.iscsi_logging));
    node.lifecycle()
        .store()
        .ensure_dir()
        .map_err(|e| format!("Cannot use state directory: {}", e))?;
    let identity = IdentityService::new(&config.proc_modules);

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node));

    match &config.endpoint {
        ListenAddress::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // A socket left behind by a previous run would make bind fail
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;
            info!("gRPC server listening on unix://{}", path.display());

            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
                    shutdown_signal().await;
                    info!("Shutdown signal received, draining connections...");
                })
                .await?;

            if let Err(e) = std::fs::remove_file(path) {
                warn!(error = %e, "Could not remove socket");
            }
        }
        ListenAddress::Tcp(addr) => {
            info!("gRPC server listening on {}", addr);
            router
                .serve_with_shutdown(*addr, async {
                    shutdown_signal().await;
                    info!("Shutdown signal received, draining connections...");
                })
                .await?;
        }
    }

    info!("csi-node shutdown complete");
    Ok(())
}

/// Wait for one signal, or forever if its handler could not be installed.
async fn recv_or_pending(signal: Option<signal::unix::Signal>) {
    match signal {
        Some(mut signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let install = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install {} handler: {}", name, e);
            None
        }
    };

    let sigterm = install(SignalKind::terminate(), "SIGTERM");
    let sigint = install(SignalKind::interrupt(), "SIGINT");
    let sighup = install(SignalKind::hangup(), "SIGHUP");

    tokio::select! {
        _ = recv_or_pending(sigterm) => {
            info!("Received SIGTERM");
        }
        _ = recv_or_pending(sigint) => {
            info!("Received SIGINT");
        }
        _ = recv_or_pending(sighup) => {
            info!("Received SIGHUP, shutting down");
        }
    }
}
