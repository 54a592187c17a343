//! gRPC server setup and lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::{error, info, warn};

use proxmox_csi_proto::{ControllerServer, IdentityServer, NodeServer};

use crate::config::Config;
use crate::services::{ControllerService, IdentityService, NodeService};

/// gRPC message size limit, both directions.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
/// Bound on in-flight RPC handlers.
const MAX_CONCURRENT_RPCS: usize = 10;
/// How long in-flight RPCs may drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A parsed CSI endpoint.
#[derive(Debug, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// Parse a CSI endpoint such as `unix:///csi/csi.sock` or
/// `tcp://127.0.0.1:10000`.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint> {
    let (protocol, address) = endpoint
        .split_once("://")
        .with_context(|| format!("Invalid endpoint format: {}", endpoint))?;

    match protocol {
        "unix" => {
            if address.is_empty() {
                bail!("Empty unix socket path in endpoint: {}", endpoint);
            }
            Ok(Endpoint::Unix(PathBuf::from(address)))
        }
        "tcp" => {
            let addr = address
                .parse()
                .with_context(|| format!("Invalid TCP address: {}", address))?;
            Ok(Endpoint::Tcp(addr))
        }
        other => bail!("Unsupported protocol: {}", other),
    }
}

/// Run the Controller daemon: Identity + Controller services.
pub async fn serve_controller(endpoint: &str, config: Config) -> Result<()> {
    info!(endpoint = %endpoint, "Starting CSI Controller server");

    let identity = IdentityServer::new(IdentityService)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);
    let controller = ControllerServer::new(ControllerService::new(&config)?)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);

    let router = Server::builder()
        .concurrency_limit_per_connection(MAX_CONCURRENT_RPCS)
        .add_service(identity)
        .add_service(controller);

    serve_router(router, parse_endpoint(endpoint)?).await
}

/// Run the Node daemon: Identity + Node services.
pub async fn serve_node(endpoint: &str, node_name: String) -> Result<()> {
    info!(endpoint = %endpoint, node = %node_name, "Starting CSI Node server");

    let identity = IdentityServer::new(IdentityService)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);
    let node = NodeServer::new(NodeService::new(node_name))
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);

    let router = Server::builder()
        .concurrency_limit_per_connection(MAX_CONCURRENT_RPCS)
        .add_service(identity)
        .add_service(node);

    serve_router(router, parse_endpoint(endpoint)?).await
}

async fn serve_router(router: Router, endpoint: Endpoint) -> Result<()> {
    match endpoint {
        Endpoint::Unix(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create socket dir {}", dir.display()))?;
            }
            cleanup_socket(&path);

            let listener = UnixListener::bind(&path)
                .with_context(|| format!("Failed to bind unix socket {}", path.display()))?;
            let incoming = UnixListenerStream::new(listener);

            info!(socket = %path.display(), "Server listening");
            let result = run_with_shutdown(
                router.serve_with_incoming_shutdown(incoming, shutdown_signal()),
            )
            .await;

            cleanup_socket(&path);
            result
        }
        Endpoint::Tcp(addr) => {
            info!(address = %addr, "Server listening");
            run_with_shutdown(router.serve_with_shutdown(addr, shutdown_signal())).await
        }
    }
}

/// Drive the server, bounding the post-signal drain: RPCs still running
/// when the grace period expires are abandoned.
async fn run_with_shutdown<F>(serve: F) -> Result<()>
where
    F: Future<Output = std::result::Result<(), tonic::transport::Error>>,
{
    tokio::select! {
        result = serve => result.map_err(|e| anyhow::anyhow!("gRPC server error: {}", e)),
        _ = drain_deadline() => {
            warn!("Shutdown grace period expired, aborting in-flight RPCs");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    wait_for_signal().await;
    info!("Shutdown signal received, draining in-flight RPCs");
}

async fn drain_deadline() {
    wait_for_signal().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn cleanup_socket(path: &Path) {
    if path.exists() {
        info!(socket = %path.display(), "Removing existing socket");
        if let Err(e) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_endpoint() {
        let endpoint = parse_endpoint("unix:///csi/csi.sock").unwrap();
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/csi/csi.sock")));
    }

    #[test]
    fn test_parse_tcp_endpoint() {
        let endpoint = parse_endpoint("tcp://127.0.0.1:10000").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp("127.0.0.1:10000".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_rejects_missing_scheme() {
        assert!(parse_endpoint("/csi/csi.sock").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        assert!(parse_endpoint("http://localhost:8080").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_unix_path() {
        assert!(parse_endpoint("unix://").is_err());
    }
}
