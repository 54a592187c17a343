//! # Proxmox CSI Driver
//!
//! CSI driver exposing Proxmox VE block storage to container
//! orchestrators. The same binary runs as two daemons:
//!
//! - `proxmox-csi controller` - volume lifecycle (create, delete,
//!   attach, detach, expand) against the Proxmox API.
//! - `proxmox-csi node` - device discovery, formatting and mounting on
//!   the worker VM.
//!
//! ## Usage
//! ```bash
//! proxmox-csi controller --cloud-config /etc/proxmox/config.yaml
//! proxmox-csi node --node-name worker-1
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod server;
mod services;

use cli::{Args, Command};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_json {
        proxmox_csi_common::init_logging_json(&args.log_level)?;
    } else {
        proxmox_csi_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Proxmox CSI driver"
    );

    let result = match args.command {
        Command::Controller { cloud_config } => {
            let config = Config::load(&cloud_config)?;
            info!(
                config_path = %cloud_config,
                clusters = config.clusters.len(),
                "Configuration loaded"
            );
            server::serve_controller(&args.csi_endpoint, config).await
        }
        Command::Node { node_name } => server::serve_node(&args.csi_endpoint, node_name).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Server failed");
    }

    result
}
