//! Command-line argument parsing.

use clap::{Parser, Subcommand};

/// Proxmox CSI driver - block volumes for container workloads on Proxmox VE
#[derive(Parser, Debug)]
#[command(name = "proxmox-csi")]
#[command(about = "Proxmox CSI driver - block volumes for container workloads on Proxmox VE")]
#[command(version)]
pub struct Args {
    /// CSI endpoint to listen on (unix:// or tcp://)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    pub csi_endpoint: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the Controller daemon (volume lifecycle against the cluster API)
    Controller {
        /// Path to the cluster configuration file
        #[arg(long, env = "CLOUD_CONFIG", default_value = "/etc/proxmox/config.yaml")]
        cloud_config: String,
    },
    /// Run the Node daemon (staging and mounting on this worker VM)
    Node {
        /// Node name presented to the orchestrator as the node identity
        #[arg(long, env = "NODE_NAME")]
        node_name: String,
    },
}
