//! Cluster configuration for the Controller daemon.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Driver configuration: the ordered list of Proxmox clusters the
/// controller may place volumes on. The first entry is the default
/// placement region.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub clusters: Vec<ClusterConfig>,
}

/// One Proxmox cluster record.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Base URL of the Proxmox API, with or without `/api2/json`.
    pub url: String,
    /// API token ID, e.g. `csi@pve!csi-token`.
    pub token_id: String,
    /// API token secret.
    pub token_secret: String,
    /// Logical cluster name; regions must be unique.
    pub region: String,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("No clusters configured");
        }

        let mut regions = HashSet::new();
        for cluster in &self.clusters {
            if cluster.region.is_empty() {
                bail!("Cluster region must not be empty");
            }
            if !regions.insert(cluster.region.as_str()) {
                bail!("Duplicate cluster region: {}", cluster.region);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_from_str(yaml: &str) -> Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        Config::load(file.path())
    }

    #[test]
    fn test_load_single_cluster() {
        let config = load_from_str(
            r#"
clusters:
  - url: "https://proxmox.example.com:8006/api2/json"
    token_id: "csi@pve!csi-token"
    token_secret: "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    region: "cluster-1"
    insecure: false
"#,
        )
        .unwrap();

        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].region, "cluster-1");
        assert!(!config.clusters[0].insecure);
    }

    #[test]
    fn test_insecure_defaults_to_false() {
        let config = load_from_str(
            r#"
clusters:
  - url: "https://pve:8006"
    token_id: "t"
    token_secret: "s"
    region: "r1"
"#,
        )
        .unwrap();
        assert!(!config.clusters[0].insecure);
    }

    #[test]
    fn test_empty_clusters_rejected() {
        assert!(load_from_str("clusters: []").is_err());
    }

    #[test]
    fn test_duplicate_regions_rejected() {
        let result = load_from_str(
            r#"
clusters:
  - url: "https://a:8006"
    token_id: "t"
    token_secret: "s"
    region: "r1"
  - url: "https://b:8006"
    token_id: "t"
    token_secret: "s"
    region: "r1"
"#,
        );
        assert!(result.is_err());
    }
}
