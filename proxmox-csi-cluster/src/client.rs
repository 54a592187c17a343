//! Proxmox VE REST API client.
//!
//! Thin typed wrapper over the `/api2/json` endpoints with token
//! authentication and bounded retries. All orchestration logic lives in
//! [`crate::operations`]; this module only moves requests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::traits::ClusterApi;
use crate::types::{StorageContent, VmConfig, VmConfigPatch, VmSummary};

/// Retry budget for a single logical request.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff; doubled per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(300);
/// Statuses worth retrying. The driver's operations are idempotent at
/// the semantic layer, so POST/PUT/DELETE retry too.
const RETRY_STATUS: [u16; 4] = [500, 502, 503, 504];
/// Upper bound on any single HTTP exchange so a hung cluster cannot
/// wedge a gRPC worker forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxmox VE REST API client for one cluster.
pub struct ProxmoxClient {
    api_url: String,
    token_id: String,
    token_secret: String,
    http: reqwest::Client,
}

impl ProxmoxClient {
    /// Create a client for a cluster.
    ///
    /// `url` is the base URL with or without the `/api2/json` suffix.
    /// `insecure` skips TLS certificate verification.
    pub fn new(url: &str, token_id: &str, token_secret: &str, insecure: bool) -> Result<Self> {
        let base = url.trim_end_matches('/');
        let base = base.strip_suffix("/api2/json").unwrap_or(base);

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClusterError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_url: format!("{}/api2/json", base),
            token_id: token_id.to_string(),
            token_secret: token_secret.to_string(),
            http,
        })
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }

    /// Issue a request with bounded retries on 5xx and transport errors,
    /// and return the `data` field of the response envelope.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.api_url, path);
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 1;

        loop {
            debug!(method = %method, path = %path, attempt = attempt, "Proxmox API request");

            let mut builder = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", self.auth_header());
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let retryable_failure = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    debug!(status = %status, path = %path, "Proxmox API response");

                    if status.is_success() {
                        let envelope: serde_json::Value = response.json().await.map_err(|e| {
                            ClusterError::Internal(format!("Invalid API response body: {}", e))
                        })?;
                        let data = match envelope {
                            serde_json::Value::Object(mut map) => {
                                map.remove("data").unwrap_or(serde_json::Value::Null)
                            }
                            other => other,
                        };
                        return Ok(data);
                    }

                    if RETRY_STATUS.contains(&status.as_u16()) && attempt < MAX_ATTEMPTS {
                        format!("status {}", status)
                    } else {
                        let message = response.text().await.unwrap_or_default();
                        return Err(Self::status_error(status, path, &message));
                    }
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        e.to_string()
                    } else {
                        return Err(ClusterError::Unavailable(format!(
                            "{} {} failed: {}",
                            method, path, e
                        )));
                    }
                }
            };

            warn!(
                path = %path,
                attempt = attempt,
                error = %retryable_failure,
                "Proxmox API request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
        }
    }

    /// Map a non-success status to the error kinds of the semantic layer.
    fn status_error(status: StatusCode, path: &str, message: &str) -> ClusterError {
        let message = message.trim();
        if status == StatusCode::NOT_FOUND {
            return ClusterError::NotFound(format!("{}: {}", path, message));
        }
        if message.contains("already exists") {
            return ClusterError::AlreadyExists(message.to_string());
        }
        ClusterError::Api {
            status: status.as_u16(),
            message: format!("{}: {}", path, message),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| ClusterError::Internal(format!("Unexpected API response shape: {}", e)))
    }
}

#[async_trait]
impl ClusterApi for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct NodeEntry {
            node: String,
        }

        let data = self.request(Method::GET, "/nodes", None).await?;
        let nodes: Vec<NodeEntry> = Self::decode(data)?;
        Ok(nodes.into_iter().map(|n| n.node).collect())
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        let data = self
            .request(Method::GET, &format!("/nodes/{}/qemu", node), None)
            .await?;
        Self::decode(data)
    }

    async fn get_vm_config(&self, vmid: u32, node: &str) -> Result<VmConfig> {
        let data = self
            .request(
                Method::GET,
                &format!("/nodes/{}/qemu/{}/config", node, vmid),
                None,
            )
            .await?;
        Self::decode(data)
    }

    async fn update_vm_config(&self, vmid: u32, node: &str, patch: &VmConfigPatch) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/config", node, vmid),
            Some(&patch.to_body()),
        )
        .await?;
        Ok(())
    }

    async fn create_vm_disk(
        &self,
        vmid: u32,
        node: &str,
        storage: &str,
        filename: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let size_gib = size_bytes.div_ceil(1 << 30);
        let body = serde_json::json!({
            "vmid": vmid,
            "filename": filename,
            "size": format!("{}G", size_gib),
        });

        debug!(
            vmid = vmid,
            node = %node,
            storage = %storage,
            filename = %filename,
            size_bytes = size_bytes,
            size_gib = size_gib,
            "Creating VM disk"
        );

        self.request(
            Method::POST,
            &format!("/nodes/{}/storage/{}/content", node, storage),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_vm_disk(
        &self,
        _vmid: u32,
        node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!(
                "/nodes/{}/storage/{}/content/{}",
                node,
                storage,
                urlencoding::encode(volume)
            ),
            None,
        )
        .await?;
        Ok(())
    }

    async fn resize_vm_disk(&self, vmid: u32, node: &str, device: &str, size: &str) -> Result<()> {
        let body = serde_json::json!({
            "disk": device,
            "size": size,
        });

        self.request(
            Method::PUT,
            &format!("/nodes/{}/qemu/{}/resize", node, vmid),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContent>> {
        let data = self
            .request(
                Method::GET,
                &format!("/nodes/{}/storage/{}/content", node, storage),
                None,
            )
            .await?;
        Self::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let with_suffix =
            ProxmoxClient::new("https://pve.example.com:8006/api2/json", "t", "s", false).unwrap();
        let without_suffix =
            ProxmoxClient::new("https://pve.example.com:8006/", "t", "s", false).unwrap();
        assert_eq!(with_suffix.api_url, "https://pve.example.com:8006/api2/json");
        assert_eq!(without_suffix.api_url, with_suffix.api_url);
    }

    #[test]
    fn test_auth_header_format() {
        let client = ProxmoxClient::new("https://pve:8006", "csi@pve!csi-token", "xyz", true).unwrap();
        assert_eq!(client.auth_header(), "PVEAPIToken=csi@pve!csi-token=xyz");
    }

    #[test]
    fn test_status_error_mapping() {
        let err = ProxmoxClient::status_error(StatusCode::NOT_FOUND, "/nodes/n1", "no such vm");
        assert!(matches!(err, ClusterError::NotFound(_)));

        let err = ProxmoxClient::status_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "/nodes/n1/storage/s1/content",
            "volume 's1:vm-9999-pvc-a' already exists",
        );
        assert!(matches!(err, ClusterError::AlreadyExists(_)));

        let err = ProxmoxClient::status_error(StatusCode::FORBIDDEN, "/nodes", "permission denied");
        assert!(matches!(err, ClusterError::Api { status: 403, .. }));
    }
}
