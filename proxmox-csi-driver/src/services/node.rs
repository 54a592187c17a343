//! CSI Node service implementation.
//!
//! Runs on the worker VM. Resolves attached disks to local devices,
//! formats and mounts them for pods, and grows filesystems after a
//! controller-side expansion.

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use proxmox_csi_cluster::MAX_VOLUMES_PER_NODE;
use proxmox_csi_host::{
    bind_mount, check_filesystem, filesystem_stats, filesystem_type, format_device,
    get_device_from_mount, is_mounted, mount_device, resize_filesystem, unmount_path,
    DeviceScanner, FormatOptions, DEFAULT_FS_TYPE,
};
use proxmox_csi_proto::csi;

use crate::services::host_status;

/// CSI Node server.
pub struct NodeService {
    node_name: String,
    scanner: DeviceScanner,
}

impl NodeService {
    /// Create a node service for this worker.
    pub fn new(node_name: String) -> Self {
        info!(node = %node_name, "Node service initialized");
        Self {
            node_name,
            scanner: DeviceScanner::new(),
        }
    }

    async fn discover_device(&self, publish_context: &std::collections::HashMap<String, String>)
        -> Result<String, Status>
    {
        let device_path = publish_context
            .get("DevicePath")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Status::invalid_argument("DevicePath not provided"))?;

        let wwn = wwn_from_device_path(device_path)
            .ok_or_else(|| Status::invalid_argument("Invalid DevicePath format"))?;

        self.scanner
            .discover_by_wwn(wwn)
            .await
            .map_err(host_status)
    }
}

/// Extract the WWN hex string from a `/dev/disk/by-id/wwn-0x<hex>` path.
fn wwn_from_device_path(device_path: &str) -> Option<&str> {
    let (_, wwn) = device_path.split_once("wwn-0x")?;
    if wwn.is_empty() {
        None
    } else {
        Some(wwn)
    }
}

/// Whether the capability asks for a raw block volume.
fn is_block_capability(capability: &Option<csi::VolumeCapability>) -> bool {
    matches!(
        capability.as_ref().and_then(|c| c.access_type.as_ref()),
        Some(csi::volume_capability::AccessType::Block(_))
    )
}

/// Filesystem type and mount flags from the capability, with defaults.
fn mount_params(capability: &Option<csi::VolumeCapability>) -> (String, Vec<String>) {
    if let Some(csi::volume_capability::AccessType::Mount(mount)) =
        capability.as_ref().and_then(|c| c.access_type.as_ref())
    {
        let fstype = if mount.fs_type.is_empty() {
            DEFAULT_FS_TYPE.to_string()
        } else {
            mount.fs_type.clone()
        };
        return (fstype, mount.mount_flags.clone());
    }
    (DEFAULT_FS_TYPE.to_string(), Vec::new())
}

/// Staging paths for raw block volumes live under `volumeDevices` and
/// carry no mount to undo.
fn is_block_staging_path(staging_path: &str) -> bool {
    staging_path.contains("/volumeDevices/")
}

#[tonic::async_trait]
impl proxmox_csi_proto::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "VolumeID and StagingTargetPath required",
            ));
        }

        info!(volume_id = %req.volume_id, staging = %req.staging_target_path, "NodeStageVolume");

        if is_block_capability(&req.volume_capability) {
            // Raw block volumes are published straight from the device
            // node; there is nothing to stage.
            info!("Raw block volume, skipping staging");
            return Ok(Response::new(csi::NodeStageVolumeResponse {}));
        }

        let device = self.discover_device(&req.publish_context).await?;
        info!(device = %device, "Device discovered");

        let (fstype, mount_flags) = mount_params(&req.volume_capability);

        if check_filesystem(&device).await.is_none() {
            format_device(&device, &fstype, &FormatOptions::default())
                .await
                .map_err(host_status)?;
            info!(device = %device, fstype = %fstype, "Device formatted");
        }

        if !is_mounted(&req.staging_target_path) {
            mount_device(&device, &req.staging_target_path, &fstype, &mount_flags)
                .await
                .map_err(host_status)?;
            info!(staging = %req.staging_target_path, "Device mounted");
        }

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "VolumeID and StagingTargetPath required",
            ));
        }

        info!(volume_id = %req.volume_id, staging = %req.staging_target_path, "NodeUnstageVolume");

        if is_block_staging_path(&req.staging_target_path) {
            info!("Raw block device, skipping unstaging");
            return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
        }

        if is_mounted(&req.staging_target_path) {
            unmount_path(&req.staging_target_path)
                .await
                .map_err(host_status)?;
        }

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() || req.target_path.is_empty() {
            return Err(Status::invalid_argument("VolumeID and TargetPath required"));
        }

        info!(volume_id = %req.volume_id, target = %req.target_path, "NodePublishVolume");

        if is_block_capability(&req.volume_capability) {
            // Raw block: bind the device node itself into the pod.
            let device = self.discover_device(&req.publish_context).await?;
            bind_mount(&device, &req.target_path, req.readonly)
                .await
                .map_err(host_status)?;
        } else {
            if req.staging_target_path.is_empty() {
                return Err(Status::invalid_argument(
                    "StagingTargetPath required for filesystem volume",
                ));
            }
            bind_mount(&req.staging_target_path, &req.target_path, req.readonly)
                .await
                .map_err(host_status)?;
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() || req.target_path.is_empty() {
            return Err(Status::invalid_argument("VolumeID and TargetPath required"));
        }

        info!(volume_id = %req.volume_id, target = %req.target_path, "NodeUnpublishVolume");

        if is_mounted(&req.target_path) {
            unmount_path(&req.target_path).await.map_err(host_status)?;
        }

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() || req.volume_path.is_empty() {
            return Err(Status::invalid_argument("VolumeID and VolumePath required"));
        }

        info!(volume_id = %req.volume_id, path = %req.volume_path, "NodeExpandVolume");

        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or(0);

        if is_block_capability(&req.volume_capability) {
            info!("Raw block volume, no filesystem resize needed");
            return Ok(Response::new(csi::NodeExpandVolumeResponse {
                capacity_bytes,
            }));
        }

        let device = get_device_from_mount(&req.volume_path).ok_or_else(|| {
            Status::internal(format!("Cannot find device for mount {}", req.volume_path))
        })?;

        let fstype = filesystem_type(&device).await.map_err(host_status)?;

        resize_filesystem(&device, &req.volume_path, &fstype)
            .await
            .map_err(host_status)?;

        info!(volume_id = %req.volume_id, device = %device, "Filesystem resized");

        Ok(Response::new(csi::NodeExpandVolumeResponse {
            capacity_bytes,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let rpc_capability = |capability: csi::node_service_capability::rpc::Type| {
            csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: capability as i32,
                    },
                )),
            }
        };

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![
                rpc_capability(csi::node_service_capability::rpc::Type::StageUnstageVolume),
                rpc_capability(csi::node_service_capability::rpc::Type::ExpandVolume),
                rpc_capability(csi::node_service_capability::rpc::Type::GetVolumeStats),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE as i64,
            accessible_topology: None,
        }))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();

        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("VolumePath required"));
        }

        let stats = filesystem_stats(&req.volume_path).map_err(|e| {
            warn!(path = %req.volume_path, error = %e, "statvfs failed");
            host_status(e)
        })?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    unit: csi::volume_usage::Unit::Bytes as i32,
                    total: stats.total_bytes as i64,
                    available: stats.available_bytes as i64,
                    used: stats.used_bytes as i64,
                },
                csi::VolumeUsage {
                    unit: csi::volume_usage::Unit::Inodes as i32,
                    total: stats.total_inodes as i64,
                    available: stats.available_inodes as i64,
                    used: stats.used_inodes as i64,
                },
            ],
            volume_condition: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxmox_csi_proto::Node;

    #[test]
    fn test_wwn_from_device_path() {
        assert_eq!(
            wwn_from_device_path("/dev/disk/by-id/wwn-0x5043432d49443031"),
            Some("5043432d49443031")
        );
        assert_eq!(wwn_from_device_path("/dev/disk/by-id/wwn-0x"), None);
        assert_eq!(wwn_from_device_path("/dev/sda"), None);
    }

    #[test]
    fn test_block_capability_detection() {
        let block = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        });
        let mount = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume::default(),
            )),
            access_mode: None,
        });

        assert!(is_block_capability(&block));
        assert!(!is_block_capability(&mount));
        assert!(!is_block_capability(&None));
    }

    #[test]
    fn test_mount_params_defaults() {
        let (fstype, flags) = mount_params(&None);
        assert_eq!(fstype, "ext4");
        assert!(flags.is_empty());

        let capability = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: "xfs".to_string(),
                    mount_flags: vec!["noatime".to_string()],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: None,
        });
        let (fstype, flags) = mount_params(&capability);
        assert_eq!(fstype, "xfs");
        assert_eq!(flags, vec!["noatime"]);
    }

    #[test]
    fn test_block_staging_path_detection() {
        assert!(is_block_staging_path(
            "/var/lib/kubelet/plugins/kubernetes.io/csi/volumeDevices/pvc-1/dev"
        ));
        assert!(!is_block_staging_path(
            "/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pvc-1/globalmount"
        ));
    }

    #[tokio::test]
    async fn test_node_get_info() {
        let service = NodeService::new("worker-1".to_string());
        let info = service
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(info.node_id, "worker-1");
        assert_eq!(info.max_volumes_per_node, 29);
    }

    #[tokio::test]
    async fn test_stage_block_volume_is_noop() {
        let service = NodeService::new("worker-1".to_string());
        let response = service
            .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
                volume_id: "r1/n1/s1/vm-9999-pvc-abc".to_string(),
                staging_target_path: "/staging".to_string(),
                volume_capability: Some(csi::VolumeCapability {
                    access_type: Some(csi::volume_capability::AccessType::Block(
                        csi::volume_capability::BlockVolume {},
                    )),
                    access_mode: None,
                }),
                ..Default::default()
            }))
            .await;

        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_unstage_block_path_is_noop() {
        let service = NodeService::new("worker-1".to_string());
        let response = service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: "r1/n1/s1/vm-9999-pvc-abc".to_string(),
                staging_target_path: "/plugins/csi/volumeDevices/pvc-abc/dev".to_string(),
            }))
            .await;

        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_stage_requires_arguments() {
        let service = NodeService::new("worker-1".to_string());
        let status = service
            .node_stage_volume(Request::new(csi::NodeStageVolumeRequest::default()))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_volume_stats_requires_path() {
        let service = NodeService::new("worker-1".to_string());
        let status = service
            .node_get_volume_stats(Request::new(csi::NodeGetVolumeStatsRequest::default()))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
