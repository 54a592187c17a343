//! CSI Controller service implementation.
//!
//! Turns Controller RPCs into volume operations against the configured
//! Proxmox clusters. Holds the region -> client map built once at
//! startup; the region inside the volume ID routes each call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use proxmox_csi_cluster::{operations, ClusterApi, ProxmoxClient, VolumeId};
use proxmox_csi_proto::csi;

use crate::config::Config;
use crate::services::cluster_status;

/// Smallest volume the driver will provision.
const MIN_VOLUME_SIZE: u64 = 512 * 1024 * 1024;
/// Volume size when the request carries no capacity range.
const DEFAULT_VOLUME_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// CSI Controller server.
pub struct ControllerService {
    clients: HashMap<String, Arc<dyn ClusterApi>>,
    /// First configured region; used for placement of new volumes.
    default_region: String,
    /// Per-volume serialization of publish/unpublish to avoid
    /// concurrent cluster scans for the same volume. The cluster-wide
    /// scan remains the actual split-brain barrier.
    volume_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ControllerService {
    /// Build the service from the driver configuration, one API client
    /// per cluster.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut clients: Vec<(String, Arc<dyn ClusterApi>)> = Vec::new();

        for cluster in &config.clusters {
            let client = ProxmoxClient::new(
                &cluster.url,
                &cluster.token_id,
                &cluster.token_secret,
                cluster.insecure,
            )?;
            clients.push((cluster.region.clone(), Arc::new(client)));
        }

        info!(clusters = clients.len(), "Controller service initialized");
        Ok(Self::with_clients(clients))
    }

    /// Build the service from pre-constructed clients. The first entry
    /// becomes the default placement region.
    pub fn with_clients(clients: Vec<(String, Arc<dyn ClusterApi>)>) -> Self {
        let default_region = clients
            .first()
            .map(|(region, _)| region.clone())
            .unwrap_or_default();

        Self {
            clients: clients.into_iter().collect(),
            default_region,
            volume_locks: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, region: &str) -> Result<&Arc<dyn ClusterApi>, Status> {
        self.clients
            .get(region)
            .ok_or_else(|| Status::not_found(format!("Region {} not found", region)))
    }

    async fn volume_lock(&self, volume_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.volume_locks.lock().await;
        locks.entry(volume_id.to_string()).or_default().clone()
    }

    /// Resolve a CSI node ID to a VM ID: a numeric node ID is an
    /// explicit VMID, anything else is looked up by VM name.
    async fn resolve_vmid(
        api: &dyn ClusterApi,
        node_id: &str,
    ) -> Result<Option<u32>, Status> {
        if let Ok(vmid) = node_id.parse::<u32>() {
            return Ok(Some(vmid));
        }

        let found = api
            .find_vm_by_name(node_id)
            .await
            .map_err(cluster_status)?;
        Ok(found.map(|(vmid, _node)| vmid))
    }
}

#[tonic::async_trait]
impl proxmox_csi_proto::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.name.is_empty() {
            return Err(Status::invalid_argument("Name must be provided"));
        }

        let storage = req
            .parameters
            .get("storage")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Status::invalid_argument("storage parameter required"))?;

        let size_bytes = match &req.capacity_range {
            Some(range) => (range.required_bytes.max(0) as u64).max(MIN_VOLUME_SIZE),
            None => DEFAULT_VOLUME_SIZE,
        };

        info!(name = %req.name, storage = %storage, size_bytes = size_bytes, "CreateVolume");

        // Placement is deliberately simple: first configured region,
        // first node the cluster reports.
        let region = self.default_region.clone();
        let api = self.client(&region)?;

        let nodes = api.list_nodes().await.map_err(cluster_status)?;
        let zone = nodes
            .first()
            .ok_or_else(|| Status::internal("No nodes available"))?;

        let volume_id =
            operations::create_volume(api.as_ref(), &region, zone, storage, &req.name, size_bytes)
                .await
                .map_err(cluster_status)?;

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                volume_id: volume_id.to_string(),
                capacity_bytes: size_bytes as i64,
                ..Default::default()
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("VolumeID must be provided"));
        }

        info!(volume_id = %req.volume_id, "DeleteVolume");

        let volume_id = VolumeId::parse(&req.volume_id).map_err(cluster_status)?;
        let api = self.client(&volume_id.region)?;

        operations::delete_volume(api.as_ref(), &volume_id)
            .await
            .map_err(cluster_status)?;

        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() || req.node_id.is_empty() {
            return Err(Status::invalid_argument("VolumeID and NodeID required"));
        }

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerPublishVolume");

        let volume_id = VolumeId::parse(&req.volume_id).map_err(cluster_status)?;
        let api = self.client(&volume_id.region)?;

        let vmid = Self::resolve_vmid(api.as_ref(), &req.node_id)
            .await?
            .ok_or_else(|| {
                Status::not_found(format!(
                    "No VM found with name '{}' in Proxmox cluster",
                    req.node_id
                ))
            })?;

        let lock = self.volume_lock(&req.volume_id).await;
        let _guard = lock.lock().await;

        let publish_context = operations::attach_volume(api.as_ref(), vmid, &volume_id)
            .await
            .map_err(cluster_status)?;

        info!(volume_id = %volume_id, vmid = vmid, "Volume attached");

        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context: publish_context.into_map(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("VolumeID required"));
        }

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerUnpublishVolume");

        let volume_id = VolumeId::parse(&req.volume_id).map_err(cluster_status)?;
        let api = self.client(&volume_id.region)?;

        let lock = self.volume_lock(&req.volume_id).await;
        let _guard = lock.lock().await;

        let vmid = if req.node_id.is_empty() {
            // Without a node hint, the holder is whatever the cluster
            // scan finds; an unattached volume is already unpublished.
            warn!(volume_id = %volume_id, "No node_id provided, scanning for attachment");
            match operations::check_existing_attachments(api.as_ref(), &volume_id.disk)
                .await
                .map_err(cluster_status)?
            {
                Some((vmid, _lun)) => vmid,
                None => {
                    info!(volume_id = %volume_id, "Volume not attached anywhere");
                    return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
                }
            }
        } else {
            match Self::resolve_vmid(api.as_ref(), &req.node_id).await? {
                Some(vmid) => vmid,
                None => {
                    // The VM is gone; there is nothing left to detach from.
                    warn!(node_id = %req.node_id, "VM not found, assuming already detached");
                    return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
                }
            }
        };

        operations::detach_volume(api.as_ref(), vmid, &volume_id)
            .await
            .map_err(cluster_status)?;

        info!(volume_id = %volume_id, vmid = vmid, "Volume detached");

        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("VolumeID required"));
        }

        let capacity_range = req
            .capacity_range
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("CapacityRange required"))?;
        if capacity_range.required_bytes <= 0 {
            return Err(Status::invalid_argument("Required bytes must be positive"));
        }
        let new_size = capacity_range.required_bytes as u64;

        info!(volume_id = %req.volume_id, new_size = new_size, "ControllerExpandVolume");

        let volume_id = VolumeId::parse(&req.volume_id).map_err(cluster_status)?;
        let api = self.client(&volume_id.region)?;

        // Expansion needs an attached disk; the scan locates its holder.
        let (vmid, _lun) =
            operations::check_existing_attachments(api.as_ref(), &volume_id.disk)
                .await
                .map_err(cluster_status)?
                .ok_or_else(|| {
                    Status::failed_precondition(format!(
                        "Volume {} must be attached to a VM to expand",
                        volume_id
                    ))
                })?;

        operations::expand_volume(api.as_ref(), vmid, &volume_id, new_size)
            .await
            .map_err(cluster_status)?;

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: new_size as i64,
            node_expansion_required: true,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let rpc_capability = |capability: csi::controller_service_capability::rpc::Type| {
            csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc {
                        r#type: capability as i32,
                    },
                )),
            }
        };

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: vec![
                rpc_capability(csi::controller_service_capability::rpc::Type::CreateDeleteVolume),
                rpc_capability(
                    csi::controller_service_capability::rpc::Type::PublishUnpublishVolume,
                ),
                rpc_capability(csi::controller_service_capability::rpc::Type::ExpandVolume),
            ],
        }))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented(
            "ValidateVolumeCapabilities is not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxmox_csi_cluster::MockCluster;
    use proxmox_csi_proto::Controller;

    const GIB: i64 = 1 << 30;

    fn service_with(mock: Arc<MockCluster>) -> ControllerService {
        ControllerService::with_clients(vec![("r1".to_string(), mock as Arc<dyn ClusterApi>)])
    }

    fn single_node_cluster() -> Arc<MockCluster> {
        let mock = Arc::new(MockCluster::new());
        mock.add_node("n1");
        mock.add_vm(100, "worker-1", "n1");
        mock
    }

    fn create_request(name: &str, storage: &str, required: i64) -> csi::CreateVolumeRequest {
        csi::CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: required,
                limit_bytes: 0,
            }),
            parameters: HashMap::from([("storage".to_string(), storage.to_string())]),
            ..Default::default()
        }
    }

    fn publish_request(volume_id: &str, node_id: &str) -> csi::ControllerPublishVolumeRequest {
        csi::ControllerPublishVolumeRequest {
            volume_id: volume_id.to_string(),
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_publish_volume() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        let created = service
            .create_volume(Request::new(create_request("pvc-abc", "s1", 5 * GIB)))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        assert_eq!(created.volume_id, "r1/n1/s1/vm-9999-pvc-abc");
        assert_eq!(created.capacity_bytes, 5 * GIB);

        let published = service
            .controller_publish_volume(Request::new(publish_request(&created.volume_id, "100")))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            published.publish_context["DevicePath"],
            "/dev/disk/by-id/wwn-0x5043432d49443031"
        );
        assert_eq!(published.publish_context["lun"], "1");
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        let created = service
            .create_volume(Request::new(create_request("pvc-abc", "s1", 5 * GIB)))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        let first = service
            .controller_publish_volume(Request::new(publish_request(&created.volume_id, "100")))
            .await
            .unwrap()
            .into_inner();
        let second = service
            .controller_publish_volume(Request::new(publish_request(&created.volume_id, "100")))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(first.publish_context, second.publish_context);
        assert_eq!(mock.update_log().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_refuses_split_brain() {
        let mock = single_node_cluster();
        mock.add_node("n2");
        mock.add_vm(200, "worker-2", "n2");
        mock.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB as u64);
        mock.set_vm_config_entry(
            200,
            "scsi3",
            "s1:vm-9999-pvc-abc,wwn=0x5043432d49443033,backup=0",
        );
        let service = service_with(mock.clone());

        let status = service
            .controller_publish_volume(Request::new(publish_request(
                "r1/n1/s1/vm-9999-pvc-abc",
                "100",
            )))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(status.message().contains("200"));
        assert!(mock.update_log().is_empty());
    }

    #[tokio::test]
    async fn test_publish_resolves_node_by_name() {
        let mock = single_node_cluster();
        mock.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB as u64);
        let service = service_with(mock.clone());

        let published = service
            .controller_publish_volume(Request::new(publish_request(
                "r1/n1/s1/vm-9999-pvc-abc",
                "Worker-1",
            )))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(published.publish_context["lun"], "1");
    }

    #[tokio::test]
    async fn test_publish_unknown_node_name() {
        let mock = single_node_cluster();
        mock.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB as u64);
        let service = service_with(mock);

        let status = service
            .controller_publish_volume(Request::new(publish_request(
                "r1/n1/s1/vm-9999-pvc-abc",
                "missing-node",
            )))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_unpublish_and_delete() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        let created = service
            .create_volume(Request::new(create_request("pvc-abc", "s1", 5 * GIB)))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        service
            .controller_publish_volume(Request::new(publish_request(&created.volume_id, "100")))
            .await
            .unwrap();

        service
            .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
                volume_id: created.volume_id.clone(),
                node_id: "100".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let config = mock.get_vm_config(100, "n1").await.unwrap();
        assert!(!config.contains_key("scsi1"));

        service
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: created.volume_id,
                ..Default::default()
            }))
            .await
            .unwrap();

        assert_eq!(mock.disk_size("s1", "vm-9999-pvc-abc"), None);
    }

    #[tokio::test]
    async fn test_unpublish_without_node_id_scans_for_holder() {
        let mock = single_node_cluster();
        mock.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB as u64);
        mock.set_vm_config_entry(
            100,
            "scsi2",
            "s1:vm-9999-pvc-abc,wwn=0x5043432d49443032,backup=0",
        );
        let service = service_with(mock.clone());

        service
            .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
                volume_id: "r1/n1/s1/vm-9999-pvc-abc".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let config = mock.get_vm_config(100, "n1").await.unwrap();
        assert!(!config.contains_key("scsi2"));
    }

    #[tokio::test]
    async fn test_unpublish_unattached_volume_succeeds() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        service
            .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
                volume_id: "r1/n1/s1/vm-9999-pvc-abc".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        assert!(mock.update_log().is_empty());
    }

    #[tokio::test]
    async fn test_expand_attached_volume() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        let created = service
            .create_volume(Request::new(create_request("pvc-abc", "s1", 5 * GIB)))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        service
            .controller_publish_volume(Request::new(publish_request(&created.volume_id, "100")))
            .await
            .unwrap();

        let expanded = service
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: created.volume_id,
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 20 * GIB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(expanded.capacity_bytes, 20 * GIB);
        assert!(expanded.node_expansion_required);
        assert_eq!(
            mock.resize_log(),
            vec![(100, "scsi1".to_string(), "20480M".to_string())]
        );
    }

    #[tokio::test]
    async fn test_expand_unattached_volume_fails() {
        let mock = single_node_cluster();
        mock.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB as u64);
        let service = service_with(mock);

        let status = service
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: "r1/n1/s1/vm-9999-pvc-abc".to_string(),
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 20 * GIB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_create_volume_requires_storage_parameter() {
        let service = service_with(single_node_cluster());

        let status = service
            .create_volume(Request::new(csi::CreateVolumeRequest {
                name: "pvc-abc".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_volume_clamps_small_sizes() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        let created = service
            .create_volume(Request::new(create_request("pvc-tiny", "s1", 1024)))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        // 512 MiB floor, provisioned as one GiB on the storage.
        assert_eq!(created.capacity_bytes, 512 * 1024 * 1024);
        assert_eq!(
            mock.disk_size("s1", "vm-9999-pvc-tiny"),
            Some(1 << 30)
        );
    }

    #[tokio::test]
    async fn test_create_volume_defaults_without_capacity_range() {
        let mock = single_node_cluster();
        let service = service_with(mock.clone());

        let created = service
            .create_volume(Request::new(csi::CreateVolumeRequest {
                name: "pvc-default".to_string(),
                parameters: HashMap::from([("storage".to_string(), "s1".to_string())]),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        assert_eq!(created.capacity_bytes, 10 * GIB);
    }

    #[tokio::test]
    async fn test_unknown_region_is_not_found() {
        let service = service_with(single_node_cluster());

        let status = service
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: "other-region/n1/s1/vm-9999-pvc-abc".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_malformed_volume_id_is_invalid_argument() {
        let service = service_with(single_node_cluster());

        let status = service
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: "/kubedata/vm-9999-x".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_capabilities() {
        let service = service_with(single_node_cluster());

        let caps = service
            .controller_get_capabilities(Request::new(csi::ControllerGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;

        assert_eq!(caps.len(), 3);
    }
}
