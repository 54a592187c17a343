//! CSI Identity service implementation.

use tonic::{Request, Response, Status};
use tracing::debug;

use proxmox_csi_proto::csi;

/// Driver name advertised to the orchestrator.
pub const DRIVER_NAME: &str = "csi.proxmox.sqreept.com";
/// Driver version advertised to the orchestrator.
pub const DRIVER_VERSION: &str = "0.1.0";

/// CSI Identity server, shared by the controller and node daemons.
#[derive(Debug, Default, Clone)]
pub struct IdentityService;

#[tonic::async_trait]
impl proxmox_csi_proto::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        debug!("GetPluginInfo called");

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        debug!("GetPluginCapabilities called");

        let capabilities = vec![
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            },
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                    csi::plugin_capability::VolumeExpansion {
                        r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Health check; the driver has no warm-up phase, so it is always
    /// ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        debug!("Probe called");

        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxmox_csi_proto::Identity;

    #[tokio::test]
    async fn test_plugin_info() {
        let service = IdentityService;
        let response = service
            .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.name, "csi.proxmox.sqreept.com");
        assert_eq!(response.vendor_version, "0.1.0");
    }

    #[tokio::test]
    async fn test_probe_always_ready() {
        let service = IdentityService;
        let response = service
            .probe(Request::new(csi::ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.ready, Some(true));
    }

    #[tokio::test]
    async fn test_plugin_capabilities() {
        let service = IdentityService;
        let response = service
            .get_plugin_capabilities(Request::new(csi::GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.capabilities.len(), 2);
    }
}
