//! CSI gRPC service implementations.

pub mod controller;
pub mod identity;
pub mod node;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use proxmox_csi_cluster::ClusterError;
use proxmox_csi_host::HostError;
use tonic::Status;

/// Map a cluster error to its gRPC status code.
pub(crate) fn cluster_status(err: ClusterError) -> Status {
    let message = err.to_string();
    match err {
        ClusterError::InvalidArgument(_) => Status::invalid_argument(message),
        ClusterError::NotFound(_) => Status::not_found(message),
        ClusterError::AlreadyExists(_) => Status::already_exists(message),
        ClusterError::FailedPrecondition(_) => Status::failed_precondition(message),
        ClusterError::ResourceExhausted(_) => Status::resource_exhausted(message),
        ClusterError::Unavailable(_) => Status::unavailable(message),
        ClusterError::Api { .. } | ClusterError::Internal(_) => Status::internal(message),
    }
}

/// Map a host error to its gRPC status code.
pub(crate) fn host_status(err: HostError) -> Status {
    let message = err.to_string();
    match err {
        HostError::DiscoveryTimeout { .. } => Status::deadline_exceeded(message),
        HostError::UnsupportedFilesystem(_) => Status::invalid_argument(message),
        HostError::NotFound(_) | HostError::CommandFailed { .. } | HostError::Io(_) => {
            Status::internal(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_status_codes() {
        assert_eq!(
            cluster_status(ClusterError::InvalidArgument("x".into())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            cluster_status(ClusterError::FailedPrecondition("x".into())).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            cluster_status(ClusterError::ResourceExhausted("x".into())).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            cluster_status(ClusterError::Api {
                status: 500,
                message: "x".into()
            })
            .code(),
            tonic::Code::Internal
        );
    }

    #[test]
    fn test_host_status_codes() {
        assert_eq!(
            host_status(HostError::DiscoveryTimeout {
                wwn: "x".into(),
                timeout: std::time::Duration::from_secs(10)
            })
            .code(),
            tonic::Code::DeadlineExceeded
        );
        assert_eq!(
            host_status(HostError::NotFound("x".into())).code(),
            tonic::Code::Internal
        );
    }
}
