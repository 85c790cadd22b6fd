//! CSI Node Service Implementation
//!
//! Validates requests at the gRPC boundary and hands them to the
//! [`VolumeLifecycle`] on the blocking thread pool. Staging is not used:
//! publish attaches, formats and mounts straight at the target path.

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::admission::AdmissionGate;
use crate::config::NodeConfig;
use crate::connector::ConnectorStore;
use crate::csi;
use crate::error::NodeError;
use crate::host;
use crate::lifecycle::{PublishRequest, VolumeLifecycle};
use crate::metrics::OperationTimer;
use crate::platform::Tools;
use crate::types::{IscsiTarget, MountSpec, VolumeId, validate_path};

/// Volumes a single node can attach.
pub const MAX_VOLUMES_PER_NODE: i64 = 255;

/// CSI Node Service
pub struct NodeService {
    lifecycle: Arc<VolumeLifecycle>,
    initiator_name_file: PathBuf,
}

impl NodeService {
    pub fn new(lifecycle: Arc<VolumeLifecycle>, initiator_name_file: impl Into<PathBuf>) -> Self {
        Self {
            lifecycle,
            initiator_name_file: initiator_name_file.into(),
        }
    }

    /// Build the service and its lifecycle controller from configuration.
    pub fn from_config(config: &NodeConfig, tools: Tools) -> Self {
        let lifecycle = VolumeLifecycle::new(
            tools,
            ConnectorStore::new(&config.state_dir),
            AdmissionGate::default(),
            config.persist_mode,
        );
        Self::new(Arc::new(lifecycle), &config.initiator_name_file)
    }

    pub fn lifecycle(&self) -> &Arc<VolumeLifecycle> {
        &self.lifecycle
    }
}

/// Run blocking lifecycle work off the async runtime and record its outcome.
///
/// The work is not cancelled when the caller goes away; its result is then
/// simply dropped.
async fn run_blocking<T, F>(operation: &'static str, work: F) -> Result<T, Status>
where
    F: FnOnce() -> Result<T, NodeError> + Send + 'static,
    T: Send + 'static,
{
    let timer = OperationTimer::new(operation);

    let result = match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) => Err(NodeError::Internal(format!("{} worker failed: {}", operation, e))),
    };

    match result {
        Ok(value) => {
            timer.success();
            Ok(value)
        }
        Err(e) => {
            match e {
                NodeError::Busy => warn!(operation = operation, "{}", e),
                _ => error!(operation = operation, error = %e, "Operation failed"),
            }
            timer.failure(e.label());
            Err(e.into())
        }
    }
}

fn rpc_capability(kind: csi::node_service_capability::rpc::Type) -> csi::NodeServiceCapability {
    csi::NodeServiceCapability {
        r#type: Some(csi::node_service_capability::Type::Rpc(
            csi::node_service_capability::Rpc { r#type: kind as i32 },
        )),
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(NodeError::Unimplemented("NodeStageVolume").into())
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(NodeError::Unimplemented("NodeUnstageVolume").into())
    }

    /// Attach, format and mount a volume at the target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();

        let volume_id = VolumeId::new(req.volume_id)?;
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        let target_path = validate_path(&req.target_path)?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;
        let mount = MountSpec::from_request(capability, &req.volume_context, req.readonly)?;
        let target = IscsiTarget::from_contexts(&req.volume_context, &req.publish_context)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path.display(),
            target_iqn = %target.iqn,
            portals = %target.portals.portal_strings().join(","),
            lun = target.lun,
            fs_type = %mount.fs_type,
            readonly = req.readonly,
            "NodePublishVolume request"
        );

        let lifecycle = self.lifecycle.clone();
        let publish = PublishRequest {
            volume_id,
            target_path,
            target,
            mount,
        };
        run_blocking("NodePublishVolume", move || lifecycle.publish(&publish)).await?;

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unmount a volume and detach it once nothing uses its device.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();

        let volume_id = VolumeId::new(req.volume_id)?;
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        let target_path = validate_path(&req.target_path)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path.display(),
            "NodeUnpublishVolume request"
        );

        let lifecycle = self.lifecycle.clone();
        run_blocking("NodeUnpublishVolume", move || {
            lifecycle.unpublish(&volume_id, &target_path)
        })
        .await?;

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(NodeError::Unimplemented("NodeGetVolumeStats").into())
    }

    /// Grow a published volume after the array resized it.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();

        let volume_id = VolumeId::new(req.volume_id)?;
        let volume_path = if req.volume_path.is_empty() {
            None
        } else {
            Some(validate_path(&req.volume_path)?)
        };

        info!(
            volume_id = %volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        let lifecycle = self.lifecycle.clone();
        run_blocking("NodeExpandVolume", move || {
            lifecycle.expand(&volume_id, volume_path.as_deref())
        })
        .await?;

        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes: 0 }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![rpc_capability(
            csi::node_service_capability::rpc::Type::ExpandVolume,
        )];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Get information about this node. The node ID is the iSCSI initiator name.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let node_id = host::read_initiator_name(&self.initiator_name_file).map_err(|e| {
            error!(error = %e, "Could not determine node ID");
            Status::from(NodeError::from(e))
        })?;

        info!(node_id = %node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PersistMode;
    use crate::platform::fake::FakeHost;
    use csi::node_server::Node;
    use tempfile::TempDir;
    use tonic::Code;

    fn service(dir: &TempDir) -> NodeService {
        let config = NodeConfig {
            state_dir: dir.path().join("state"),
            initiator_name_file: dir.path().join("initiatorname.iscsi"),
            persist_mode: PersistMode::AfterConnect,
            ..NodeConfig::default()
        };
        NodeService::from_config(&config, Tools::from_host(Arc::new(FakeHost::new())))
    }

    #[tokio::test]
    async fn test_publish_requires_volume_id() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let status = svc
            .node_publish_volume(Request::new(csi::NodePublishVolumeRequest {
                target_path: "/mnt/x".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_publish_requires_capability() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let status = svc
            .node_publish_volume(Request::new(csi::NodePublishVolumeRequest {
                volume_id: "pvc-1".to_string(),
                target_path: "/mnt/x".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unpublish_rejects_relative_path() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let status = svc
            .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
                volume_id: "pvc-1".to_string(),
                target_path: "mnt/x".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_expand_requires_volume_id() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let status = svc
            .node_expand_volume(Request::new(csi::NodeExpandVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_get_info_without_initiator_file() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let status = svc
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_unimplemented_rpcs() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);

        let status = svc
            .node_stage_volume(Request::new(csi::NodeStageVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);

        let status = svc
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);

        let status = svc
            .node_get_volume_stats(Request::new(csi::NodeGetVolumeStatsRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
    }
}
