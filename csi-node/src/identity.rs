//! CSI Identity Service Implementation
//!
//! Provides plugin identification, capability reporting and readiness.

use std::path::PathBuf;

use tonic::{Request, Response, Status};
use tracing::{debug, error};

use crate::csi;
use crate::error::NodeError;
use crate::host;

pub const DRIVER_NAME: &str = "san-iscsi.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// The readiness check reports ready only when the kernel modules needed to attach
/// volumes are loaded.
pub struct IdentityService {
    proc_modules: PathBuf,
}

impl IdentityService {
    pub fn new(proc_modules: impl Into<PathBuf>) -> Self {
        Self {
            proc_modules: proc_modules.into(),
        }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(host::PROC_MODULES)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        // Node-only binary: online volume expansion is the only capability
        let capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                csi::plugin_capability::VolumeExpansion {
                    r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                },
            )),
        }];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Reports whether the plugin is ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        host::ensure_kernel_modules(&self.proc_modules).map_err(|e| {
            error!(error = %e, "Readiness check failed");
            Status::from(NodeError::from(e))
        })?;

        debug!("Plugin is ready");
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;
    use tempfile::TempDir;
    use tonic::Code;

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = IdentityService::default();
        let request = Request::new(csi::GetPluginInfoRequest {});
        let response = Identity::get_plugin_info(&service, request).await.unwrap();
        let info = response.into_inner();

        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn test_get_plugin_capabilities() {
        let service = IdentityService::default();
        let request = Request::new(csi::GetPluginCapabilitiesRequest {});
        let response = Identity::get_plugin_capabilities(&service, request).await.unwrap();
        let caps = response.into_inner();

        assert_eq!(caps.capabilities.len(), 1);
        assert!(matches!(
            caps.capabilities[0].r#type,
            Some(csi::plugin_capability::Type::VolumeExpansion(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_with_modules_loaded() {
        let dir = TempDir::new().unwrap();
        let modules = dir.path().join("modules");
        std::fs::write(
            &modules,
            "iscsi_tcp 24576 4 - Live 0x0\ndm_multipath 45056 1 - Live 0x0\n",
        )
        .unwrap();

        let service = IdentityService::new(&modules);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }

    #[tokio::test]
    async fn test_not_ready_without_module() {
        let dir = TempDir::new().unwrap();
        let modules = dir.path().join("modules");
        std::fs::write(&modules, "iscsi_tcp 24576 4 - Live 0x0\n").unwrap();

        let service = IdentityService::new(&modules);
        let status = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert!(status.message().contains("dm_multipath"));
    }
}
