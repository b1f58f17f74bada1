//! CSI Identity service.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::csi;
use crate::metrics::OperationTimer;
use crate::request_id;
use crate::session::Session;

pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DRIVER_URL: &str = env!("CARGO_PKG_REPOSITORY");

/// Identity RPCs. Name and capabilities are static; readiness is delegated to
/// the session's probe supervisor.
pub struct IdentityService {
    session: Arc<Session>,
}

impl IdentityService {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Configured driver name, crate version and repository URL.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let mut manifest = HashMap::new();
        manifest.insert("url".to_string(), DRIVER_URL.to_string());

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.session.config().driver_name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest,
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service {
                    r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                },
            )),
        }];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Forces a readiness check. A failed check is reported as `ready = false`,
    /// not as an RPC error.
    async fn probe(
        &self,
        request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let timer = OperationTimer::new("probe");
        let request_id = request_id(&request);
        info!(request_id = %request_id, mode = %self.session.mode(), "Probe request");

        let ready = match self.session.probe().await {
            Ok(()) => {
                timer.success();
                true
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Plugin is not ready");
                timer.failure(e.code_name());
                false
            }
        };

        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConnector, MemoryBackend, MemoryConnector};
    use crate::config::DriverConfig;
    use csi::identity_server::Identity;

    fn service(backend: Arc<MemoryBackend>) -> IdentityService {
        let config = DriverConfig {
            node_id: "node-a".to_string(),
            ..Default::default()
        };
        let connector: Arc<dyn BackendConnector> = Arc::new(MemoryConnector::new(backend));
        IdentityService::new(Arc::new(Session::new(config, Some(connector))))
    }

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = service(Arc::new(MemoryBackend::new()));
        let request = Request::new(csi::GetPluginInfoRequest {});
        let response = Identity::get_plugin_info(&service, request).await.unwrap();
        let info = response.into_inner();

        assert_eq!(info.name, "csi-isilon.dellemc.com");
        assert_eq!(info.vendor_version, DRIVER_VERSION);
        assert!(info.manifest.contains_key("url"));
    }

    #[tokio::test]
    async fn test_get_plugin_capabilities() {
        let service = service(Arc::new(MemoryBackend::new()));
        let request = Request::new(csi::GetPluginCapabilitiesRequest {});
        let response = Identity::get_plugin_capabilities(&service, request).await.unwrap();
        let caps = response.into_inner();

        // Only the controller service is advertised
        assert_eq!(caps.capabilities.len(), 1);
    }

    #[tokio::test]
    async fn test_probe() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service(backend.clone());

        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(true));

        backend.inject(|f| f.unreachable = true);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(false));
    }
}
