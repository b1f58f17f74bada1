//! CSI Controller Service Implementation
//!
//! Turns volume and snapshot lifecycle RPCs into backend primitives:
//! directories, directory quotas, NFS exports and snapshots.
//!
//! No per-volume lock is held. Every step checks the cluster first and acts
//! only if needed, so an interrupted multi-step sequence resumes on retry:
//!
//! ```text
//! create: directory (or clone copy) -> quota -> export
//! delete: quota -> directory -> export
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::backend::{self, BackendError, Export, Snapshot, StorageBackend};
use crate::capability;
use crate::csi;
use crate::error::{CsiError, Result};
use crate::handle::{self, SnapshotHandle, VolumeHandle};
use crate::metrics::OperationTimer;
use crate::request_id;
use crate::session::Session;
use crate::types::{VolumeParameters, publish_context, volume_context, volume_path};

/// Default volume size: 8GiB
pub const DEFAULT_VOLUME_SIZE: i64 = 8 * 1024 * 1024 * 1024;

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation (empty, or cloned from a snapshot or a volume) and deletion
/// - Volume listing with pagination
/// - Publishing a volume to a node (connection info only, no mount)
/// - Snapshot creation and deletion
/// - Capacity and capability reporting
pub struct ControllerService {
    session: Arc<Session>,
}

impl ControllerService {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Classify a backend failure, dropping the connection on transport errors.
    async fn fail(&self, err: BackendError) -> CsiError {
        self.session.backend_failed(&err).await;
        CsiError::from(err)
    }

    async fn check<T>(&self, result: backend::Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Like [`Self::check`], but a `NotFound` outcome becomes `None`.
    async fn lookup<T>(&self, result: backend::Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Requested volume size from the capacity range.
    fn volume_size(capacity_range: Option<&csi::CapacityRange>) -> Result<i64> {
        let Some(range) = capacity_range else {
            return Ok(DEFAULT_VOLUME_SIZE);
        };

        if range.required_bytes < 0 || range.limit_bytes < 0 {
            return Err(CsiError::invalid_argument(
                "Capacity range must not be negative",
            ));
        }
        if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
            return Err(CsiError::invalid_argument(format!(
                "Required bytes {} exceed limit bytes {}",
                range.required_bytes, range.limit_bytes
            )));
        }

        let size = if range.required_bytes > 0 {
            range.required_bytes
        } else {
            range.limit_bytes
        };
        if size == 0 {
            return Err(CsiError::invalid_argument(
                "Required or limit bytes must be positive",
            ));
        }
        Ok(size)
    }

    fn build_volume(
        handle: &VolumeHandle,
        path: &str,
        service_address: Option<&str>,
        capacity_bytes: i64,
        content_source: Option<csi::VolumeContentSource>,
    ) -> csi::Volume {
        let mut context = HashMap::new();
        context.insert(volume_context::NAME.to_string(), handle.name().to_string());
        context.insert(
            volume_context::ACCESS_ZONE.to_string(),
            handle.access_zone().to_string(),
        );
        context.insert(volume_context::PATH.to_string(), path.to_string());
        if let Some(addr) = service_address.or(handle.service_address()) {
            context.insert(volume_context::AZ_SERVICE_IP.to_string(), addr.to_string());
        }

        csi::Volume {
            capacity_bytes,
            volume_id: handle.to_string(),
            volume_context: context,
            content_source,
            accessible_topology: vec![],
        }
    }

    fn build_snapshot(snapshot: &Snapshot, handle: &SnapshotHandle) -> csi::Snapshot {
        csi::Snapshot {
            size_bytes: snapshot.size_bytes,
            snapshot_id: handle.to_string(),
            source_volume_id: handle.source().to_string(),
            creation_time: Some(Timestamp {
                seconds: snapshot.created,
                nanos: 0,
            }),
            ready_to_use: true,
            group_snapshot_id: String::new(),
        }
    }

    fn rpc_capability(
        rpc: csi::controller_service_capability::rpc::Type,
    ) -> csi::ControllerServiceCapability {
        csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: rpc as i32 },
            )),
        }
    }

    // ========================================================================
    // CreateVolume
    // ========================================================================

    async fn create_volume_inner(
        &self,
        request_id: &str,
        req: csi::CreateVolumeRequest,
    ) -> Result<csi::Volume> {
        let name = req.name.as_str();
        if name.is_empty() {
            return Err(CsiError::invalid_argument("Volume name is required"));
        }
        handle::check_volume_name(name)?;
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid_argument("Volume capabilities are required"));
        }
        capability::validate_capabilities(&req.volume_capabilities)
            .map_err(CsiError::InvalidArgument)?;

        let size_bytes = Self::volume_size(req.capacity_range.as_ref())?;
        let config = self.session.config();
        let params =
            VolumeParameters::resolve(&req.parameters, &config.access_zone, &config.base_path);
        let path = params.volume_path(name);

        // Decode content sources before touching the cluster
        let source = match req.volume_content_source.as_ref().and_then(|s| s.r#type.as_ref()) {
            Some(csi::volume_content_source::Type::Snapshot(s)) => {
                Some(ContentSource::Snapshot(s.snapshot_id.parse::<SnapshotHandle>()?))
            }
            Some(csi::volume_content_source::Type::Volume(v)) => {
                Some(ContentSource::Volume(v.volume_id.parse::<VolumeHandle>()?))
            }
            None => None,
        };

        info!(
            request_id = %request_id,
            name = %name,
            size_bytes,
            access_zone = %params.access_zone,
            path = %path,
            "Creating volume"
        );

        let backend = self.session.backend().await?;

        // Idempotency: an existing export for the path is the same volume if
        // its quota records the same size
        let existing = self
            .lookup(
                backend
                    .get_export_by_path_with_zone(&path, &params.access_zone)
                    .await,
            )
            .await?;
        if let Some(export) = existing {
            self.ensure_quota(&backend, &path, name, size_bytes).await?;
            let handle = VolumeHandle::new(name, export.id, params.access_zone.clone(), None)?;
            info!(
                request_id = %request_id,
                volume_id = %handle,
                export_id = export.id,
                "Volume already exists"
            );
            return Ok(Self::build_volume(
                &handle,
                &path,
                params.az_service_ip.as_deref(),
                size_bytes,
                req.volume_content_source,
            ));
        }

        match &source {
            Some(ContentSource::Snapshot(snapshot)) => {
                self.clone_from_snapshot(&backend, snapshot, &path).await?
            }
            Some(ContentSource::Volume(volume)) => {
                self.clone_from_volume(&backend, volume, &path).await?
            }
            None => {
                if self.check(backend.directory_exists(&path).await).await? {
                    debug!(path = %path, "Reusing existing volume directory");
                } else {
                    self.check(backend.create_directory(&path).await).await?;
                }
            }
        }

        self.ensure_quota(&backend, &path, name, size_bytes).await?;

        let export_id = match backend.create_export(&path, &params.access_zone).await {
            Ok(id) => id,
            Err(BackendError::AlreadyExists(_)) => {
                // Lost a race with a concurrent create of the same name
                let export = self
                    .check(
                        backend
                            .get_export_by_path_with_zone(&path, &params.access_zone)
                            .await,
                    )
                    .await?;
                export.id
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, path = %path, "Failed to create export");
                return Err(self.fail(e).await);
            }
        };

        let handle = VolumeHandle::new(name, export_id, params.access_zone.clone(), None)?;

        info!(
            request_id = %request_id,
            volume_id = %handle,
            export_id,
            size_bytes,
            "Volume created successfully"
        );

        Ok(Self::build_volume(
            &handle,
            &path,
            params.az_service_ip.as_deref(),
            size_bytes,
            req.volume_content_source,
        ))
    }

    /// Make sure a quota of `size_bytes` covers `path`. An existing quota of a
    /// different size means the name is taken by another volume.
    async fn ensure_quota(
        &self,
        backend: &Arc<dyn StorageBackend>,
        path: &str,
        name: &str,
        size_bytes: i64,
    ) -> Result<()> {
        let existing = self.lookup(backend.get_quota_by_path(path).await).await?;
        let quota = match existing {
            Some(quota) => quota,
            None => {
                let enforced = self.session.config().quota_enabled;
                match backend.create_quota(path, name, size_bytes, enforced).await {
                    Ok(id) => {
                        debug!(path = %path, quota_id = %id, size_bytes, enforced, "Quota created");
                        return Ok(());
                    }
                    Err(BackendError::AlreadyExists(_)) => {
                        self.check(backend.get_quota_by_path(path).await).await?
                    }
                    Err(e) => {
                        error!(error = %e, path = %path, "Failed to create quota");
                        return Err(self.fail(e).await);
                    }
                }
            }
        };

        if quota.size_bytes != size_bytes {
            warn!(
                name = %name,
                existing_size = quota.size_bytes,
                requested_size = size_bytes,
                "Volume exists with a different size"
            );
            return Err(CsiError::AlreadyExists(format!(
                "Volume '{}' already exists with size {} bytes, requested {} bytes",
                name, quota.size_bytes, size_bytes
            )));
        }
        Ok(())
    }

    async fn clone_from_snapshot(
        &self,
        backend: &Arc<dyn StorageBackend>,
        source: &SnapshotHandle,
        path: &str,
    ) -> Result<()> {
        let snapshot = self
            .lookup(backend.get_snapshot(source.snapshot_id()).await)
            .await?
            .ok_or_else(|| {
                CsiError::not_found(format!("Source snapshot {} not found", source))
            })?;

        if self.check(backend.directory_exists(path).await).await? {
            debug!(path = %path, "Clone target already materialized");
            return Ok(());
        }

        info!(snapshot_id = snapshot.id, snapshot = %snapshot.name, path = %path, "Cloning volume from snapshot");
        self.check(backend.copy_snapshot(&snapshot, path).await).await
    }

    async fn clone_from_volume(
        &self,
        backend: &Arc<dyn StorageBackend>,
        source: &VolumeHandle,
        path: &str,
    ) -> Result<()> {
        let export = self
            .lookup(
                backend
                    .get_export_by_id_with_zone(source.export_id(), source.access_zone())
                    .await,
            )
            .await?
            .ok_or_else(|| CsiError::not_found(format!("Source volume {} not found", source)))?;
        let source_path = self.export_path(&export, source.name());

        if self.check(backend.directory_exists(path).await).await? {
            debug!(path = %path, "Clone target already materialized");
            return Ok(());
        }

        info!(source = %source_path, path = %path, "Cloning volume from volume");
        self.check(backend.copy_directory(&source_path, path).await)
            .await
    }

    /// Directory behind an export, falling back to the default layout.
    fn export_path(&self, export: &Export, name: &str) -> String {
        export
            .path()
            .map(str::to_string)
            .unwrap_or_else(|| volume_path(&self.session.config().base_path, name))
    }

    // ========================================================================
    // DeleteVolume
    // ========================================================================

    async fn delete_volume_inner(&self, request_id: &str, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        let handle: VolumeHandle = volume_id.parse()?;
        let backend = self.session.backend().await?;

        let Some(export) = self
            .lookup(
                backend
                    .get_export_by_id_with_zone(handle.export_id(), handle.access_zone())
                    .await,
            )
            .await?
        else {
            warn!(request_id = %request_id, volume_id = %volume_id, "Export not found, treating volume as already deleted");
            return Ok(());
        };
        let path = self.export_path(&export, handle.name());

        match backend
            .delete_quota_by_export_id_with_zone(
                handle.name(),
                handle.export_id(),
                handle.access_zone(),
            )
            .await
        {
            Ok(()) => debug!(path = %path, "Quota deleted"),
            Err(e) if e.is_not_found() => debug!(path = %path, "Quota already gone"),
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Failed to delete quota");
                return Err(self.fail(e).await);
            }
        }

        match backend.delete_directory(&path).await {
            Ok(()) => debug!(path = %path, "Volume directory deleted"),
            Err(e) if e.is_not_found() => debug!(path = %path, "Volume directory already gone"),
            Err(e) => {
                error!(request_id = %request_id, error = %e, path = %path, "Failed to delete volume directory");
                return Err(self.fail(e).await);
            }
        }

        match backend
            .delete_export(handle.export_id(), handle.access_zone())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(export_id = handle.export_id(), "Export already gone"),
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Failed to delete export");
                return Err(self.fail(e).await);
            }
        }

        info!(request_id = %request_id, volume_id = %volume_id, "Volume deleted successfully");
        Ok(())
    }

    // ========================================================================
    // ControllerPublishVolume
    // ========================================================================

    async fn publish_volume_inner(
        &self,
        req: csi::ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        if req.node_id.is_empty() {
            return Err(CsiError::invalid_argument("Node ID is required"));
        }
        let Some(cap) = req.volume_capability.as_ref() else {
            return Err(CsiError::invalid_argument("Volume capability is required"));
        };
        if cap.access_mode.is_none() {
            return Err(CsiError::invalid_argument("Access mode is required"));
        }

        let handle: VolumeHandle = req.volume_id.parse()?;
        let backend = self.session.backend().await?;

        let export = self
            .lookup(
                backend
                    .get_export_by_id_with_zone(handle.export_id(), handle.access_zone())
                    .await,
            )
            .await?
            .ok_or_else(|| CsiError::not_found(format!("Volume {} not found", req.volume_id)))?;

        capability::check_capability(cap).map_err(CsiError::InvalidArgument)?;

        let mut context = HashMap::new();
        context.insert(
            publish_context::ACCESS_ZONE.to_string(),
            handle.access_zone().to_string(),
        );
        context.insert(
            publish_context::PATH.to_string(),
            self.export_path(&export, handle.name()),
        );
        context.insert(publish_context::EXPORT_ID.to_string(), export.id.to_string());
        // Volumes are listed without their service address, so the address
        // travels in the volume context; older handles may still carry it
        if let Some(addr) = req
            .volume_context
            .get(volume_context::AZ_SERVICE_IP)
            .filter(|a| !a.is_empty())
            .cloned()
            .or_else(|| handle.service_address().map(str::to_string))
            .or_else(|| self.session.config().endpoint_host())
        {
            context.insert(publish_context::SERVICE_ADDRESS.to_string(), addr);
        }
        context.insert(
            publish_context::READ_ONLY.to_string(),
            req.readonly.to_string(),
        );
        Ok(context)
    }

    // ========================================================================
    // ValidateVolumeCapabilities
    // ========================================================================

    async fn validate_capabilities_inner(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid_argument("Volume capabilities are required"));
        }

        let handle: VolumeHandle = req.volume_id.parse()?;
        let backend = self.session.backend().await?;
        if self
            .lookup(
                backend
                    .get_export_by_id_with_zone(handle.export_id(), handle.access_zone())
                    .await,
            )
            .await?
            .is_none()
        {
            return Err(CsiError::not_found(format!(
                "Volume {} not found",
                req.volume_id
            )));
        }

        if let Err(message) = capability::validate_capabilities(&req.volume_capabilities) {
            warn!(volume_id = %req.volume_id, message = %message, "Volume capabilities not supported");
            return Ok(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            });
        }

        Ok(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        })
    }

    // ========================================================================
    // ListVolumes
    // ========================================================================

    async fn list_volumes_inner(
        &self,
        req: csi::ListVolumesRequest,
    ) -> Result<csi::ListVolumesResponse> {
        let limit = u32::try_from(req.max_entries).map_err(|_| {
            CsiError::invalid_argument(format!(
                "max_entries must not be negative, got {}",
                req.max_entries
            ))
        })?;

        let backend = self.session.backend().await?;
        let page = self
            .check(
                backend
                    .get_exports_with_limit(limit, &req.starting_token)
                    .await,
            )
            .await?;

        let mut entries = Vec::with_capacity(page.exports.len());
        for export in page.exports {
            let Some(path) = export.path().map(str::to_string) else {
                continue;
            };
            let Some(name) = path.rsplit('/').next().filter(|n| !n.is_empty()) else {
                continue;
            };
            let handle = match VolumeHandle::new(name, export.id, export.zone.clone(), None) {
                Ok(h) => h,
                Err(e) => {
                    warn!(export_id = export.id, error = %e, "Skipping export that cannot be expressed as a volume");
                    continue;
                }
            };
            let capacity = self
                .lookup(backend.get_quota_by_path(&path).await)
                .await?
                .map(|q| q.size_bytes)
                .unwrap_or(0);

            entries.push(csi::list_volumes_response::Entry {
                volume: Some(Self::build_volume(&handle, &path, None, capacity, None)),
                status: None,
            });
        }

        Ok(csi::ListVolumesResponse {
            entries,
            next_token: page.next_token,
        })
    }

    // ========================================================================
    // GetCapacity
    // ========================================================================

    async fn get_capacity_inner(
        &self,
        req: csi::GetCapacityRequest,
    ) -> Result<csi::GetCapacityResponse> {
        capability::check_capacity_capabilities(&req.volume_capabilities)?;

        let backend = self.session.backend().await?;
        let available = self.check(backend.available_capacity().await).await?;
        if available < 0 {
            error!(available, "Backend reported negative capacity");
            return Err(CsiError::internal(format!(
                "backend reported negative available capacity {}",
                available
            )));
        }

        Ok(csi::GetCapacityResponse {
            available_capacity: available,
            maximum_volume_size: None,
            minimum_volume_size: None,
        })
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    async fn create_snapshot_inner(
        &self,
        request_id: &str,
        req: csi::CreateSnapshotRequest,
    ) -> Result<csi::Snapshot> {
        if req.source_volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Source volume ID is required"));
        }
        if req.name.is_empty() {
            return Err(CsiError::invalid_argument("Snapshot name is required"));
        }
        let source: VolumeHandle = req.source_volume_id.parse()?;

        let config = self.session.config();
        let params =
            VolumeParameters::resolve(&req.parameters, &config.access_zone, &config.base_path);
        let source_path = params.volume_path(source.name());

        let backend = self.session.backend().await?;
        if !self.check(backend.directory_exists(&source_path).await).await? {
            return Err(CsiError::not_found(format!(
                "Source volume {} not found at {}",
                req.source_volume_id, source_path
            )));
        }

        if let Some(existing) = self
            .lookup(backend.get_snapshot_by_name(&req.name).await)
            .await?
        {
            return self.existing_snapshot(existing, &source, &source_path, &req.name);
        }

        let snapshot = match backend.create_snapshot(&source_path, &req.name).await {
            Ok(s) => s,
            Err(BackendError::AlreadyExists(_)) => {
                let existing = self
                    .check(backend.get_snapshot_by_name(&req.name).await)
                    .await?;
                return self.existing_snapshot(existing, &source, &source_path, &req.name);
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Failed to create snapshot");
                return Err(self.fail(e).await);
            }
        };

        let handle = SnapshotHandle::new(snapshot.id, source);
        info!(
            request_id = %request_id,
            snapshot_id = %handle,
            path = %source_path,
            "Snapshot created successfully"
        );
        Ok(Self::build_snapshot(&snapshot, &handle))
    }

    fn existing_snapshot(
        &self,
        existing: Snapshot,
        source: &VolumeHandle,
        source_path: &str,
        name: &str,
    ) -> Result<csi::Snapshot> {
        if existing.path != source_path {
            return Err(CsiError::AlreadyExists(format!(
                "Snapshot '{}' already exists for a different source ({})",
                name, existing.path
            )));
        }
        let handle = SnapshotHandle::new(existing.id, source.clone());
        info!(snapshot_id = %handle, "Snapshot already exists");
        Ok(Self::build_snapshot(&existing, &handle))
    }

    async fn delete_snapshot_inner(&self, request_id: &str, snapshot_id: &str) -> Result<()> {
        if snapshot_id.is_empty() {
            return Err(CsiError::invalid_argument("Snapshot ID is required"));
        }
        let handle: SnapshotHandle = snapshot_id.parse()?;
        let backend = self.session.backend().await?;

        if self
            .lookup(backend.get_snapshot(handle.snapshot_id()).await)
            .await?
            .is_none()
        {
            return Err(CsiError::not_found(format!(
                "Snapshot {} not found",
                snapshot_id
            )));
        }

        self.check(backend.delete_snapshot(handle.snapshot_id()).await)
            .await?;
        info!(request_id = %request_id, snapshot_id = %snapshot_id, "Snapshot deleted successfully");
        Ok(())
    }
}

/// Decoded `VolumeContentSource`.
enum ContentSource {
    Snapshot(SnapshotHandle),
    Volume(VolumeHandle),
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(request_id = %request_id, name = %req.name, "CreateVolume request");

        let volume = timer.finish(self.create_volume_inner(&request_id, req).await)?;
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume),
        }))
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(request_id = %request_id, volume_id = %req.volume_id, "DeleteVolume request");

        timer.finish(self.delete_volume_inner(&request_id, &req.volume_id).await)?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Authorize a node for a volume and return its connection info.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_publish_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            volume_id = %req.volume_id,
            node_id = %req.node_id,
            readonly = req.readonly,
            "ControllerPublishVolume request"
        );

        let publish_context = timer.finish(self.publish_volume_inner(req).await)?;
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    /// Unpublish a volume from a node (not supported by this backend).
    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(CsiError::Unimplemented("ControllerUnpublishVolume is not supported".into()).into())
    }

    /// Validate volume capabilities.
    ///
    /// Returns "confirmed" only if ALL requested capabilities are supported:
    /// mount access with any named access mode.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let timer = OperationTimer::new("validate_volume_capabilities");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(request_id = %request_id, volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        let response = timer.finish(self.validate_capabilities_inner(req).await)?;
        Ok(Response::new(response))
    }

    /// List volumes in the default access zone, one page at a time.
    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        let timer = OperationTimer::new("list_volumes");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListVolumes request"
        );

        let response = timer.finish(self.list_volumes_inner(req).await)?;
        debug!(
            request_id = %request_id,
            count = response.entries.len(),
            next_token = %response.next_token,
            "Listed volumes"
        );
        Ok(Response::new(response))
    }

    /// Report free space on the cluster.
    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        let timer = OperationTimer::new("get_capacity");
        let request_id = request_id(&request);
        let req = request.into_inner();
        debug!(request_id = %request_id, "GetCapacity request");

        let response = timer.finish(self.get_capacity_inner(req).await)?;
        Ok(Response::new(response))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::CreateDeleteSnapshot,
            Type::CloneVolume,
        ]
        .into_iter()
        .map(Self::rpc_capability)
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            source_volume_id = %req.source_volume_id,
            name = %req.name,
            "CreateSnapshot request"
        );

        let snapshot = timer.finish(self.create_snapshot_inner(&request_id, req).await)?;
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot),
        }))
    }

    /// Delete a snapshot.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(request_id = %request_id, snapshot_id = %req.snapshot_id, "DeleteSnapshot request");

        timer.finish(self.delete_snapshot_inner(&request_id, &req.snapshot_id).await)?;
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    /// List snapshots (not supported by this backend).
    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(CsiError::Unimplemented("ListSnapshots is not supported".into()).into())
    }

    /// Expand a volume (not supported by this backend).
    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(CsiError::Unimplemented("ControllerExpandVolume is not supported".into()).into())
    }
}
