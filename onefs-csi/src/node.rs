//! CSI Node Service Implementation
//!
//! Mounts NFS exports on worker nodes. Staging mounts the export once per
//! node at the staging path; publishing bind-mounts the staging path into the
//! pod's target path, or mounts the export directly when nothing is staged.
//!
//! Host mount operations go through the [`Mounter`] seam so the lifecycle can
//! be driven against [`crate::mount::FakeMounter`] in tests.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::capability::{self, AccessType};
use crate::csi;
use crate::error::{CsiError, Result};
use crate::handle::VolumeHandle;
use crate::metrics::OperationTimer;
use crate::mount::{self, MountError, Mounter};
use crate::request_id;
use crate::session::Session;
use crate::types::{publish_context, volume_context, volume_path};

/// Filesystem type used for every export mount.
const NFS_FS_TYPE: &str = "nfs";

type PathLocks = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

/// Held for the duration of a mount operation on one path. The map entry is
/// dropped with the last holder.
struct PathGuard<'a> {
    path: PathBuf,
    locks: &'a PathLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own reference left means nobody is waiting
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.path);
        }
    }
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (mount the NFS export at the staging path)
/// - Volume unstaging (unmount and remove the staging path)
/// - Volume publishing (bind mount from staging, or a direct NFS mount)
/// - Volume unpublishing (unmount and remove the target path)
/// - Node identity and capability reporting
pub struct NodeService {
    session: Arc<Session>,
    mounter: Arc<dyn Mounter>,
    /// One lock per staging or target path with an operation in flight
    path_locks: PathLocks,
}

impl NodeService {
    pub fn new(session: Arc<Session>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            session,
            mounter,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Validate that a path is safe to hand to mount(8).
    fn validate_path(path: &str) -> Result<()> {
        if !path.starts_with('/') {
            return Err(CsiError::invalid_argument(format!(
                "Path must be absolute: {}",
                path
            )));
        }

        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
            return Err(CsiError::invalid_argument(format!(
                "Path contains dangerous character: '{}'",
                c
            )));
        }

        if path.split('/').any(|part| part == "..") {
            return Err(CsiError::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    /// Serialize mount operations on one path.
    async fn lock_path(&self, path: &Path) -> PathGuard<'_> {
        let lock = {
            let mut locks = self.path_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        PathGuard {
            path: path.to_path_buf(),
            locks: &self.path_locks,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// NFS source (`address:path`) for a volume.
    ///
    /// Looks at the publish context first, then the volume context, then
    /// falls back to the handle and the driver configuration.
    fn export_source(
        &self,
        handle: &VolumeHandle,
        publish: &HashMap<String, String>,
        volume: &HashMap<String, String>,
    ) -> Result<String> {
        let lookup = |map: &HashMap<String, String>, key: &str| {
            map.get(key).filter(|v| !v.is_empty()).cloned()
        };

        let config = self.session.config();
        let address = lookup(publish, publish_context::SERVICE_ADDRESS)
            .or_else(|| lookup(volume, volume_context::AZ_SERVICE_IP))
            .or_else(|| handle.service_address().map(str::to_string))
            .or_else(|| config.endpoint_host())
            .ok_or_else(|| {
                CsiError::failed_precondition(format!(
                    "No service address known for volume {}",
                    handle
                ))
            })?;
        let path = lookup(publish, publish_context::PATH)
            .or_else(|| lookup(volume, volume_context::PATH))
            .unwrap_or_else(|| volume_path(&config.base_path, handle.name()));

        Ok(format!("{}:{}", address, path))
    }

    /// Unmount `path` if mounted and remove the directory. Absent paths are
    /// already clean.
    async fn unmount_and_remove(&self, path: &Path) -> Result<()> {
        let exists = tokio::fs::try_exists(path).await.map_err(|e| {
            CsiError::internal(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        if !exists {
            debug!(path = %path.display(), "Path does not exist, nothing to unmount");
            return Ok(());
        }

        match self.mounter.unmount(path).await {
            Ok(()) => {}
            Err(MountError::NotMounted(_)) => {
                debug!(path = %path.display(), "Path is not mounted");
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to unmount");
                return Err(e.into());
            }
        }

        match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                // Only warn; the directory might not be empty
                warn!(error = %e, path = %path.display(), "Could not remove directory");
                Ok(())
            }
        }
    }

    async fn ensure_directory(path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(CsiError::failed_precondition(format!(
                "{} exists and is not a directory",
                path.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await.map_err(|e| {
                    CsiError::internal(format!("Failed to create {}: {}", path.display(), e))
                })
            }
            Err(e) => Err(CsiError::internal(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    // ========================================================================
    // NodeStageVolume / NodeUnstageVolume
    // ========================================================================

    async fn stage_volume_inner(&self, req: csi::NodeStageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::invalid_argument("Staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        let Some(cap) = req.volume_capability.as_ref() else {
            return Err(CsiError::invalid_argument("Volume capability is required"));
        };
        if cap.access_mode.is_none() && !self.session.config().allow_omitted_access_mode {
            return Err(CsiError::invalid_argument("Access mode is required"));
        }
        if matches!(capability::access_type(cap), Some(AccessType::Block)) {
            return Err(CsiError::invalid_argument(
                "Block access type is not supported",
            ));
        }

        let handle: VolumeHandle = req.volume_id.parse()?;
        self.session.auto_probe().await?;

        let source = self.export_source(&handle, &req.publish_context, &req.volume_context)?;
        let staging = Path::new(&req.staging_target_path);
        let _guard = self.lock_path(staging).await;

        Self::ensure_directory(staging).await?;

        if let Some(existing) = mount::find_mount(self.mounter.as_ref(), staging).await? {
            if existing.device == source {
                info!(staging_target_path = %staging.display(), "Volume already staged");
                return Ok(());
            }
            return Err(CsiError::failed_precondition(format!(
                "Staging path {} is already mounted from {}",
                staging.display(),
                existing.device
            )));
        }

        let mut options = self.session.config().nfs_mount_options.clone();
        options.extend(capability::mount_flags(cap));
        self.mounter
            .mount(&source, staging, NFS_FS_TYPE, &options)
            .await?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %staging.display(),
            source = %source,
            "Volume staged successfully"
        );
        Ok(())
    }

    async fn unstage_volume_inner(&self, req: csi::NodeUnstageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::invalid_argument("Staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;
        self.session.auto_probe().await?;

        let staging = Path::new(&req.staging_target_path);
        let _guard = self.lock_path(staging).await;
        self.unmount_and_remove(staging).await?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %staging.display(),
            "Volume unstaged successfully"
        );
        Ok(())
    }

    // ========================================================================
    // NodePublishVolume / NodeUnpublishVolume
    // ========================================================================

    async fn publish_volume_inner(&self, req: csi::NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::invalid_argument("Target Path is required"));
        }
        let Some(cap) = req.volume_capability.as_ref() else {
            return Err(CsiError::invalid_argument("Volume Capability is required"));
        };
        let Some(access_type) = capability::access_type(cap) else {
            return Err(CsiError::invalid_argument("Volume Access Type is required"));
        };
        if cap.access_mode.is_none() {
            return Err(CsiError::invalid_argument("Volume Access Mode is required"));
        }

        let handle: VolumeHandle = req.volume_id.parse()?;

        if matches!(access_type, AccessType::Block) {
            return Err(CsiError::invalid_argument(
                "Block access type is not supported",
            ));
        }
        capability::check_capability(cap).map_err(CsiError::InvalidArgument)?;
        Self::validate_path(&req.target_path)?;
        if !req.staging_target_path.is_empty() {
            Self::validate_path(&req.staging_target_path)?;
        }
        self.session.auto_probe().await?;

        let target = Path::new(&req.target_path);
        let read_only = capability::is_read_only(cap, req.readonly);
        let _guard = self.lock_path(target).await;

        Self::ensure_directory(target).await?;

        // Bind from staging when it is mounted, otherwise mount the export
        let staging = Path::new(&req.staging_target_path);
        let staged = if req.staging_target_path.is_empty() {
            None
        } else {
            mount::find_mount(self.mounter.as_ref(), staging).await?
        };
        let source = match &staged {
            Some(m) => m.device.clone(),
            None => self.export_source(&handle, &req.publish_context, &req.volume_context)?,
        };

        if let Some(existing) = mount::find_mount(self.mounter.as_ref(), target).await? {
            if existing.device == source && existing.is_read_only() == read_only {
                info!(target_path = %target.display(), "Volume already published");
                return Ok(());
            }
            return Err(CsiError::failed_precondition(format!(
                "Target path {} is already mounted from {} (read-only: {})",
                target.display(),
                existing.device,
                existing.is_read_only()
            )));
        }

        let mut options = Vec::new();
        if read_only {
            options.push("ro".to_string());
        }
        options.extend(capability::mount_flags(cap));

        if staged.is_some() {
            self.mounter.bind_mount(staging, target, &options).await?;
        } else {
            let mut nfs_options = self.session.config().nfs_mount_options.clone();
            nfs_options.extend(options);
            self.mounter
                .mount(&source, target, NFS_FS_TYPE, &nfs_options)
                .await?;
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %target.display(),
            source = %source,
            read_only,
            "Volume published successfully"
        );
        Ok(())
    }

    async fn unpublish_volume_inner(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID is required"));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::invalid_argument("Target Path is required"));
        }
        Self::validate_path(&req.target_path)?;
        self.session.auto_probe().await?;

        let target = Path::new(&req.target_path);
        let _guard = self.lock_path(target).await;
        self.unmount_and_remove(target).await?;

        info!(
            volume_id = %req.volume_id,
            target_path = %target.display(),
            "Volume unpublished successfully"
        );
        Ok(())
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume: mount the export at the staging path.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );

        timer.finish(self.stage_volume_inner(req).await)?;
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        timer.finish(self.unstage_volume_inner(req).await)?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    /// Publish a volume to a target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            readonly = req.readonly,
            "NodePublishVolume request"
        );

        timer.finish(self.publish_volume_inner(req).await)?;
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let request_id = request_id(&request);
        let req = request.into_inner();
        info!(
            request_id = %request_id,
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        timer.finish(self.unpublish_volume_inner(req).await)?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Get information about this node. Does not touch the backend.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        let node_id = self.session.node_id().to_string();
        info!(node_id = %node_id, "NodeGetInfo request");

        let accessible_topology = self.session.node_ip().map(|ip| {
            let mut segments = HashMap::new();
            segments.insert(
                format!("{}/node-ip", self.session.config().driver_name),
                ip.to_string(),
            );
            csi::Topology { segments }
        });

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: 0, // No limit
            accessible_topology,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Expand a volume on this node (quota-backed volumes need no node step).
    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(CsiError::Unimplemented("NodeExpandVolume is not supported".into()).into())
    }

    /// Get volume statistics (not implemented).
    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(CsiError::Unimplemented("NodeGetVolumeStats is not supported".into()).into())
    }
}
