//! Integration tests for onefs-csi
//!
//! These tests drive the gRPC service implementations directly with
//! `tonic::Request`, against the in-memory cluster and the fake mounter.
//! Tests focus on:
//! - The full volume lifecycle across controller and node services
//! - Idempotency of create, delete, publish and unpublish
//! - Pagination and snapshot semantics
//! - Readiness gating and backend outages
//! - Fault injection into backend and mount primitives
//! - Concurrent requests for the same volume

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tonic::{Code, Request};

use onefs_csi::backend::{BackendConnector, MemoryBackend, MemoryConnector};
use onefs_csi::csi;
use onefs_csi::csi::controller_server::Controller;
use onefs_csi::csi::identity_server::Identity;
use onefs_csi::csi::node_server::Node;
use onefs_csi::csi::volume_capability::access_mode::Mode;
use onefs_csi::handle::{SnapshotHandle, VolumeHandle};
use onefs_csi::mount::{FakeMounter, MountFaults};
use onefs_csi::types::ServiceMode;
use onefs_csi::{ControllerService, DriverConfig, IdentityService, NodeService, Session};

const GIB: i64 = 1024 * 1024 * 1024;

struct Driver {
    backend: Arc<MemoryBackend>,
    mounter: Arc<FakeMounter>,
    session: Arc<Session>,
    identity: IdentityService,
    controller: Arc<ControllerService>,
    node: NodeService,
}

fn config() -> DriverConfig {
    DriverConfig {
        node_id: "node-a".to_string(),
        endpoint: Some("https://10.0.0.5:8080".to_string()),
        ..Default::default()
    }
}

fn driver_with(config: DriverConfig) -> Driver {
    let backend = Arc::new(MemoryBackend::new());
    let connector: Arc<dyn BackendConnector> = Arc::new(MemoryConnector::new(backend.clone()));
    let session = Arc::new(Session::new(config, Some(connector)));
    let mounter = Arc::new(FakeMounter::new());
    Driver {
        identity: IdentityService::new(session.clone()),
        controller: Arc::new(ControllerService::new(session.clone())),
        node: NodeService::new(session.clone(), mounter.clone()),
        backend,
        mounter,
        session,
    }
}

fn driver() -> Driver {
    driver_with(config())
}

fn capability(mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn create_request(name: &str, size: i64) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes: size,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![capability(Mode::SingleNodeWriter)],
        ..Default::default()
    }
}

async fn create_volume(driver: &Driver, name: &str, size: i64) -> csi::Volume {
    driver
        .controller
        .create_volume(Request::new(create_request(name, size)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap()
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Volume Handle Tests
// ============================================================================

#[test]
fn test_volume_handle_roundtrip() {
    let cases = [
        ("pvc-1", 1, "System", None),
        ("k8s-7f1e2a", 4294967295, "zone-b", Some("10.1.2.3")),
        ("name with spaces", 42, "System", None),
    ];
    for (name, id, zone, addr) in cases {
        let handle = VolumeHandle::new(name, id, zone, addr.map(str::to_string)).unwrap();
        let decoded: VolumeHandle = handle.to_string().parse().unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(decoded.name(), name);
        assert_eq!(decoded.export_id(), id);
        assert_eq!(decoded.access_zone(), zone);
        assert_eq!(decoded.service_address(), addr);
    }

    assert!(VolumeHandle::new("a=_=_=b", 1, "System", None).is_err());
    assert!("v1=_=_=notanumber=_=_=System".parse::<VolumeHandle>().is_err());
    assert!("v1".parse::<VolumeHandle>().is_err());
}

#[test]
fn test_snapshot_handle_roundtrip() {
    let source = VolumeHandle::new("pvc-1", 3, "System", None).unwrap();
    let handle = SnapshotHandle::new(17, source.clone());
    assert_eq!(handle.to_string(), "17=_=_=pvc-1=_=_=3=_=_=System");

    let decoded: SnapshotHandle = handle.to_string().parse().unwrap();
    assert_eq!(decoded.snapshot_id(), 17);
    assert_eq!(decoded.source(), &source);
}

// ============================================================================
// Identity Service Tests
// ============================================================================

#[tokio::test]
async fn test_probe_reflects_backend_health() {
    let driver = driver();

    let ready = driver
        .identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner()
        .ready;
    assert_eq!(ready, Some(true));

    driver.backend.inject(|f| f.unreachable = true);
    let ready = driver
        .identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner()
        .ready;
    assert_eq!(ready, Some(false));

    let err = driver
        .controller
        .create_volume(Request::new(create_request("v1", GIB)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_node_only_probe_needs_no_backend() {
    let config = DriverConfig {
        mode: ServiceMode::Node,
        ..config()
    };
    let session = Arc::new(Session::new(config, None));
    let identity = IdentityService::new(session);

    let ready = identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner()
        .ready;
    assert_eq!(ready, Some(true));
}

// ============================================================================
// End-to-End Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_volume_lifecycle_end_to_end() {
    let driver = driver();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("target");

    // 1. CreateVolume
    let volume = create_volume(&driver, "v1", 8 * GIB).await;
    let handle = volume.volume_id.clone();
    assert_eq!(volume.capacity_bytes, 8 * GIB);

    // 2. ControllerPublishVolume
    let publish_context = driver
        .controller
        .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
            volume_id: handle.clone(),
            node_id: "node-a".to_string(),
            volume_capability: Some(capability(Mode::SingleNodeWriter)),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner()
        .publish_context;

    // 3. NodePublishVolume, twice
    let publish = csi::NodePublishVolumeRequest {
        volume_id: handle.clone(),
        target_path: path_str(&target),
        volume_capability: Some(capability(Mode::SingleNodeWriter)),
        publish_context,
        volume_context: volume.volume_context.clone(),
        ..Default::default()
    };
    driver
        .node
        .node_publish_volume(Request::new(publish.clone()))
        .await
        .unwrap();
    driver
        .node
        .node_publish_volume(Request::new(publish))
        .await
        .unwrap();
    assert!(driver.mounter.is_mounted(&target));
    assert_eq!(driver.mounter.mount_count(), 1);

    // 4. NodeUnpublishVolume; the second call finds the path gone
    let unpublish = csi::NodeUnpublishVolumeRequest {
        volume_id: handle.clone(),
        target_path: path_str(&target),
    };
    driver
        .node
        .node_unpublish_volume(Request::new(unpublish.clone()))
        .await
        .unwrap();
    assert!(!target.exists());
    driver
        .node
        .node_unpublish_volume(Request::new(unpublish))
        .await
        .unwrap();

    // 5. DeleteVolume, twice
    let delete = csi::DeleteVolumeRequest {
        volume_id: handle,
        ..Default::default()
    };
    driver
        .controller
        .delete_volume(Request::new(delete.clone()))
        .await
        .unwrap();
    driver
        .controller
        .delete_volume(Request::new(delete))
        .await
        .unwrap();

    assert_eq!(driver.backend.export_count(), 0);
    assert_eq!(driver.backend.quota_count(), 0);
    assert!(!driver.backend.has_directory("/ifs/data/csi/v1"));
}

#[tokio::test]
async fn test_stage_then_publish_binds_staging_mount() {
    let driver = driver();
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("staging");
    let target = dir.path().join("target");

    let volume = create_volume(&driver, "shared", GIB).await;

    driver
        .node
        .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
            volume_id: volume.volume_id.clone(),
            staging_target_path: path_str(&staging),
            volume_capability: Some(capability(Mode::MultiNodeMultiWriter)),
            volume_context: volume.volume_context.clone(),
            ..Default::default()
        }))
        .await
        .unwrap();

    driver
        .node
        .node_publish_volume(Request::new(csi::NodePublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            staging_target_path: path_str(&staging),
            target_path: path_str(&target),
            volume_capability: Some(capability(Mode::MultiNodeMultiWriter)),
            readonly: true,
            ..Default::default()
        }))
        .await
        .unwrap();

    let mounts = driver.mounter.get_log();
    assert_eq!(mounts.len(), 2);
    let target_mount = onefs_csi::mount::find_mount(driver.mounter.as_ref(), &target)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target_mount.device, "10.0.0.5:/ifs/data/csi/shared");
    assert!(target_mount.is_read_only());

    driver
        .node
        .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            target_path: path_str(&target),
        }))
        .await
        .unwrap();
    driver
        .node
        .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
            volume_id: volume.volume_id,
            staging_target_path: path_str(&staging),
        }))
        .await
        .unwrap();
    assert_eq!(driver.mounter.mount_count(), 0);
}

// ============================================================================
// Controller Semantics Tests
// ============================================================================

#[tokio::test]
async fn test_create_volume_idempotency() {
    let driver = driver();
    let first = create_volume(&driver, "v1", 8 * GIB).await;
    let second = create_volume(&driver, "v1", 8 * GIB).await;
    assert_eq!(first.volume_id, second.volume_id);

    let err = driver
        .controller
        .create_volume(Request::new(create_request("v1", 2 * GIB)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn test_delete_volume_with_missing_export_succeeds() {
    let driver = driver();
    driver
        .controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "ghost=_=_=12=_=_=System".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_validate_volume_capabilities() {
    let driver = driver();
    let volume = create_volume(&driver, "v1", GIB).await;

    let validate = |caps: Vec<csi::VolumeCapability>| csi::ValidateVolumeCapabilitiesRequest {
        volume_id: volume.volume_id.clone(),
        volume_capabilities: caps,
        ..Default::default()
    };

    let requested = vec![
        capability(Mode::SingleNodeWriter),
        capability(Mode::MultiNodeReaderOnly),
    ];
    let response = driver
        .controller
        .validate_volume_capabilities(Request::new(validate(requested.clone())))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.confirmed.unwrap().volume_capabilities, requested);

    let response = driver
        .controller
        .validate_volume_capabilities(Request::new(validate(vec![capability(Mode::Unknown)])))
        .await
        .unwrap()
        .into_inner();
    assert!(response.confirmed.is_none());

    let block = csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: Mode::SingleNodeWriter as i32,
        }),
    };
    let response = driver
        .controller
        .validate_volume_capabilities(Request::new(validate(vec![block])))
        .await
        .unwrap()
        .into_inner();
    assert!(response.confirmed.is_none());
    assert!(response.message.contains("block"));
}

#[tokio::test]
async fn test_list_volumes_walks_all_pages() {
    let driver = driver();
    for name in ["a", "b", "c"] {
        create_volume(&driver, name, GIB).await;
    }

    let mut seen = Vec::new();
    let mut token = String::new();
    loop {
        let page = driver
            .controller
            .list_volumes(Request::new(csi::ListVolumesRequest {
                max_entries: 1,
                starting_token: token,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(page.entries.len() <= 1);
        seen.extend(
            page.entries
                .into_iter()
                .map(|e| e.volume.unwrap().volume_context["Name"].clone()),
        );
        if page.next_token.is_empty() {
            break;
        }
        token = page.next_token;
    }
    assert_eq!(seen, vec!["a", "b", "c"]);

    let err = driver
        .controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 1,
            starting_token: "not-a-token".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
}

#[tokio::test]
async fn test_get_capacity_unknown_mode_makes_no_backend_call() {
    let driver = driver();
    let err = driver
        .controller
        .get_capacity(Request::new(csi::GetCapacityRequest {
            volume_capabilities: vec![capability(Mode::Unknown)],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(driver.backend.calls(), 0);
}

#[tokio::test]
async fn test_auto_probe_disabled_gates_data_operations() {
    let driver = driver_with(DriverConfig {
        auto_probe: false,
        ..config()
    });

    let err = driver
        .controller
        .create_volume(Request::new(create_request("v1", GIB)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(driver.backend.calls(), 0);

    let ready = driver
        .identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner()
        .ready;
    assert_eq!(ready, Some(true));

    create_volume(&driver, "v1", GIB).await;
}

#[tokio::test]
async fn test_snapshot_and_clone() {
    let driver = driver();
    let source = create_volume(&driver, "src", GIB).await;

    let snapshot_request = csi::CreateSnapshotRequest {
        source_volume_id: source.volume_id.clone(),
        name: "nightly".to_string(),
        ..Default::default()
    };
    let snapshot = driver
        .controller
        .create_snapshot(Request::new(snapshot_request.clone()))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    let again = driver
        .controller
        .create_snapshot(Request::new(snapshot_request))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert_eq!(snapshot.snapshot_id, again.snapshot_id);
    assert!(snapshot.creation_time.is_some());

    let mut clone = create_request("restored", GIB);
    clone.volume_content_source = Some(csi::VolumeContentSource {
        r#type: Some(csi::volume_content_source::Type::Snapshot(
            csi::volume_content_source::SnapshotSource {
                snapshot_id: snapshot.snapshot_id.clone(),
            },
        )),
    });
    driver
        .controller
        .create_volume(Request::new(clone))
        .await
        .unwrap();
    assert!(driver.backend.has_directory("/ifs/data/csi/restored"));

    let delete = csi::DeleteSnapshotRequest {
        snapshot_id: snapshot.snapshot_id,
        ..Default::default()
    };
    driver
        .controller
        .delete_snapshot(Request::new(delete.clone()))
        .await
        .unwrap();
    let err = driver
        .controller
        .delete_snapshot(Request::new(delete))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

// ============================================================================
// Fault Injection Tests
// ============================================================================

#[tokio::test]
async fn test_backend_faults_are_classified() {
    type Fault = fn(&mut onefs_csi::backend::BackendFaults);
    let faults: [(&str, Fault); 4] = [
        ("create_directory", |f| f.create_directory = true),
        ("create_quota", |f| f.create_quota = true),
        ("create_export", |f| f.create_export = true),
        ("get_export", |f| f.get_export = true),
    ];

    for (name, fault) in faults {
        let driver = driver();
        driver.session.probe().await.unwrap();
        driver.backend.inject(fault);

        let err = driver
            .controller
            .create_volume(Request::new(create_request("v1", GIB)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal, "fault {}", name);

        // A retry after the fault clears completes the volume
        driver.backend.clear_faults();
        create_volume(&driver, "v1", GIB).await;
        assert_eq!(driver.backend.export_count(), 1, "fault {}", name);
    }
}

#[tokio::test]
async fn test_mount_faults_are_classified() {
    type Fault = fn(&mut MountFaults);
    let faults: [(&str, Fault); 2] = [
        ("mount", |f| f.mount = true),
        ("get_mounts", |f| f.get_mounts = true),
    ];

    for (name, fault) in faults {
        let driver = driver();
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        driver.mounter.inject(fault);

        let err = driver
            .node
            .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
                volume_id: "v1=_=_=1=_=_=System".to_string(),
                staging_target_path: path_str(&staging),
                volume_capability: Some(capability(Mode::SingleNodeWriter)),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal, "fault {}", name);
        assert_eq!(driver.mounter.mount_count(), 0, "fault {}", name);
    }
}

// ============================================================================
// Concurrent Operation Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_same_volume() {
    let driver = driver();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let controller = driver.controller.clone();
        handles.push(tokio::spawn(async move {
            controller
                .create_volume(Request::new(create_request("contended", GIB)))
                .await
                .map(|r| r.into_inner().volume.unwrap().volume_id)
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(driver.backend.export_count(), 1);
    assert_eq!(driver.backend.quota_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_of_distinct_volumes() {
    let driver = driver();
    let mut handles = Vec::new();
    for i in 0..15 {
        let controller = driver.controller.clone();
        handles.push(tokio::spawn(async move {
            controller
                .create_volume(Request::new(create_request(&format!("vol-{}", i), GIB)))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(driver.backend.export_count(), 15);
}
