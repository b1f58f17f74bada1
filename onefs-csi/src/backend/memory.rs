//! In-memory storage backend.
//!
//! Behaves like a single OneFS cluster (directories, quotas, exports and
//! snapshots scoped by access zone) without any network. Every primitive can
//! be made to fail through [`BackendFaults`], which is how the lifecycle tests
//! exercise error classification. `--backend memory` also runs the driver
//! against it for csi-sanity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use super::{
    BackendConnector, BackendError, ClusterInfo, Export, ExportPage, Quota, Result, Snapshot,
    StorageBackend, validate_quota_size,
};

/// Page size used when the caller passes a limit of zero.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Free space reported until overridden: 100 TiB.
const DEFAULT_CAPACITY: i64 = 100 * 1024 * 1024 * 1024 * 1024;

/// Failure switches for each backend primitive.
///
/// A set flag makes the matching call fail with an `Api` error (status 500)
/// without touching state. `unreachable` makes every call fail with
/// `Unavailable`, like a dropped connection.
#[derive(Debug, Clone, Default)]
pub struct BackendFaults {
    pub unreachable: bool,
    pub create_directory: bool,
    pub delete_directory: bool,
    pub copy: bool,
    pub create_quota: bool,
    pub get_quota: bool,
    pub delete_quota: bool,
    pub get_exports: bool,
    pub get_export: bool,
    pub create_export: bool,
    pub delete_export: bool,
    pub create_snapshot: bool,
    pub get_snapshot: bool,
    pub delete_snapshot: bool,
    pub capacity: bool,
}

#[derive(Debug)]
struct State {
    default_zone: String,
    directories: BTreeSet<String>,
    quotas: BTreeMap<String, Quota>,
    exports: BTreeMap<u32, Export>,
    snapshots: BTreeMap<u64, Snapshot>,
    next_export_id: u32,
    next_quota_id: u64,
    next_snapshot_id: u64,
    capacity: i64,
    faults: BackendFaults,
    calls: u64,
    mutations: u64,
}

impl State {
    /// Account for a call and fail if the cluster is unreachable.
    fn enter(&mut self, op: &str) -> Result<()> {
        self.calls += 1;
        if self.faults.unreachable {
            return Err(BackendError::Unavailable(format!(
                "connection refused during {}",
                op
            )));
        }
        Ok(())
    }

    fn export_for_path(&self, path: &str, zone: &str) -> Option<&Export> {
        self.exports
            .values()
            .find(|e| e.zone == zone && e.paths.iter().any(|p| p == path))
    }

    fn quota_for_path(&self, path: &str) -> Option<&Quota> {
        self.quotas.values().find(|q| q.path == path)
    }

    fn zone_exports(&self) -> Vec<Export> {
        self.exports
            .values()
            .filter(|e| e.zone == self.default_zone)
            .cloned()
            .collect()
    }
}

fn induced(op: &str) -> BackendError {
    BackendError::Api {
        status: 500,
        message: format!("induced {} error", op),
    }
}

fn is_within(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// In-process cluster state behind a mutex.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Create an empty cluster whose default access zone is `System`.
    pub fn new() -> Self {
        Self::with_zone("System")
    }

    /// Create an empty cluster with the given default access zone.
    pub fn with_zone(default_zone: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State {
                default_zone: default_zone.into(),
                directories: BTreeSet::new(),
                quotas: BTreeMap::new(),
                exports: BTreeMap::new(),
                snapshots: BTreeMap::new(),
                next_export_id: 1,
                next_quota_id: 1,
                next_snapshot_id: 1,
                capacity: DEFAULT_CAPACITY,
                faults: BackendFaults::default(),
                calls: 0,
                mutations: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adjust the active faults.
    pub fn inject(&self, f: impl FnOnce(&mut BackendFaults)) {
        f(&mut self.lock().faults);
    }

    /// Clear every fault.
    pub fn clear_faults(&self) {
        self.lock().faults = BackendFaults::default();
    }

    /// Override the free space reported by `available_capacity`.
    pub fn set_available_capacity(&self, bytes: i64) {
        self.lock().capacity = bytes;
    }

    /// Number of backend calls received so far.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    /// Number of calls that changed state.
    pub fn mutations(&self) -> u64 {
        self.lock().mutations
    }

    pub fn export_count(&self) -> usize {
        self.lock().exports.len()
    }

    pub fn quota_count(&self) -> usize {
        self.lock().quotas.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.lock().directories.contains(path)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn ping(&self) -> Result<ClusterInfo> {
        let mut state = self.lock();
        state.enter("ping")?;
        Ok(ClusterInfo {
            name: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("create_directory")?;
        if state.faults.create_directory {
            return Err(induced("create directory"));
        }
        if state.directories.insert(path.to_string()) {
            state.mutations += 1;
            debug!(path = %path, "memory backend: directory created");
        }
        Ok(())
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        let mut state = self.lock();
        state.enter("directory_exists")?;
        Ok(state.directories.contains(path))
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_directory")?;
        if state.faults.delete_directory {
            return Err(induced("delete directory"));
        }
        if !state.directories.contains(path) {
            return Err(BackendError::NotFound(format!("directory {}", path)));
        }
        state.directories.retain(|d| !is_within(d, path));
        state.mutations += 1;
        Ok(())
    }

    async fn copy_directory(&self, src: &str, dst: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("copy_directory")?;
        if state.faults.copy {
            return Err(induced("copy"));
        }
        if !state.directories.contains(src) {
            return Err(BackendError::NotFound(format!("directory {}", src)));
        }
        if state.directories.contains(dst) {
            return Err(BackendError::AlreadyExists(format!("directory {}", dst)));
        }
        let copied: Vec<String> = state
            .directories
            .iter()
            .filter(|d| is_within(d, src))
            .map(|d| format!("{}{}", dst, &d[src.len()..]))
            .collect();
        state.directories.extend(copied);
        state.mutations += 1;
        Ok(())
    }

    async fn copy_snapshot(&self, snapshot: &Snapshot, dst: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("copy_snapshot")?;
        if state.faults.copy {
            return Err(induced("copy"));
        }
        if !state.snapshots.contains_key(&snapshot.id) {
            return Err(BackendError::NotFound(format!("snapshot {}", snapshot.id)));
        }
        if state.directories.contains(dst) {
            return Err(BackendError::AlreadyExists(format!("directory {}", dst)));
        }
        state.directories.insert(dst.to_string());
        state.mutations += 1;
        Ok(())
    }

    async fn create_quota(
        &self,
        path: &str,
        name: &str,
        size_bytes: i64,
        enable_threshold: bool,
    ) -> Result<String> {
        validate_quota_size(size_bytes)?;
        let mut state = self.lock();
        state.enter("create_quota")?;
        if state.faults.create_quota {
            return Err(induced("create quota"));
        }
        if !state.directories.contains(path) {
            return Err(BackendError::NotFound(format!("directory {}", path)));
        }
        if state.quota_for_path(path).is_some() {
            return Err(BackendError::AlreadyExists(format!("quota on {}", path)));
        }
        let id = format!("{:016x}", state.next_quota_id);
        state.next_quota_id += 1;
        state.quotas.insert(
            id.clone(),
            Quota {
                id: id.clone(),
                path: path.to_string(),
                size_bytes,
                enforced: enable_threshold,
            },
        );
        state.mutations += 1;
        debug!(path = %path, name = %name, quota_id = %id, "memory backend: quota created");
        Ok(id)
    }

    async fn get_quota_by_path(&self, path: &str) -> Result<Quota> {
        let mut state = self.lock();
        state.enter("get_quota")?;
        if state.faults.get_quota {
            return Err(induced("get quota"));
        }
        state
            .quota_for_path(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("quota on {}", path)))
    }

    async fn delete_quota_by_export_id_with_zone(
        &self,
        name: &str,
        export_id: u32,
        zone: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_quota")?;
        if state.faults.delete_quota {
            return Err(induced("delete quota"));
        }
        let path = state
            .exports
            .get(&export_id)
            .filter(|e| e.zone == zone)
            .and_then(|e| e.path().map(str::to_string))
            .ok_or_else(|| BackendError::NotFound(format!("export {}", export_id)))?;
        let quota_id = state
            .quota_for_path(&path)
            .map(|q| q.id.clone())
            .ok_or_else(|| BackendError::NotFound(format!("quota for volume {}", name)))?;
        state.quotas.remove(&quota_id);
        state.mutations += 1;
        Ok(())
    }

    async fn get_exports(&self) -> Result<Vec<Export>> {
        let mut state = self.lock();
        state.enter("get_exports")?;
        if state.faults.get_exports {
            return Err(induced("get exports"));
        }
        Ok(state.zone_exports())
    }

    async fn get_exports_with_limit(&self, limit: u32, token: &str) -> Result<ExportPage> {
        let mut state = self.lock();
        state.enter("get_exports")?;
        if state.faults.get_exports {
            return Err(induced("get exports"));
        }
        let exports = state.zone_exports();
        let start = if token.is_empty() {
            0
        } else {
            match token.parse::<usize>() {
                Ok(n) if n > 0 && n < exports.len() => n,
                _ => return Err(BackendError::InvalidToken(token.to_string())),
            }
        };
        let limit = (if limit == 0 { DEFAULT_PAGE_SIZE } else { limit }) as usize;
        let end = exports.len().min(start + limit);
        let next_token = if end < exports.len() {
            end.to_string()
        } else {
            String::new()
        };
        Ok(ExportPage {
            exports: exports[start..end].to_vec(),
            next_token,
        })
    }

    async fn get_export_by_id_with_zone(&self, id: u32, zone: &str) -> Result<Export> {
        let mut state = self.lock();
        state.enter("get_export")?;
        if state.faults.get_export {
            return Err(induced("get export"));
        }
        state
            .exports
            .get(&id)
            .filter(|e| e.zone == zone)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("export {} in zone {}", id, zone)))
    }

    async fn get_export_by_path_with_zone(&self, path: &str, zone: &str) -> Result<Export> {
        let mut state = self.lock();
        state.enter("get_export")?;
        if state.faults.get_export {
            return Err(induced("get export"));
        }
        state
            .export_for_path(path, zone)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("export of {} in zone {}", path, zone)))
    }

    async fn create_export(&self, path: &str, zone: &str) -> Result<u32> {
        let mut state = self.lock();
        state.enter("create_export")?;
        if state.faults.create_export {
            return Err(induced("create export"));
        }
        if !state.directories.contains(path) {
            return Err(BackendError::NotFound(format!("directory {}", path)));
        }
        if state.export_for_path(path, zone).is_some() {
            return Err(BackendError::AlreadyExists(format!(
                "export of {} in zone {}",
                path, zone
            )));
        }
        let id = state.next_export_id;
        state.next_export_id += 1;
        state.exports.insert(
            id,
            Export {
                id,
                paths: vec![path.to_string()],
                zone: zone.to_string(),
            },
        );
        state.mutations += 1;
        debug!(path = %path, zone = %zone, export_id = id, "memory backend: export created");
        Ok(id)
    }

    async fn delete_export(&self, id: u32, zone: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_export")?;
        if state.faults.delete_export {
            return Err(induced("delete export"));
        }
        if !state.exports.get(&id).is_some_and(|e| e.zone == zone) {
            return Err(BackendError::NotFound(format!(
                "export {} in zone {}",
                id, zone
            )));
        }
        state.exports.remove(&id);
        state.mutations += 1;
        Ok(())
    }

    async fn create_snapshot(&self, path: &str, name: &str) -> Result<Snapshot> {
        let mut state = self.lock();
        state.enter("create_snapshot")?;
        if state.faults.create_snapshot {
            return Err(induced("create snapshot"));
        }
        if !state.directories.contains(path) {
            return Err(BackendError::NotFound(format!("directory {}", path)));
        }
        if state.snapshots.values().any(|s| s.name == name) {
            return Err(BackendError::AlreadyExists(format!("snapshot {}", name)));
        }
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let snapshot = Snapshot {
            id: state.next_snapshot_id,
            name: name.to_string(),
            path: path.to_string(),
            size_bytes: 0,
            created,
        };
        state.next_snapshot_id += 1;
        state.snapshots.insert(snapshot.id, snapshot.clone());
        state.mutations += 1;
        Ok(snapshot)
    }

    async fn get_snapshot(&self, id: u64) -> Result<Snapshot> {
        let mut state = self.lock();
        state.enter("get_snapshot")?;
        if state.faults.get_snapshot {
            return Err(induced("get snapshot"));
        }
        state
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("snapshot {}", id)))
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot> {
        let mut state = self.lock();
        state.enter("get_snapshot")?;
        if state.faults.get_snapshot {
            return Err(induced("get snapshot"));
        }
        state
            .snapshots
            .values()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("snapshot {}", name)))
    }

    async fn delete_snapshot(&self, id: u64) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_snapshot")?;
        if state.faults.delete_snapshot {
            return Err(induced("delete snapshot"));
        }
        if state.snapshots.remove(&id).is_none() {
            return Err(BackendError::NotFound(format!("snapshot {}", id)));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn available_capacity(&self) -> Result<i64> {
        let mut state = self.lock();
        state.enter("available_capacity")?;
        if state.faults.capacity {
            return Err(induced("statistics"));
        }
        Ok(state.capacity)
    }
}

/// Hands out a shared [`MemoryBackend`], failing while it is unreachable.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn StorageBackend>> {
        self.backend.ping().await?;
        Ok(self.backend.clone())
    }
}
