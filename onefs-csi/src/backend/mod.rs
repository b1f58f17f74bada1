//! Quota/export backend adapter.
//!
//! The lifecycle managers only talk to the cluster through [`StorageBackend`].
//! Every method re-reads remote state; adapters must not cache existence
//! across calls because the cluster is the source of truth.
//!
//! Two adapters ship with the crate:
//! - [`onefs::OneFsClient`] talks to the OneFS platform API over HTTPS
//! - [`memory::MemoryBackend`] keeps state in process and supports fault
//!   injection for tests and csi-sanity runs

pub mod memory;
pub mod onefs;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{BackendFaults, MemoryBackend, MemoryConnector};
pub use onefs::{OneFsClient, OneFsConnector};

/// Errors surfaced by backend adapters.
///
/// `NotFound` is always distinguishable from other failures so that idempotent
/// operations can swallow it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid pagination token '{0}'")]
    InvalidToken(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    /// Transport-level failure; the cached connection should be dropped.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Reject negative quota sizes before any remote call is made.
pub fn validate_quota_size(size_bytes: i64) -> Result<()> {
    if size_bytes < 0 {
        return Err(BackendError::InvalidArgument(format!(
            "quota size must be non-negative, got {}",
            size_bytes
        )));
    }
    Ok(())
}

/// Basic identity of the cluster, returned by [`StorageBackend::ping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub version: String,
}

/// An NFS export rooted at one or more paths inside an access zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub id: u32,
    pub paths: Vec<String>,
    pub zone: String,
}

impl Export {
    /// First exported path; volumes always export exactly one.
    pub fn path(&self) -> Option<&str> {
        self.paths.first().map(String::as_str)
    }
}

/// One page of exports plus the token to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportPage {
    pub exports: Vec<Export>,
    /// Empty when there are no more results.
    pub next_token: String,
}

/// A directory quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub id: String,
    pub path: String,
    pub size_bytes: i64,
    /// Hard threshold enforced (as opposed to accounting only)
    pub enforced: bool,
}

/// A point-in-time snapshot of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    /// Creation time in seconds since the Unix epoch
    pub created: i64,
}

/// Operations the lifecycle managers need from the storage cluster.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Cheap authenticated round trip used by the probe supervisor.
    async fn ping(&self) -> Result<ClusterInfo>;

    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn directory_exists(&self, path: &str) -> Result<bool>;

    /// Recursively remove a directory. Missing directories are `NotFound`.
    async fn delete_directory(&self, path: &str) -> Result<()>;

    /// Copy the tree at `src` into a new directory `dst`.
    async fn copy_directory(&self, src: &str, dst: &str) -> Result<()>;

    /// Copy the snapshotted state of `snapshot.path` into a new directory `dst`.
    async fn copy_snapshot(&self, snapshot: &Snapshot, dst: &str) -> Result<()>;

    /// Create a directory quota and return its id.
    ///
    /// A negative `size_bytes` fails with `InvalidArgument` before any
    /// mutation is attempted.
    async fn create_quota(
        &self,
        path: &str,
        name: &str,
        size_bytes: i64,
        enable_threshold: bool,
    ) -> Result<String>;

    async fn get_quota_by_path(&self, path: &str) -> Result<Quota>;

    /// Remove the quota on the path exported by `export_id`.
    async fn delete_quota_by_export_id_with_zone(
        &self,
        name: &str,
        export_id: u32,
        zone: &str,
    ) -> Result<()>;

    /// All exports in the default zone.
    async fn get_exports(&self) -> Result<Vec<Export>>;

    /// A page of at most `limit` exports (0 means the backend default),
    /// resuming from `token` when it is non-empty.
    async fn get_exports_with_limit(&self, limit: u32, token: &str) -> Result<ExportPage>;

    async fn get_export_by_id_with_zone(&self, id: u32, zone: &str) -> Result<Export>;

    async fn get_export_by_path_with_zone(&self, path: &str, zone: &str) -> Result<Export>;

    /// Export `path` in `zone` and return the new export id.
    async fn create_export(&self, path: &str, zone: &str) -> Result<u32>;

    async fn delete_export(&self, id: u32, zone: &str) -> Result<()>;

    async fn create_snapshot(&self, path: &str, name: &str) -> Result<Snapshot>;

    async fn get_snapshot(&self, id: u64) -> Result<Snapshot>;

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot>;

    async fn delete_snapshot(&self, id: u64) -> Result<()>;

    /// Free space on the cluster in bytes, as reported by the backend.
    async fn available_capacity(&self) -> Result<i64>;
}

/// Produces a connected backend; used by the probe supervisor to (re)connect.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StorageBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_quota_size() {
        assert!(validate_quota_size(0).is_ok());
        assert!(validate_quota_size(8 * 1024 * 1024 * 1024).is_ok());
        assert!(matches!(
            validate_quota_size(-1),
            Err(BackendError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(BackendError::NotFound("export 1".into()).is_not_found());
        assert!(!BackendError::Unavailable("refused".into()).is_not_found());
        assert!(BackendError::Unavailable("refused".into()).is_unavailable());
        assert_eq!(
            BackendError::NotFound("export 19".into()).to_string(),
            "export 19 not found"
        );
    }

    #[test]
    fn test_export_path() {
        let export = Export {
            id: 1,
            paths: vec!["/ifs/data/csi/v1".into()],
            zone: "System".into(),
        };
        assert_eq!(export.path(), Some("/ifs/data/csi/v1"));

        let empty = Export {
            id: 2,
            paths: vec![],
            zone: "System".into(),
        };
        assert_eq!(empty.path(), None);
    }
}
