//! Local mount utility used by the Node service.
//!
//! [`Mounter`] is the seam between the node lifecycle logic and the host:
//! [`LinuxMounter`] shells out to mount(8)/umount(8) and reads /proc/mounts,
//! while [`FakeMounter`] keeps an in-memory mount table with injectable
//! failures for tests.
//!
//! Every failure maps to a distinct [`MountError`] variant so callers can tell
//! "already unmounted" apart from a real I/O error.

pub mod fake;
pub mod linux;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use fake::{FakeAction, FakeMounter, MountFaults};
pub use linux::LinuxMounter;

/// Mount utility failures.
#[derive(Error, Debug)]
pub enum MountError {
    /// The target is not a mount point. Idempotent callers treat this as done.
    #[error("{0} is not mounted")]
    NotMounted(PathBuf),

    #[error("path {0} does not exist")]
    PathNotFound(PathBuf),

    #[error("{0} is busy")]
    Busy(PathBuf),

    #[error("unsupported filesystem type '{0}'")]
    UnsupportedFsType(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MountError>;

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Mounted source: a device, `host:/path` for NFS, or the original source
    /// of a bind mount
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountInfo {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Host mount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target` with the given filesystem type and options.
    async fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String])
    -> Result<()>;

    /// Bind-mount `source` on `target`. An `ro` option yields a read-only bind.
    async fn bind_mount(&self, source: &Path, target: &Path, options: &[String]) -> Result<()>;

    /// Unmount `target`; `NotMounted` if nothing is mounted there.
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Current mount table.
    async fn get_mounts(&self) -> Result<Vec<MountInfo>>;

    /// Create a filesystem on a block device.
    async fn format(&self, device: &str, fs_type: &str) -> Result<()>;

    /// Filesystem type present on a device, `None` when unformatted.
    async fn get_disk_format(&self, device: &str) -> Result<Option<String>>;

    /// Resolve a device path through symlinks (e.g. /dev/disk/by-id/...).
    async fn resolve_device_path(&self, path: &Path) -> Result<PathBuf>;
}

/// Mount entry for `path`, if any.
pub async fn find_mount(mounter: &dyn Mounter, path: &Path) -> Result<Option<MountInfo>> {
    Ok(mounter
        .get_mounts()
        .await?
        .into_iter()
        .rev()
        .find(|m| m.path == path))
}

/// Decode the octal escapes used in /proc/mounts (`\040` for space etc.).
pub(crate) fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse /proc/mounts content.
pub(crate) fn parse_mount_table(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountInfo {
                device: unescape_mount_field(device),
                path: PathBuf::from(unescape_mount_field(path)),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount_table() {
        let content = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
10.0.0.5:/ifs/data/csi/v1 /var/lib/kubelet/pods/x/volumes/mount nfs rw,relatime,vers=3 0 0
10.0.0.5:/ifs/data/csi/v2 /mnt/with\\040space nfs ro,relatime 0 0
";
        let mounts = parse_mount_table(content);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].device, "10.0.0.5:/ifs/data/csi/v1");
        assert_eq!(mounts[1].fs_type, "nfs");
        assert!(!mounts[1].is_read_only());
        assert_eq!(mounts[2].path, PathBuf::from("/mnt/with space"));
        assert!(mounts[2].is_read_only());
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/plain/path"), "/plain/path");
        assert_eq!(unescape_mount_field("/a\\040b"), "/a b");
        assert_eq!(unescape_mount_field("/tab\\011x"), "/tab\tx");
        assert_eq!(unescape_mount_field("trailing\\"), "trailing\\");
        assert_eq!(unescape_mount_field("bad\\9zz"), "bad\\9zz");
    }

    #[tokio::test]
    async fn test_find_mount_prefers_latest_entry() {
        let mounter = FakeMounter::new();
        mounter
            .mount("host:/a", Path::new("/mnt/t"), "nfs", &[])
            .await
            .unwrap();
        assert!(find_mount(&mounter, Path::new("/mnt/t")).await.unwrap().is_some());
        assert!(find_mount(&mounter, Path::new("/mnt/other")).await.unwrap().is_none());
    }
}
