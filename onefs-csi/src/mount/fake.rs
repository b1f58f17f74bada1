//! In-memory mounter for tests.
//!
//! Keeps its own mount table and never touches the host. Bind mounts record
//! the device of the source mount, the way the kernel reports them in
//! /proc/mounts.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use super::{MountError, MountInfo, Mounter, Result};

/// Operations that should fail on the next call, with `CommandFailed`.
#[derive(Debug, Clone, Default)]
pub struct MountFaults {
    pub mount: bool,
    pub bind_mount: bool,
    pub unmount: bool,
    pub get_mounts: bool,
    pub format: bool,
    pub get_disk_format: bool,
    /// Filesystem reported by `get_disk_format` for every device
    pub disk_format: Option<String>,
}

/// Recorded mounter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeAction {
    Mount {
        source: String,
        target: PathBuf,
        fs_type: String,
    },
    BindMount {
        source: PathBuf,
        target: PathBuf,
    },
    Unmount {
        target: PathBuf,
    },
    Format {
        device: String,
        fs_type: String,
    },
}

#[derive(Debug, Default)]
struct Inner {
    mounts: Vec<MountInfo>,
    log: Vec<FakeAction>,
    faults: MountFaults,
}

#[derive(Debug, Default)]
pub struct FakeMounter {
    inner: Mutex<Inner>,
}

fn induced(command: &str) -> MountError {
    MountError::CommandFailed {
        command: command.to_string(),
        stderr: format!("induced {} error", command),
    }
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a pre-populated mount table.
    pub fn with_mounts(mounts: impl IntoIterator<Item = MountInfo>) -> Self {
        let mounter = Self::new();
        mounter.lock().mounts.extend(mounts);
        mounter
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject(&self, f: impl FnOnce(&mut MountFaults)) {
        f(&mut self.lock().faults);
    }

    pub fn clear_faults(&self) {
        self.lock().faults = MountFaults::default();
    }

    pub fn get_log(&self) -> Vec<FakeAction> {
        self.lock().log.clone()
    }

    pub fn reset_log(&self) {
        self.lock().log.clear();
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.lock().mounts.iter().any(|m| m.path == target)
    }

    pub fn mount_count(&self) -> usize {
        self.lock().mounts.len()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.faults.mount {
            return Err(induced("mount"));
        }

        inner.mounts.push(MountInfo {
            device: source.to_string(),
            path: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });
        inner.log.push(FakeAction::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
        });
        info!(source = %source, target = %target.display(), "Fake mounter: mounted");
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, options: &[String]) -> Result<()> {
        let mut inner = self.lock();
        if inner.faults.bind_mount {
            return Err(induced("bind mount"));
        }

        // Report the original device, not the bind source directory
        let (device, fs_type) = inner
            .mounts
            .iter()
            .rev()
            .find(|m| m.path == source)
            .map(|m| (m.device.clone(), m.fs_type.clone()))
            .unwrap_or_else(|| (source.to_string_lossy().into_owned(), "none".to_string()));

        let mut opts = vec!["bind".to_string()];
        opts.extend(options.iter().cloned());
        inner.mounts.push(MountInfo {
            device,
            path: target.to_path_buf(),
            fs_type,
            options: opts,
        });
        inner.log.push(FakeAction::BindMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        info!(source = %source.display(), target = %target.display(), "Fake mounter: bind mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let mut inner = self.lock();
        if inner.faults.unmount {
            return Err(induced("umount"));
        }

        let Some(index) = inner.mounts.iter().rposition(|m| m.path == target) else {
            return Err(MountError::NotMounted(target.to_path_buf()));
        };
        inner.mounts.remove(index);
        inner.log.push(FakeAction::Unmount {
            target: target.to_path_buf(),
        });
        info!(target = %target.display(), "Fake mounter: unmounted");
        Ok(())
    }

    async fn get_mounts(&self) -> Result<Vec<MountInfo>> {
        let inner = self.lock();
        if inner.faults.get_mounts {
            return Err(induced("mount table read"));
        }
        Ok(inner.mounts.clone())
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.faults.format {
            return Err(induced("mkfs"));
        }
        inner.faults.disk_format = Some(fs_type.to_string());
        inner.log.push(FakeAction::Format {
            device: device.to_string(),
            fs_type: fs_type.to_string(),
        });
        Ok(())
    }

    async fn get_disk_format(&self, _device: &str) -> Result<Option<String>> {
        let inner = self.lock();
        if inner.faults.get_disk_format {
            return Err(induced("blkid"));
        }
        Ok(inner.faults.disk_format.clone())
    }

    async fn resolve_device_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}
