//! Linux mounter
//!
//! Uses the standard userland tools:
//! - mount / umount for NFS mounts and bind mounts
//! - /proc/mounts for the mount table
//! - blkid to detect an existing filesystem
//! - mkfs.ext4 / mkfs.xfs for formatting

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{MountError, MountInfo, Mounter, Result, find_mount, parse_mount_table};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Map a failed command's stderr onto a [`MountError`] category.
fn classify_failure(command: &str, target: &Path, stderr: &str) -> MountError {
    let lower = stderr.to_lowercase();
    if lower.contains("not mounted") || lower.contains("no mount point") {
        MountError::NotMounted(target.to_path_buf())
    } else if lower.contains("busy") {
        MountError::Busy(target.to_path_buf())
    } else if lower.contains("no such file or directory") || lower.contains("does not exist") {
        MountError::PathNotFound(target.to_path_buf())
    } else {
        MountError::CommandFailed {
            command: command.to_string(),
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Validate filesystem type for formatting.
fn validate_fs_type(fs_type: &str) -> Result<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "ext4" | "" => Ok("ext4"),
        "xfs" => Ok("xfs"),
        _ => Err(MountError::UnsupportedFsType(fs_type.to_string())),
    }
}

/// Mounter backed by the host's mount tools.
#[derive(Debug, Clone)]
pub struct LinuxMounter {
    mounts_file: PathBuf,
}

impl LinuxMounter {
    pub fn new() -> Self {
        Self {
            mounts_file: PathBuf::from(PROC_MOUNTS),
        }
    }

    async fn run(&self, command: &str, args: &[&str], target: &Path) -> Result<String> {
        let output = Command::new(command).args(args).output().await.map_err(|e| {
            error!(error = %e, command = %command, "Failed to execute command");
            MountError::Io(e)
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(command = %command, args = ?args, stderr = %stderr, "Command failed");
            return Err(classify_failure(command, target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for LinuxMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        info!(source = %source, target = %target.display(), fs_type = %fs_type, "Mounting");

        let target_str = target.to_string_lossy();
        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, &*target_str]);

        self.run("mount", &args, target).await?;
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, options: &[String]) -> Result<()> {
        info!(source = %source.display(), target = %target.display(), "Creating bind mount");

        let source_str = source.to_string_lossy();
        let target_str = target.to_string_lossy();
        self.run(
            "mount",
            &["--bind", &*source_str, &*target_str],
            target,
        )
        .await?;

        // The read-only flag is ignored on the initial bind; it needs a remount.
        if options.iter().any(|o| o == "ro") {
            debug!(target = %target.display(), "Remounting bind mount read-only");
            if let Err(e) = self
                .run(
                    "mount",
                    &["-o", "remount,bind,ro", &*target_str],
                    target,
                )
                .await
            {
                warn!(target = %target.display(), error = %e, "Read-only remount failed, undoing bind");
                if let Err(cleanup) = self.run("umount", &[&*target_str], target).await {
                    warn!(
                        target = %target.display(),
                        error = %cleanup,
                        "Could not undo bind mount; target is left mounted read-write"
                    );
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        info!(target = %target.display(), "Unmounting");

        if find_mount(self, target).await?.is_none() {
            debug!(target = %target.display(), "Path is not mounted");
            return Err(MountError::NotMounted(target.to_path_buf()));
        }

        let target_str = target.to_string_lossy();
        self.run("umount", &[&*target_str], target).await?;
        Ok(())
    }

    async fn get_mounts(&self) -> Result<Vec<MountInfo>> {
        let content = tokio::fs::read_to_string(&self.mounts_file).await?;
        Ok(parse_mount_table(&content))
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let fs_type = validate_fs_type(fs_type)?;
        info!(device = %device, fs_type = %fs_type, "Formatting device");

        let device_path = Path::new(device);
        match fs_type {
            "xfs" => self.run("mkfs.xfs", &["-f", device], device_path).await?,
            _ => self.run("mkfs.ext4", &["-F", device], device_path).await?,
        };
        Ok(())
    }

    async fn get_disk_format(&self, device: &str) -> Result<Option<String>> {
        let output = Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-o", "value", device])
            .output()
            .await?;

        // blkid exits 2 when no filesystem signature is found
        if output.status.code() == Some(2) {
            return Ok(None);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("blkid", Path::new(device), &stderr));
        }

        let fs_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!fs_type.is_empty()).then_some(fs_type))
    }

    async fn resolve_device_path(&self, path: &Path) -> Result<PathBuf> {
        match tokio::fs::canonicalize(path).await {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MountError::PathNotFound(path.to_path_buf()))
            }
            Err(e) => Err(MountError::Io(e)),
        }
    }
}
