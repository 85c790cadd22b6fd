//! Mount manager: mounting devices at target paths and undoing it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::platform::{MountTools, ToolError};
use crate::types::MountSpec;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("could not create target path {path}: {source}")]
    CreateTarget {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not mount {device} at {target}: {source}")]
    Mount {
        device: String,
        target: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("could not unmount {target}: {source}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("could not inspect {target}: {source}")]
    Query {
        target: PathBuf,
        #[source]
        source: ToolError,
    },
}

#[derive(Clone)]
pub struct MountManager {
    tools: Arc<dyn MountTools>,
}

impl MountManager {
    pub fn new(tools: Arc<dyn MountTools>) -> Self {
        Self { tools }
    }

    /// Create `target` if needed and mount `device` on it.
    pub fn bind_mount(&self, device: &str, target: &Path, spec: &MountSpec) -> Result<(), MountError> {
        fs::create_dir_all(target).map_err(|e| {
            error!(error = %e, target = %target.display(), "Failed to create target path");
            MountError::CreateTarget {
                path: target.to_path_buf(),
                source: e,
            }
        })?;

        self.tools
            .mount(device, target, spec.fs_type, &spec.options)
            .map_err(|e| {
                error!(error = %e, device = %device, target = %target.display(), "Mount failed");
                MountError::Mount {
                    device: device.to_string(),
                    target: target.to_path_buf(),
                    source: e,
                }
            })?;

        info!(
            device = %device,
            target = %target.display(),
            fs_type = %spec.fs_type,
            options = ?spec.options,
            "Volume mounted"
        );
        Ok(())
    }

    /// Unmount `target` and remove the directory.
    ///
    /// A missing target, or one that is not mounted, is success.
    pub fn unbind_mount(&self, target: &Path) -> Result<(), MountError> {
        if !target.exists() {
            debug!(target = %target.display(), "Target path does not exist");
            return Ok(());
        }

        if !self.is_mount_point(target)? {
            info!(target = %target.display(), "Target path is not a mount point");
        } else {
            match self.tools.unmount(target) {
                Ok(()) => info!(target = %target.display(), "Volume unmounted"),
                Err(ToolError::NotMounted(_)) => {
                    info!(target = %target.display(), "Target was already unmounted");
                }
                Err(e) => {
                    error!(error = %e, target = %target.display(), "Unmount failed");
                    return Err(MountError::Unmount {
                        target: target.to_path_buf(),
                        source: e,
                    });
                }
            }
        }

        if let Err(e) = fs::remove_dir(target) {
            warn!(error = %e, target = %target.display(), "Could not remove target path");
        }
        Ok(())
    }

    pub fn is_mount_point(&self, target: &Path) -> Result<bool, MountError> {
        self.tools.is_mount_point(target).map_err(|e| MountError::Query {
            target: target.to_path_buf(),
            source: e,
        })
    }

    /// Whether `device` is mounted anywhere. Errors count as in use.
    pub fn is_device_in_use(&self, device: &str) -> bool {
        match self.tools.is_device_in_use(device) {
            Ok(in_use) => in_use,
            Err(e) => {
                warn!(error = %e, device = %device, "Could not determine whether device is in use, assuming it is");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakeHost;
    use crate::types::FsType;
    use tempfile::TempDir;

    fn spec() -> MountSpec {
        MountSpec {
            fs_type: FsType::Ext4,
            options: vec!["ro".to_string()],
        }
    }

    #[test]
    fn test_bind_creates_target() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let mounts = MountManager::new(host.clone());
        let target = dir.path().join("pods/x/mount");

        mounts.bind_mount("/dev/sda", &target, &spec()).unwrap();
        assert!(target.is_dir());
        let mount = host.mount_at(&target).unwrap();
        assert_eq!(mount.device, "/dev/sda");
        assert_eq!(mount.options, vec!["ro".to_string()]);
        assert!(mounts.is_mount_point(&target).unwrap());
        assert!(mounts.is_device_in_use("/dev/sda"));
    }

    #[test]
    fn test_unbind_removes_target() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let mounts = MountManager::new(host.clone());
        let target = dir.path().join("mount");

        mounts.bind_mount("/dev/sda", &target, &spec()).unwrap();
        mounts.unbind_mount(&target).unwrap();
        assert!(!target.exists());
        assert!(!host.is_mounted(&target));
        assert!(!mounts.is_device_in_use("/dev/sda"));

        // Again, with the target gone
        mounts.unbind_mount(&target).unwrap();
    }

    #[test]
    fn test_unbind_plain_directory() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let mounts = MountManager::new(host.clone());
        let target = dir.path().join("mount");
        fs::create_dir(&target).unwrap();

        mounts.unbind_mount(&target).unwrap();
        assert!(!target.exists());
        assert_eq!(host.count_calls("umount"), 0);
    }
}
