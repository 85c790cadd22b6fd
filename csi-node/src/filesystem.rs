//! Filesystem reconciler: detect, create, check and grow filesystems.
//!
//! Formatting is never destructive. A device that already carries a
//! filesystem of a different type, or a partition table, is reported as a
//! conflict and left untouched.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::platform::{FilesystemTools, ToolError};
use crate::types::FsType;

/// `KEY=value` or `KEY="value"` lines of `blkid --output export`.
static BLKID_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Z]+)="?([^"\n]+)"?"#).expect("Invalid blkid output pattern")
});

/// Signatures blkid found on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedFormat {
    /// No recognizable signature
    Unformatted,
    Filesystem(String),
    PartitionTable(String),
}

/// Parse blkid output. A partition table wins over a filesystem signature.
pub fn parse_blkid_output(output: &str) -> DetectedFormat {
    let mut fs_type = None;
    let mut pt_type = None;

    for caps in BLKID_LINE.captures_iter(output) {
        let value = caps[2].trim().to_string();
        match &caps[1] {
            "TYPE" => fs_type = Some(value),
            "PTTYPE" => pt_type = Some(value),
            _ => {}
        }
    }

    match (pt_type, fs_type) {
        (Some(pt), _) => DetectedFormat::PartitionTable(pt),
        (None, Some(fs)) => DetectedFormat::Filesystem(fs),
        (None, None) => DetectedFormat::Unformatted,
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("could not read signatures of {device}: {source}")]
    Signatures {
        device: String,
        #[source]
        source: ToolError,
    },

    #[error("{device} already contains a {found} filesystem, refusing to format it as {requested}")]
    Conflict {
        requested: FsType,
        found: String,
        device: String,
    },

    #[error("{device} contains a {pt_type} partition table, refusing to format it")]
    PartitionTable { device: String, pt_type: String },

    #[error("could not create filesystem on {device}: {source}")]
    Format {
        device: String,
        #[source]
        source: ToolError,
    },

    #[error("{device}: {source}")]
    Corrupted {
        device: String,
        #[source]
        source: ToolError,
    },

    #[error("could not grow filesystem on {device}: {source}")]
    Grow {
        device: String,
        #[source]
        source: ToolError,
    },
}

/// Brings a device's filesystem into the requested shape.
#[derive(Clone)]
pub struct FilesystemReconciler {
    tools: Arc<dyn FilesystemTools>,
}

impl FilesystemReconciler {
    pub fn new(tools: Arc<dyn FilesystemTools>) -> Self {
        Self { tools }
    }

    /// Read the signatures of `device` without modifying it.
    pub fn detect_format(&self, device: &str) -> Result<DetectedFormat, FsError> {
        let output = self.tools.read_signatures(device).map_err(|e| {
            error!(error = %e, device = %device, "Failed to read device signatures");
            FsError::Signatures {
                device: device.to_string(),
                source: e,
            }
        })?;

        let detected = output
            .as_deref()
            .map(parse_blkid_output)
            .unwrap_or(DetectedFormat::Unformatted);
        debug!(device = %device, format = ?detected, "Detected device format");
        Ok(detected)
    }

    /// Create a `requested` filesystem on `device` unless one is already there.
    ///
    /// Returns whether a filesystem was created.
    pub fn ensure_format(&self, requested: FsType, device: &str) -> Result<bool, FsError> {
        match self.detect_format(device)? {
            DetectedFormat::Unformatted => {
                info!(device = %device, fs_type = %requested, "Device is unformatted, creating filesystem");
                self.tools
                    .make_filesystem(requested, device)
                    .map_err(|e| {
                        error!(error = %e, device = %device, "Failed to create filesystem");
                        FsError::Format {
                            device: device.to_string(),
                            source: e,
                        }
                    })?;
                Ok(true)
            }
            DetectedFormat::Filesystem(found) if found == requested.as_str() => {
                debug!(device = %device, fs_type = %found, "Device already formatted");
                Ok(false)
            }
            DetectedFormat::Filesystem(found) => {
                warn!(
                    device = %device,
                    requested = %requested,
                    found = %found,
                    "Filesystem type mismatch"
                );
                Err(FsError::Conflict {
                    requested,
                    found,
                    device: device.to_string(),
                })
            }
            DetectedFormat::PartitionTable(pt_type) => {
                warn!(device = %device, pt_type = %pt_type, "Device is partitioned");
                Err(FsError::PartitionTable {
                    device: device.to_string(),
                    pt_type,
                })
            }
        }
    }

    /// Read-only consistency check of whatever filesystem `device` carries.
    ///
    /// Unformatted devices and filesystems this agent does not manage are
    /// skipped.
    pub fn check_consistency(&self, device: &str) -> Result<(), FsError> {
        let fs_type = match self.detect_format(device)? {
            DetectedFormat::Filesystem(found) => match found.parse::<FsType>() {
                Ok(fs_type) => fs_type,
                Err(_) => {
                    info!(device = %device, fs_type = %found, "No checker for filesystem, skipping check");
                    return Ok(());
                }
            },
            other => {
                debug!(device = %device, format = ?other, "No filesystem to check");
                return Ok(());
            }
        };

        self.tools.check_filesystem(fs_type, device).map_err(|e| {
            error!(error = %e, device = %device, "Filesystem consistency check failed");
            FsError::Corrupted {
                device: device.to_string(),
                source: e,
            }
        })?;

        debug!(device = %device, fs_type = %fs_type, "Filesystem is clean");
        Ok(())
    }

    /// Grow the filesystem on `device` to fill it.
    ///
    /// The type found on the device takes precedence over `recorded`.
    pub fn grow(&self, recorded: FsType, device: &str, mount_path: &Path) -> Result<(), FsError> {
        let fs_type = match self.detect_format(device)? {
            DetectedFormat::Filesystem(found) => found.parse::<FsType>().unwrap_or(recorded),
            _ => recorded,
        };

        self.tools
            .grow_filesystem(fs_type, device, mount_path)
            .map_err(|e| {
                error!(error = %e, device = %device, "Failed to grow filesystem");
                FsError::Grow {
                    device: device.to_string(),
                    source: e,
                }
            })?;

        info!(device = %device, fs_type = %fs_type, "Filesystem expanded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{FakeHost, Signature};

    fn reconciler() -> (Arc<FakeHost>, FilesystemReconciler) {
        let host = Arc::new(FakeHost::new());
        (host.clone(), FilesystemReconciler::new(host))
    }

    #[test]
    fn test_parse_blkid_output() {
        assert_eq!(
            parse_blkid_output("DEVNAME=/dev/sda\nTYPE=ext4\n"),
            DetectedFormat::Filesystem("ext4".into())
        );
        assert_eq!(
            parse_blkid_output("DEVNAME=/dev/sda\nTYPE=\"xfs\"\n"),
            DetectedFormat::Filesystem("xfs".into())
        );
        assert_eq!(
            parse_blkid_output("DEVNAME=/dev/sda\nPTTYPE=\"gpt\"\n"),
            DetectedFormat::PartitionTable("gpt".into())
        );
        assert_eq!(parse_blkid_output(""), DetectedFormat::Unformatted);
    }

    #[test]
    fn test_parse_blkid_output_partition_table_wins() {
        assert_eq!(
            parse_blkid_output("PTTYPE=dos\nTYPE=ext4\n"),
            DetectedFormat::PartitionTable("dos".into())
        );
    }

    #[test]
    fn test_ensure_format_creates_filesystem() {
        let (host, fs) = reconciler();
        assert!(fs.ensure_format(FsType::Ext4, "/dev/sda").unwrap());
        assert_eq!(host.count_calls("mkfs.ext4 /dev/sda"), 1);

        // Second time around the filesystem is found and kept
        assert!(!fs.ensure_format(FsType::Ext4, "/dev/sda").unwrap());
        assert_eq!(host.count_calls("mkfs"), 1);
    }

    #[test]
    fn test_ensure_format_conflict_is_not_destructive() {
        let (host, fs) = reconciler();
        host.format_device("/dev/sda", "xfs");

        let err = fs.ensure_format(FsType::Ext4, "/dev/sda").unwrap_err();
        assert!(matches!(err, FsError::Conflict { ref found, .. } if found == "xfs"));
        assert_eq!(host.count_calls("mkfs"), 0);
        assert_eq!(
            host.signature("/dev/sda"),
            Some(Signature::Filesystem("xfs".into()))
        );
    }

    #[test]
    fn test_ensure_format_partition_table() {
        let (host, fs) = reconciler();
        host.set_signature("/dev/sda", Signature::PartitionTable("gpt".into()));

        let err = fs.ensure_format(FsType::Ext4, "/dev/sda").unwrap_err();
        assert!(matches!(err, FsError::PartitionTable { .. }));
        assert_eq!(host.count_calls("mkfs"), 0);
    }

    #[test]
    fn test_check_consistency() {
        let (host, fs) = reconciler();

        // Nothing to check on a blank device
        fs.check_consistency("/dev/sda").unwrap();
        assert_eq!(host.count_calls("fsck"), 0);

        host.format_device("/dev/sda", "ext4");
        fs.check_consistency("/dev/sda").unwrap();
        assert_eq!(host.count_calls("fsck.ext4 /dev/sda"), 1);

        host.mark_corrupt("/dev/sda");
        let err = fs.check_consistency("/dev/sda").unwrap_err();
        assert!(matches!(err, FsError::Corrupted { .. }));
    }

    #[test]
    fn test_check_consistency_skips_unknown_filesystem() {
        let (host, fs) = reconciler();
        host.format_device("/dev/sda", "btrfs");
        fs.check_consistency("/dev/sda").unwrap();
        assert_eq!(host.count_calls("fsck"), 0);
    }

    #[test]
    fn test_grow_uses_detected_type() {
        let (host, fs) = reconciler();
        host.format_device("/dev/sda", "xfs");
        fs.grow(FsType::Ext4, "/dev/sda", Path::new("/mnt/vol"))
            .unwrap();
        assert_eq!(host.count_calls("grow.xfs /mnt/vol"), 1);

        fs.grow(FsType::Ext4, "/dev/sdb", Path::new("/mnt/other"))
            .unwrap();
        assert_eq!(host.count_calls("grow.ext4 /dev/sdb"), 1);
    }
}
