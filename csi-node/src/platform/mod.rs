//! Capability interfaces over the host's iSCSI, filesystem and mount tooling.
//!
//! The lifecycle code only talks to the traits defined here. The Linux
//! implementation backs them with external commands and sysfs. With the
//! `test-util` feature, `fake` keeps everything in memory so the lifecycle can
//! be exercised without devices.
//!
//! # Usage
//!
//! ```ignore
//! use csi_node::platform::{IscsiLogging, Tools};
//!
//! let tools = Tools::linux(IscsiLogging { verbose: false });
//! let attachment = tools.sessions.login("iqn.2015-11.com.example:tgt", &portals, 3)?;
//! ```

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod linux;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::connector::ConnectorRecord;
use crate::types::FsType;

pub use linux::{IscsiLogging, LinuxFilesystems, LinuxMounts, LinuxSessions};

/// Directory of udev's persistent iSCSI path links.
pub const BY_PATH_DIR: &str = "/dev/disk/by-path";

/// Name of the link udev creates under [`BY_PATH_DIR`] for one portal and LUN.
pub fn by_path_name(portal: &str, target_iqn: &str, lun: u16) -> String {
    format!("ip-{}-iscsi-{}-lun-{}", portal, target_iqn, lun)
}

/// Failure of an external tool or of a sysfs access.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit; `output` is the tool's combined stdout/stderr.
    #[error("{tool} failed: {output}")]
    Failed { tool: String, output: String },

    #[error("{0}")]
    NotFound(String),

    /// The path given to unmount is not mounted.
    #[error("{0} is not mounted")]
    NotMounted(String),

    /// No session exists for the target any more.
    #[error("no active session for {0}")]
    NoSession(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A local block device produced by logging into an iSCSI target.
///
/// Device names are only valid until the next restart of the host. `links`
/// and `wwid` identify the LUN itself and are what the names are resolved
/// from again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Device to format and mount (the multipath map when there is one)
    pub device_path: String,
    /// Underlying per-portal SCSI devices
    pub devices: Vec<String>,
    /// by-path link of each entry of `devices`
    pub links: Vec<String>,
    /// SCSI WWID of the LUN, when the host exposes one
    pub wwid: Option<String>,
    pub multipath: bool,
    /// Device-mapper name of the multipath map
    pub multipath_map: Option<String>,
}

impl Attachment {
    /// Every device node that belongs to the attachment, map first.
    pub fn all_devices(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.device_path.as_str()).chain(
            self.devices
                .iter()
                .map(String::as_str)
                .filter(move |d| *d != self.device_path),
        )
    }
}

/// The host's current device naming.
pub(crate) trait DeviceNaming {
    fn by_path_dir(&self) -> &Path;

    /// Device node a link points to, if the link exists.
    fn follow_link(&self, link: &Path) -> Option<String>;

    fn wwid(&self, device: &str) -> Option<String>;

    /// Multipath map holding `device`, as (device node, map name).
    fn multipath_holder(&self, device: &str) -> Option<(String, String)>;
}

/// Find the current devices of `record` from its by-path links and WWID.
///
/// Recorded kernel names are never trusted: each link is followed again, and
/// the device behind it is only accepted when it carries the recorded WWID.
/// Records without links fall back to the links their portals imply.
pub(crate) fn resolve_attachment<N>(naming: &N, record: &ConnectorRecord) -> Option<Attachment>
where
    N: DeviceNaming + ?Sized,
{
    let links: Vec<PathBuf> = if record.links.is_empty() {
        record
            .portals
            .iter()
            .map(|portal| {
                naming
                    .by_path_dir()
                    .join(by_path_name(portal, &record.target_iqn, record.lun))
            })
            .collect()
    } else {
        record.links.iter().map(PathBuf::from).collect()
    };

    let mut devices = Vec::new();
    let mut found_links = Vec::new();
    for link in links {
        let Some(device) = naming.follow_link(&link) else {
            debug!(link = %link.display(), "Recorded path is not present");
            continue;
        };

        if let Some(expected) = &record.wwid {
            let found = naming.wwid(&device);
            if found.as_ref() != Some(expected) {
                warn!(
                    link = %link.display(),
                    device = %device,
                    expected = %expected,
                    found = ?found,
                    "Device does not carry the recorded WWID, ignoring it"
                );
                continue;
            }
        }

        devices.push(device);
        found_links.push(link.to_string_lossy().into_owned());
    }

    let first = devices.first()?.clone();
    let holder = devices.iter().find_map(|d| naming.multipath_holder(d));
    match holder {
        Some((device_path, map)) => Some(Attachment {
            device_path,
            devices,
            links: found_links,
            wwid: record.wwid.clone(),
            multipath: true,
            multipath_map: Some(map),
        }),
        None if record.multipath => {
            warn!(
                target_iqn = %record.target_iqn,
                lun = record.lun,
                "Multipath map of the recorded paths is gone"
            );
            None
        }
        None => Some(Attachment {
            device_path: first,
            devices,
            links: found_links,
            wwid: record.wwid.clone(),
            multipath: false,
            multipath_map: None,
        }),
    }
}

/// iSCSI session capability.
pub trait SessionTools: Send + Sync {
    /// Discover and log in to `target_iqn` through every portal and return
    /// the resulting local device for `lun`.
    fn login(&self, target_iqn: &str, portals: &[String], lun: u16)
    -> Result<Attachment, ToolError>;

    /// The attachment `record` describes, under the names the host uses now.
    ///
    /// Returns `None` when the recorded LUN is not present any more.
    fn resolve(&self, record: &ConnectorRecord) -> Option<Attachment>;

    /// Ask the kernel to re-read the size of one SCSI device.
    fn rescan_device(&self, device: &str) -> Result<(), ToolError>;

    /// Propagate a size change of the underlying paths to a multipath map.
    fn resize_multipath(&self, map: &str) -> Result<(), ToolError>;

    /// Flush, delete and log out of everything `record` describes.
    ///
    /// Only devices that still resolve to the recorded LUN are removed.
    ///
    /// Returns [`ToolError::NoSession`] when nothing was left to tear down.
    fn logout(&self, record: &ConnectorRecord) -> Result<(), ToolError>;
}

/// Filesystem capability.
pub trait FilesystemTools: Send + Sync {
    /// Look a device over for filesystem and partition table signatures.
    ///
    /// Returns the tool's `KEY=value` output, or `None` when the device
    /// carries no recognizable signature.
    fn read_signatures(&self, device: &str) -> Result<Option<String>, ToolError>;

    fn make_filesystem(&self, fs_type: FsType, device: &str) -> Result<(), ToolError>;

    /// Read-only consistency check. Any non-clean result is an error.
    fn check_filesystem(&self, fs_type: FsType, device: &str) -> Result<(), ToolError>;

    /// Grow the filesystem to the size of its device. XFS grows through
    /// `mount_path`, ext filesystems through `device`.
    fn grow_filesystem(
        &self,
        fs_type: FsType,
        device: &str,
        mount_path: &Path,
    ) -> Result<(), ToolError>;
}

/// Mount table capability.
pub trait MountTools: Send + Sync {
    fn mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: FsType,
        options: &[String],
    ) -> Result<(), ToolError>;

    /// Returns [`ToolError::NotMounted`] when `target` was not mounted.
    fn unmount(&self, target: &Path) -> Result<(), ToolError>;

    fn is_mount_point(&self, target: &Path) -> Result<bool, ToolError>;

    /// Whether `device` is mounted anywhere on the host.
    fn is_device_in_use(&self, device: &str) -> Result<bool, ToolError>;
}

/// The set of capabilities the lifecycle controller is built from.
#[derive(Clone)]
pub struct Tools {
    pub sessions: Arc<dyn SessionTools>,
    pub filesystems: Arc<dyn FilesystemTools>,
    pub mounts: Arc<dyn MountTools>,
}

impl Tools {
    /// Capabilities backed by the host's tools.
    pub fn linux(logging: IscsiLogging) -> Self {
        Self {
            sessions: Arc::new(LinuxSessions::new(logging)),
            filesystems: Arc::new(LinuxFilesystems::new()),
            mounts: Arc::new(LinuxMounts::new()),
        }
    }

    /// All three capabilities served by one shared host implementation.
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: SessionTools + FilesystemTools + MountTools + 'static,
    {
        Self {
            sessions: host.clone(),
            filesystems: host.clone(),
            mounts: host,
        }
    }
}
