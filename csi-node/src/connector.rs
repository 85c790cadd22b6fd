//! Connector record persistence.
//!
//! One JSON file per volume (`<state-dir>/iscsi-<volume>.json`) describes the
//! session and devices of an attachment, so that unpublish and expand can find
//! them again after a restart. Kernel device names are kept for diagnostics
//! only; the devices are found again through the recorded by-path links and
//! WWID. The file exists if and only if the volume is believed to be attached
//! on this node.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::platform::Attachment;
use crate::types::{FsType, IscsiTarget, VolumeId};

/// Current on-disk format version. Version 2 added `links` and `wwid`.
pub const RECORD_VERSION: u32 = 2;

const RECORD_PREFIX: &str = "iscsi-";
const RECORD_EXTENSION: &str = "json";

/// Everything needed to reverse an attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    pub volume_id: String,
    pub target_iqn: String,
    /// Portals as "host:port"
    pub portals: Vec<String>,
    pub lun: u16,
    /// Device that was formatted and mounted
    pub device_path: String,
    /// Underlying per-portal SCSI devices
    #[serde(default)]
    pub devices: Vec<String>,
    /// by-path link of each path
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwid: Option<String>,
    #[serde(default)]
    pub multipath: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_map: Option<String>,
    #[serde(default)]
    pub fs_type: FsType,
    /// Target path of the publish that created the record
    #[serde(default)]
    pub target_path: PathBuf,
}

// Records without a version field predate versioning
fn default_version() -> u32 {
    1
}

impl ConnectorRecord {
    pub fn new(
        volume_id: &VolumeId,
        target: &IscsiTarget,
        attachment: &Attachment,
        fs_type: FsType,
        target_path: &Path,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            volume_id: volume_id.as_str().to_string(),
            target_iqn: target.iqn.clone(),
            portals: target.portals.portal_strings(),
            lun: target.lun,
            device_path: attachment.device_path.clone(),
            devices: attachment.devices.clone(),
            links: attachment.links.clone(),
            wwid: attachment.wwid.clone(),
            multipath: attachment.multipath,
            multipath_map: attachment.multipath_map.clone(),
            fs_type,
            target_path: target_path.to_path_buf(),
        }
    }

    /// Whether the record was written for the same target and LUN.
    pub fn matches(&self, target: &IscsiTarget) -> bool {
        self.target_iqn == target.iqn && self.lun == target.lun
    }
}

/// Error type for connector store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("connector record {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode connector record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File-backed, per-volume keyed store of connector records.
///
/// There is no shared in-memory state: each volume maps to its own file.
#[derive(Debug, Clone)]
pub struct ConnectorStore {
    dir: PathBuf,
}

impl ConnectorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the state directory if needed.
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    /// Deterministic record location for a volume.
    pub fn path_for(&self, volume_id: &VolumeId) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            RECORD_PREFIX,
            volume_id.file_stem(),
            RECORD_EXTENSION
        ))
    }

    /// Load a volume's record. A missing file is `Ok(None)`.
    pub fn load(&self, volume_id: &VolumeId) -> Result<Option<ConnectorRecord>, StoreError> {
        let path = self.path_for(volume_id);
        debug!(path = %path.display(), "Loading connector record");

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let record = serde_json::from_str(&content)
            .map_err(|source| StoreError::Corrupted { path, source })?;
        Ok(Some(record))
    }

    /// Write a record atomically.
    ///
    /// The record is written to a `.json.new` sibling, synced, then renamed
    /// over the final name so a crash never leaves a truncated record.
    pub fn save(&self, volume_id: &VolumeId, record: &ConnectorRecord) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let path = self.path_for(volume_id);
        let new_path = path.with_extension("json.new");
        let content = serde_json::to_string_pretty(record)?;

        let io_err = |source: io::Error| StoreError::Io {
            path: new_path.clone(),
            source,
        };

        let mut file = fs::File::create(&new_path).map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&new_path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        fs::rename(&new_path, &path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "Saved connector record");
        Ok(())
    }

    /// Delete a volume's record. Returns whether a file was removed.
    pub fn remove(&self, volume_id: &VolumeId) -> Result<bool, StoreError> {
        let path = self.path_for(volume_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted connector record");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
