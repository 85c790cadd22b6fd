//! Volume lifecycle controller.
//!
//! Drives publish, unpublish and expand against the session manager, the
//! filesystem reconciler, the mount manager and the connector store. A
//! volume's state is never stored; [`VolumeLifecycle::observe`] derives it
//! from the connector record, the devices the record resolves to now and the
//! mount table on every call, which is what makes each operation safe to
//! repeat after a failure or a restart.
//!
//! All methods block on external tools and are meant to run on the blocking
//! thread pool.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::admission::AdmissionGate;
use crate::connector::{ConnectorRecord, ConnectorStore, StoreError};
use crate::error::NodeError;
use crate::filesystem::FilesystemReconciler;
use crate::mount::MountManager;
use crate::platform::{Attachment, Tools};
use crate::session::SessionManager;
use crate::types::{FsType, IscsiTarget, MountSpec, VolumeId};

/// When publish writes the connector record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Right after the session is established, before formatting and mounting
    #[default]
    AfterConnect,
    /// Only once the volume is mounted
    AfterMount,
}

/// Derived state of a volume on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// No connector record
    Detached,
    /// Connector record present, target not mounted
    Attached,
    /// Connector record present and target mounted
    Mounted,
}

/// Evidence gathered about one volume and target path.
#[derive(Debug, Clone)]
pub struct Observation {
    pub record: Option<ConnectorRecord>,
    /// The record's LUN under its current device names, if present
    pub attachment: Option<Attachment>,
    pub target_mounted: bool,
    /// Any device of the attachment is mounted somewhere on the host
    pub device_in_use: bool,
}

impl Observation {
    pub fn state(&self) -> VolumeState {
        match (&self.record, self.target_mounted) {
            (None, _) => VolumeState::Detached,
            (Some(_), false) => VolumeState::Attached,
            (Some(_), true) => VolumeState::Mounted,
        }
    }
}

/// A validated publish request.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub volume_id: VolumeId,
    pub target_path: PathBuf,
    pub target: IscsiTarget,
    pub mount: MountSpec,
}

pub struct VolumeLifecycle {
    store: ConnectorStore,
    sessions: SessionManager,
    filesystems: FilesystemReconciler,
    mounts: MountManager,
    gate: AdmissionGate,
    persist_mode: PersistMode,
}

impl VolumeLifecycle {
    pub fn new(
        tools: Tools,
        store: ConnectorStore,
        gate: AdmissionGate,
        persist_mode: PersistMode,
    ) -> Self {
        Self {
            store,
            sessions: SessionManager::new(tools.sessions),
            filesystems: FilesystemReconciler::new(tools.filesystems),
            mounts: MountManager::new(tools.mounts),
            gate,
            persist_mode,
        }
    }

    pub fn store(&self) -> &ConnectorStore {
        &self.store
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn persist_mode(&self) -> PersistMode {
        self.persist_mode
    }

    /// Load a record, treating an unreadable one as absent.
    fn load_record(&self, volume_id: &VolumeId) -> Result<Option<ConnectorRecord>, NodeError> {
        match self.store.load(volume_id) {
            Ok(record) => Ok(record),
            Err(e @ StoreError::Corrupted { .. }) => {
                warn!(error = %e, volume_id = %volume_id, "Ignoring corrupted connector record");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Gather everything the operations decide on.
    ///
    /// Without a `target` the target path stored in the record is checked.
    pub fn observe(
        &self,
        volume_id: &VolumeId,
        target: Option<&Path>,
    ) -> Result<Observation, NodeError> {
        let record = self.load_record(volume_id)?;
        let attachment = record.as_ref().and_then(|r| self.sessions.resolve(r));

        let target = target.or(record.as_ref().map(|r| r.target_path.as_path()));
        let target_mounted = match target {
            Some(path) => path.exists() && self.mounts.is_mount_point(path)?,
            None => false,
        };
        let device_in_use = attachment
            .as_ref()
            .is_some_and(|a| a.all_devices().any(|d| self.mounts.is_device_in_use(d)));

        debug!(
            volume_id = %volume_id,
            target = ?target,
            device = ?attachment.as_ref().map(|a| &a.device_path),
            target_mounted = target_mounted,
            device_in_use = device_in_use,
            "Observed volume"
        );
        Ok(Observation {
            record,
            attachment,
            target_mounted,
            device_in_use,
        })
    }

    fn persist(&self, volume_id: &VolumeId, record: &ConnectorRecord) -> Result<(), NodeError> {
        self.store.save(volume_id, record)?;
        Ok(())
    }

    /// Attach, format and mount a volume at its target path.
    ///
    /// Gated: returns [`NodeError::Busy`] immediately when another publish
    /// is in progress on this node.
    #[instrument(skip(self, request), fields(volume_id = %request.volume_id))]
    pub fn publish(&self, request: &PublishRequest) -> Result<(), NodeError> {
        let _permit = self.gate.try_enter()?;

        let observation = self.observe(&request.volume_id, Some(&request.target_path))?;
        if observation.state() == VolumeState::Mounted {
            info!(target = %request.target_path.display(), "Volume already published");
            return Ok(());
        }

        let existing = observation.record;
        let reusable = observation
            .attachment
            .filter(|_| existing.as_ref().is_some_and(|r| r.matches(&request.target)));
        let attachment = match reusable {
            Some(attachment) => {
                info!(device = %attachment.device_path, "Reusing recorded session");
                attachment
            }
            None => self.sessions.connect(&request.target)?,
        };

        let record = ConnectorRecord::new(
            &request.volume_id,
            &request.target,
            &attachment,
            request.mount.fs_type,
            &request.target_path,
        );
        let persist_now =
            self.persist_mode == PersistMode::AfterConnect || observation.target_mounted;
        if persist_now && existing.as_ref() != Some(&record) {
            self.persist(&request.volume_id, &record)?;
        }

        if observation.target_mounted {
            // Mounted by an earlier publish that died before recording it
            info!(target = %request.target_path.display(), "Target already mounted, recorded session");
            return Ok(());
        }

        self.filesystems
            .ensure_format(request.mount.fs_type, &attachment.device_path)?;
        self.filesystems.check_consistency(&attachment.device_path)?;
        self.mounts
            .bind_mount(&attachment.device_path, &request.target_path, &request.mount)?;

        if self.persist_mode == PersistMode::AfterMount {
            self.persist(&request.volume_id, &record)?;
        }

        info!(
            device = %attachment.device_path,
            target = %request.target_path.display(),
            "Volume published"
        );
        Ok(())
    }

    /// Unmount a volume and, unless its device is still in use, detach it.
    ///
    /// Idempotent: an unknown volume or a missing target is success.
    #[instrument(skip(self, target_path), fields(target = %target_path.display()))]
    pub fn unpublish(&self, volume_id: &VolumeId, target_path: &Path) -> Result<(), NodeError> {
        self.mounts.unbind_mount(target_path)?;

        let observation = self.observe(volume_id, Some(target_path))?;
        let Some(record) = observation.record else {
            info!("No connector record, volume already detached");
            return Ok(());
        };

        match &observation.attachment {
            Some(attachment) if observation.device_in_use => {
                info!(device = %attachment.device_path, "Device still in use, keeping session");
                return Ok(());
            }
            Some(attachment) => self.filesystems.check_consistency(&attachment.device_path)?,
            None => warn!(
                recorded = %record.device_path,
                "Recorded LUN is not present, skipping consistency check"
            ),
        }

        self.sessions.disconnect(&record)?;
        self.store.remove(volume_id)?;

        info!(target_iqn = %record.target_iqn, lun = record.lun, "Volume unpublished");
        Ok(())
    }

    /// Grow a published volume after the array resized its LUN.
    ///
    /// `volume_path` is where the volume is mounted; the recorded target
    /// path is used when the caller gives none.
    #[instrument(skip(self, volume_path))]
    pub fn expand(&self, volume_id: &VolumeId, volume_path: Option<&Path>) -> Result<(), NodeError> {
        let observation = self.observe(volume_id, volume_path)?;
        let Some(record) = &observation.record else {
            return Err(NodeError::Internal(format!(
                "no connector record for volume {}, is it published on this node?",
                volume_id
            )));
        };
        let Some(attachment) = &observation.attachment else {
            return Err(NodeError::Internal(format!(
                "LUN {} of {} for volume {} is not present on this node",
                record.lun, record.target_iqn, volume_id
            )));
        };

        let mount_path = volume_path.unwrap_or(record.target_path.as_path());
        if record.fs_type == FsType::Xfs && !observation.target_mounted {
            return Err(NodeError::FailedPrecondition(format!(
                "{} is not mounted, xfs can only be grown online",
                mount_path.display()
            )));
        }

        self.sessions.rescan_and_resize(attachment)?;
        self.filesystems
            .grow(record.fs_type, &attachment.device_path, mount_path)?;

        info!(device = %attachment.device_path, "Volume expanded");
        Ok(())
    }
}
