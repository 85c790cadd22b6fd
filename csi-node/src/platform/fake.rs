//! In-memory host used by unit and integration tests.
//!
//! Device names are deterministic: single-path logins hand out `/dev/sda`,
//! `/dev/sdb`, ... in order, and multi-portal logins additionally create
//! `/dev/mapper/mpatha`, `/dev/mapper/mpathb`, ... Like udev, every path also
//! gets a by-path link, and every LUN a WWID that survives
//! [`FakeHost::restart`], while the kernel names do not. Every mutating call
//! is appended to a log that tests can inspect with [`FakeHost::calls`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use super::{
    Attachment, BY_PATH_DIR, DeviceNaming, FilesystemTools, MountTools, SessionTools, ToolError,
    by_path_name, resolve_attachment,
};
use crate::connector::ConnectorRecord;
use crate::types::FsType;

/// On-disk signature of a fake device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Filesystem(String),
    PartitionTable(String),
}

#[derive(Debug, Clone)]
pub struct FakeMount {
    pub device: String,
    pub fs_type: FsType,
    pub options: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    next_disk: u8,
    next_map: u8,
    next_wwid: u32,
    /// Logged in sessions keyed by (iqn, lun)
    sessions: HashMap<(String, u16), Attachment>,
    /// by-path link -> device
    links: HashMap<String, String>,
    /// device -> WWID
    device_wwids: HashMap<String, String>,
    /// path device -> multipath map name
    holders: HashMap<String, String>,
    /// WWID the array reports for each (iqn, lun)
    lun_wwids: HashMap<(String, u16), String>,
    /// Data of LUNs that are not logged in, keyed by WWID
    lun_signatures: HashMap<String, Signature>,
    signatures: HashMap<String, Signature>,
    corrupt: HashSet<String>,
    mounts: HashMap<PathBuf, FakeMount>,
    /// Devices mounted by someone other than this agent
    foreign_mounts: HashSet<String>,
    unreachable: bool,
    fail_multipath_resize: bool,
    fail_rescan: bool,
    calls: Vec<String>,
    login_hold: Option<(Sender<()>, Receiver<()>)>,
}

/// Fake implementation of every platform capability.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test must not poison the others sharing the host
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutating calls seen so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of logged calls starting with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn set_signature(&self, device: &str, signature: Signature) {
        self.state()
            .signatures
            .insert(device.to_string(), signature);
    }

    /// Give `device` a filesystem as if someone had run mkfs on it.
    pub fn format_device(&self, device: &str, fs_type: &str) {
        self.set_signature(device, Signature::Filesystem(fs_type.to_string()));
    }

    pub fn signature(&self, device: &str) -> Option<Signature> {
        self.state().signatures.get(device).cloned()
    }

    /// Make consistency checks of `device` fail.
    pub fn mark_corrupt(&self, device: &str) {
        self.state().corrupt.insert(device.to_string());
    }

    /// Pretend `device` is mounted somewhere else on the host.
    pub fn mount_elsewhere(&self, device: &str) {
        self.state().foreign_mounts.insert(device.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn fail_multipath_resize(&self, fail: bool) {
        self.state().fail_multipath_resize = fail;
    }

    pub fn fail_rescan(&self, fail: bool) {
        self.state().fail_rescan = fail;
    }

    pub fn has_session(&self, iqn: &str, lun: u16) -> bool {
        self.state().sessions.contains_key(&(iqn.to_string(), lun))
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state().mounts.contains_key(target)
    }

    pub fn mount_at(&self, target: &Path) -> Option<FakeMount> {
        self.state().mounts.get(target).cloned()
    }

    /// Drop a session behind the agent's back. Its devices disappear.
    pub fn drop_session(&self, iqn: &str, lun: u16) {
        let mut state = self.state();
        if let Some(attachment) = state.sessions.remove(&(iqn.to_string(), lun)) {
            state.forget_devices(&attachment);
        }
    }

    /// Restart the host: every session and mount is gone and kernel names
    /// are handed out from `/dev/sda` and `mpatha` again. The data on each
    /// LUN is kept and shows up again on its next login.
    pub fn restart(&self) {
        let mut state = self.state();
        let sessions: Vec<Attachment> = state.sessions.drain().map(|(_, a)| a).collect();
        for attachment in &sessions {
            state.forget_devices(attachment);
        }
        state.signatures.clear();
        state.corrupt.clear();
        state.mounts.clear();
        state.foreign_mounts.clear();
        state.next_disk = 0;
        state.next_map = 0;
    }

    /// Have the array export a different volume under `iqn` and `lun`.
    pub fn remap_lun(&self, iqn: &str, lun: u16) {
        let mut state = self.state();
        let wwid = state.new_wwid();
        state.lun_wwids.insert((iqn.to_string(), lun), wwid.clone());
        if let Some(attachment) = state.sessions.get_mut(&(iqn.to_string(), lun)) {
            attachment.wwid = Some(wwid.clone());
            let devices = attachment.devices.clone();
            for device in devices {
                state.device_wwids.insert(device, wwid.clone());
            }
        }
    }

    /// Block the next login until the returned sender is used.
    ///
    /// The receiver fires once the login has started, which lets a test hold
    /// one publish inside the admission gate while issuing another.
    pub fn hold_next_login(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.state().login_hold = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

impl FakeState {
    fn new_wwid(&mut self) -> String {
        self.next_wwid += 1;
        format!("naa.6001405{:025x}", self.next_wwid)
    }

    fn lun_wwid(&mut self, iqn: &str, lun: u16) -> String {
        let key = (iqn.to_string(), lun);
        if let Some(wwid) = self.lun_wwids.get(&key) {
            return wwid.clone();
        }
        let wwid = self.new_wwid();
        self.lun_wwids.insert(key, wwid.clone());
        wwid
    }

    /// Remove the device nodes of an attachment, keeping the LUN's data.
    fn forget_devices(&mut self, attachment: &Attachment) {
        if let Some(wwid) = &attachment.wwid
            && let Some(signature) = self.signatures.remove(&attachment.device_path)
        {
            self.lun_signatures.insert(wwid.clone(), signature);
        }
        for link in &attachment.links {
            self.links.remove(link);
        }
        for device in &attachment.devices {
            self.device_wwids.remove(device);
            self.holders.remove(device);
            self.signatures.remove(device);
        }
    }
}

fn disk_name(index: u8) -> String {
    format!("/dev/sd{}", (b'a' + index % 26) as char)
}

fn map_name(index: u8) -> String {
    format!("mpath{}", (b'a' + index % 26) as char)
}

impl SessionTools for FakeHost {
    fn login(
        &self,
        target_iqn: &str,
        portals: &[String],
        lun: u16,
    ) -> Result<Attachment, ToolError> {
        self.record(format!("login {} lun {}", target_iqn, lun));

        let hold = self.state().login_hold.take();
        if let Some((entered, release)) = hold {
            let _ = entered.send(());
            let _ = release.recv();
        }

        let mut state = self.state();
        if state.unreachable {
            let portal = portals.first().map(String::as_str).unwrap_or("");
            return Err(ToolError::Failed {
                tool: "iscsiadm".to_string(),
                output: format!(
                    "iscsiadm: cannot make connection to {}: No route to host",
                    portal
                ),
            });
        }

        let key = (target_iqn.to_string(), lun);
        if let Some(existing) = state.sessions.get(&key) {
            return Ok(existing.clone());
        }

        let wwid = state.lun_wwid(target_iqn, lun);
        let mut devices = Vec::with_capacity(portals.len());
        let mut links = Vec::with_capacity(portals.len());
        for portal in portals {
            let device = disk_name(state.next_disk);
            state.next_disk += 1;
            let link = Path::new(BY_PATH_DIR)
                .join(by_path_name(portal, target_iqn, lun))
                .to_string_lossy()
                .into_owned();
            state.links.insert(link.clone(), device.clone());
            state.device_wwids.insert(device.clone(), wwid.clone());
            devices.push(device);
            links.push(link);
        }

        let attachment = if portals.len() > 1 {
            let map = map_name(state.next_map);
            state.next_map += 1;
            for device in &devices {
                state.holders.insert(device.clone(), map.clone());
            }
            Attachment {
                device_path: format!("/dev/mapper/{}", map),
                devices,
                links,
                wwid: Some(wwid.clone()),
                multipath: true,
                multipath_map: Some(map),
            }
        } else {
            Attachment {
                device_path: devices[0].clone(),
                devices,
                links,
                wwid: Some(wwid.clone()),
                multipath: false,
                multipath_map: None,
            }
        };

        if let Some(signature) = state.lun_signatures.remove(&wwid) {
            state
                .signatures
                .insert(attachment.device_path.clone(), signature);
        }
        state.sessions.insert(key, attachment.clone());
        Ok(attachment)
    }

    fn resolve(&self, record: &ConnectorRecord) -> Option<Attachment> {
        resolve_attachment(self, record)
    }

    fn rescan_device(&self, device: &str) -> Result<(), ToolError> {
        self.record(format!("rescan {}", device));
        if self.state().fail_rescan {
            return Err(ToolError::Failed {
                tool: "rescan".to_string(),
                output: format!("/sys/block/{}/device/rescan: No such file", device),
            });
        }
        Ok(())
    }

    fn resize_multipath(&self, map: &str) -> Result<(), ToolError> {
        self.record(format!("resize {}", map));
        if self.state().fail_multipath_resize {
            return Err(ToolError::Failed {
                tool: "multipathd".to_string(),
                output: "fail".to_string(),
            });
        }
        Ok(())
    }

    fn logout(&self, record: &ConnectorRecord) -> Result<(), ToolError> {
        if let Some(attachment) = self.resolve(record) {
            for device in &attachment.devices {
                self.record(format!("delete {}", device));
            }
        }

        self.record(format!("logout {} lun {}", record.target_iqn, record.lun));
        let mut state = self.state();
        let removed = state
            .sessions
            .remove(&(record.target_iqn.clone(), record.lun));
        if let Some(attachment) = &removed {
            state.forget_devices(attachment);
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(ToolError::NoSession(record.target_iqn.clone())),
        }
    }
}

impl DeviceNaming for FakeHost {
    fn by_path_dir(&self) -> &Path {
        Path::new(BY_PATH_DIR)
    }

    fn follow_link(&self, link: &Path) -> Option<String> {
        self.state().links.get(&*link.to_string_lossy()).cloned()
    }

    fn wwid(&self, device: &str) -> Option<String> {
        self.state().device_wwids.get(device).cloned()
    }

    fn multipath_holder(&self, device: &str) -> Option<(String, String)> {
        self.state()
            .holders
            .get(device)
            .map(|map| (format!("/dev/mapper/{}", map), map.clone()))
    }
}

impl FilesystemTools for FakeHost {
    fn read_signatures(&self, device: &str) -> Result<Option<String>, ToolError> {
        self.record(format!("blkid {}", device));
        let output = self.state().signatures.get(device).map(|sig| match sig {
            Signature::Filesystem(fs) => format!("DEVNAME={}\nTYPE={}\n", device, fs),
            Signature::PartitionTable(pt) => format!("DEVNAME={}\nPTTYPE=\"{}\"\n", device, pt),
        });
        Ok(output)
    }

    fn make_filesystem(&self, fs_type: FsType, device: &str) -> Result<(), ToolError> {
        self.record(format!("mkfs.{} {}", fs_type, device));
        self.state().signatures.insert(
            device.to_string(),
            Signature::Filesystem(fs_type.as_str().to_string()),
        );
        Ok(())
    }

    fn check_filesystem(&self, fs_type: FsType, device: &str) -> Result<(), ToolError> {
        self.record(format!("fsck.{} {}", fs_type, device));
        if self.state().corrupt.contains(device) {
            return Err(ToolError::Failed {
                tool: "e2fsck".to_string(),
                output: format!("{}: Bad magic number in super-block", device),
            });
        }
        Ok(())
    }

    fn grow_filesystem(
        &self,
        fs_type: FsType,
        device: &str,
        mount_path: &Path,
    ) -> Result<(), ToolError> {
        match fs_type {
            FsType::Xfs => self.record(format!("grow.xfs {}", mount_path.display())),
            _ => self.record(format!("grow.{} {}", fs_type, device)),
        }
        Ok(())
    }
}

impl MountTools for FakeHost {
    fn mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: FsType,
        options: &[String],
    ) -> Result<(), ToolError> {
        self.record(format!("mount {} {}", device, target.display()));
        if !target.is_dir() {
            return Err(ToolError::Failed {
                tool: "mount".to_string(),
                output: format!("mount: {}: mount point does not exist.", target.display()),
            });
        }
        self.state().mounts.insert(
            target.to_path_buf(),
            FakeMount {
                device: device.to_string(),
                fs_type,
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        self.record(format!("umount {}", target.display()));
        match self.state().mounts.remove(target) {
            Some(_) => Ok(()),
            None => Err(ToolError::NotMounted(target.display().to_string())),
        }
    }

    fn is_mount_point(&self, target: &Path) -> Result<bool, ToolError> {
        Ok(self.state().mounts.contains_key(target))
    }

    fn is_device_in_use(&self, device: &str) -> Result<bool, ToolError> {
        let state = self.state();
        Ok(state.foreign_mounts.contains(device)
            || state.mounts.values().any(|m| m.device == device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_devices() {
        let host = FakeHost::new();
        let single = host
            .login("iqn.a:1", &["10.0.0.1:3260".to_string()], 0)
            .unwrap();
        assert_eq!(single.device_path, "/dev/sda");
        assert!(!single.multipath);

        let multi = host
            .login(
                "iqn.a:2",
                &["10.0.0.1:3260".to_string(), "10.0.0.2:3260".to_string()],
                1,
            )
            .unwrap();
        assert_eq!(multi.device_path, "/dev/mapper/mpatha");
        assert_eq!(multi.devices, vec!["/dev/sdb", "/dev/sdc"]);
        assert_eq!(multi.multipath_map.as_deref(), Some("mpatha"));

        // Logging in again returns the existing session
        let again = host
            .login("iqn.a:1", &["10.0.0.1:3260".to_string()], 0)
            .unwrap();
        assert_eq!(again, single);
        assert_eq!(host.session_count(), 2);
    }

    #[test]
    fn test_restart_reassigns_names() {
        let host = FakeHost::new();
        let first = host
            .login("iqn.a:1", &["10.0.0.1:3260".to_string()], 0)
            .unwrap();
        host.format_device("/dev/sda", "ext4");

        host.restart();
        assert_eq!(host.session_count(), 0);
        assert_eq!(host.signature("/dev/sda"), None);

        let other = host
            .login("iqn.a:1", &["10.0.0.1:3260".to_string()], 5)
            .unwrap();
        assert_eq!(other.device_path, "/dev/sda");
        assert_ne!(other.wwid, first.wwid);

        // The first LUN keeps its WWID and its data under a new name
        let again = host
            .login("iqn.a:1", &["10.0.0.1:3260".to_string()], 0)
            .unwrap();
        assert_eq!(again.device_path, "/dev/sdb");
        assert_eq!(again.wwid, first.wwid);
        assert_eq!(
            host.signature("/dev/sdb"),
            Some(Signature::Filesystem("ext4".into()))
        );
    }

    #[test]
    fn test_signature_output() {
        let host = FakeHost::new();
        assert_eq!(host.read_signatures("/dev/sda").unwrap(), None);
        host.format_device("/dev/sda", "xfs");
        assert!(host.read_signatures("/dev/sda").unwrap().unwrap().contains("TYPE=xfs"));
    }

    #[test]
    fn test_mount_requires_directory() {
        let host = FakeHost::new();
        let err = host
            .mount("/dev/sda", Path::new("/nonexistent/target"), FsType::Ext4, &[])
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }
}
