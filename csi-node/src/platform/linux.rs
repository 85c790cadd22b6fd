//! Linux implementation of the platform capabilities
//!
//! Uses Linux-specific tools:
//! - iscsiadm for iSCSI discovery, login and logout (open-iscsi)
//! - multipath / multipathd for dm-multipath maps (multipath-tools)
//! - blkid, mkfs.*, e2fsck, xfs_repair, resize2fs, xfs_growfs
//! - mount, umount, mountpoint, findmnt (util-linux)

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{
    Attachment, BY_PATH_DIR, DeviceNaming, FilesystemTools, MountTools, SessionTools, ToolError,
    by_path_name, resolve_attachment,
};
use crate::connector::ConnectorRecord;
use crate::types::FsType;

const SYS_BLOCK_DIR: &str = "/sys/block";
const PROC_MOUNTS: &str = "/proc/mounts";

/// How long to wait for a logged-in LUN to show up under /dev/disk/by-path
const DEVICE_WAIT: Duration = Duration::from_secs(10);
const DEVICE_POLL: Duration = Duration::from_millis(250);

/// How long to wait for dm-multipath to claim the paths
const MULTIPATH_SETTLE: Duration = Duration::from_secs(3);
const SINGLE_PATH_SETTLE: Duration = Duration::from_secs(1);

/// blkid exit status when no requested tag could be found
const BLKID_NO_MATCH: i32 = 2;

/// Run a command and capture its output.
fn run(tool: &str, args: &[&str]) -> Result<Output, ToolError> {
    Command::new(tool).args(args).output().map_err(|e| {
        error!(error = %e, tool = %tool, "Failed to execute command");
        ToolError::Spawn {
            tool: tool.to_string(),
            source: e,
        }
    })
}

/// stdout followed by stderr, trimmed.
fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

/// Run a command and turn a non-zero exit into [`ToolError::Failed`].
fn run_checked(tool: &str, args: &[&str]) -> Result<Output, ToolError> {
    let output = run(tool, args)?;
    if !output.status.success() {
        let text = combined_output(&output);
        error!(tool = %tool, output = %text, "Command failed");
        return Err(ToolError::Failed {
            tool: tool.to_string(),
            output: text,
        });
    }
    Ok(output)
}

/// Kernel name of a device node ("/dev/sda" -> "sda").
fn kernel_name(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

// ============================================================================
// iSCSI sessions
// ============================================================================

/// Logging configuration of one session tools instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct IscsiLogging {
    /// Log the raw output of every iscsiadm/multipath invocation
    pub verbose: bool,
}

/// iSCSI sessions through open-iscsi and multipath-tools.
#[derive(Debug, Clone)]
pub struct LinuxSessions {
    logging: IscsiLogging,
    by_path_dir: PathBuf,
    sys_block_dir: PathBuf,
}

impl Default for LinuxSessions {
    fn default() -> Self {
        Self::new(IscsiLogging::default())
    }
}

impl LinuxSessions {
    pub fn new(logging: IscsiLogging) -> Self {
        Self::with_dirs(logging, BY_PATH_DIR, SYS_BLOCK_DIR)
    }

    /// Sessions that look up by-path links and sysfs under other roots.
    pub fn with_dirs(
        logging: IscsiLogging,
        by_path_dir: impl Into<PathBuf>,
        sys_block_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            logging,
            by_path_dir: by_path_dir.into(),
            sys_block_dir: sys_block_dir.into(),
        }
    }

    /// sysfs directory of a block device.
    fn sys_block(&self, device: &str) -> PathBuf {
        self.sys_block_dir.join(kernel_name(device))
    }

    fn trace_output(&self, step: &str, portal: &str, output: &Output) {
        if self.logging.verbose {
            debug!(
                step = %step,
                portal = %portal,
                status = ?output.status.code(),
                output = %combined_output(output),
                "iscsiadm output"
            );
        }
    }

    /// Run sendtargets discovery to populate the node database.
    ///
    /// Failures are only logged: the target may already be known.
    fn discover(&self, portal: &str) -> Result<(), ToolError> {
        let output = run(
            "iscsiadm",
            &["-m", "discovery", "-t", "sendtargets", "-p", portal],
        )?;
        self.trace_output("discovery", portal, &output);

        if !output.status.success() {
            warn!(
                output = %combined_output(&output),
                portal = %portal,
                "iscsiadm discovery returned error (may be expected if target already known)"
            );
        } else {
            info!(portal = %portal, "iSCSI discovery successful");
        }
        Ok(())
    }

    fn login_portal(&self, target_iqn: &str, portal: &str) -> Result<(), ToolError> {
        let output = run(
            "iscsiadm",
            &["-m", "node", "-T", target_iqn, "-p", portal, "--login"],
        )?;
        self.trace_output("login", portal, &output);

        if output.status.success() {
            info!(target_iqn = %target_iqn, portal = %portal, "iSCSI login successful");
            return Ok(());
        }

        let text = combined_output(&output);
        if text.contains("already present") || text.contains("session already exists") {
            info!(target_iqn = %target_iqn, portal = %portal, "iSCSI session already exists");
            return Ok(());
        }

        Err(ToolError::Failed {
            tool: "iscsiadm".to_string(),
            output: text,
        })
    }

    fn logout_portal(&self, target_iqn: &str, portal: &str) -> Result<bool, ToolError> {
        let output = run(
            "iscsiadm",
            &["-m", "node", "-T", target_iqn, "-p", portal, "--logout"],
        )?;
        self.trace_output("logout", portal, &output);

        if !output.status.success() {
            let text = combined_output(&output);
            if text.contains("No matching sessions") || text.contains("not logged in") {
                debug!(target_iqn = %target_iqn, portal = %portal, "iSCSI target was not logged in");
                return Ok(false);
            }
            error!(output = %text, "iscsiadm logout failed");
            return Err(ToolError::Failed {
                tool: "iscsiadm".to_string(),
                output: text,
            });
        }

        // Drop the node entry so the session is not restored on reboot
        let output = run(
            "iscsiadm",
            &["-m", "node", "-T", target_iqn, "-p", portal, "-o", "delete"],
        )?;
        self.trace_output("delete", portal, &output);

        Ok(true)
    }

    /// Wait for the by-path link of one portal/LUN and resolve it.
    ///
    /// Returns the link and the device it points to.
    fn wait_for_path(&self, target_iqn: &str, portal: &str, lun: u16) -> Option<(String, String)> {
        let link = self.by_path_dir.join(by_path_name(portal, target_iqn, lun));
        let deadline = Instant::now() + DEVICE_WAIT;

        loop {
            if let Some(device) = self.follow_link(&link) {
                return Some((link.to_string_lossy().into_owned(), device));
            }
            if Instant::now() >= deadline {
                warn!(link = %link.display(), "Device did not appear");
                return None;
            }
            thread::sleep(DEVICE_POLL);
        }
    }

    /// Wait for dm-multipath to claim one of the paths.
    fn wait_for_multipath(&self, devices: &[String], settle: Duration) -> Option<(String, String)> {
        let deadline = Instant::now() + settle;
        loop {
            if let Some(holder) = devices.iter().find_map(|d| self.multipath_holder(d)) {
                return Some(holder);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(DEVICE_POLL);
        }
    }

    fn flush_multipath(&self, map: &str) -> Result<(), ToolError> {
        if !Path::new("/dev/mapper").join(map).exists() {
            debug!(map = %map, "Multipath map already gone");
            return Ok(());
        }

        info!(map = %map, "Flushing multipath map");
        let output = run_checked("multipath", &["-f", map])?;
        self.trace_output("flush", map, &output);
        Ok(())
    }

    /// Remove a SCSI device from the kernel. Missing devices are skipped.
    fn delete_device(&self, device: &str) {
        let delete = self.sys_block(device).join("device/delete");
        if !delete.exists() {
            debug!(device = %device, "SCSI device already removed");
            return;
        }
        if let Err(e) = fs::write(&delete, "1") {
            warn!(error = %e, device = %device, "Could not delete SCSI device");
        }
    }
}

impl SessionTools for LinuxSessions {
    /// Connect to an iSCSI target through every portal.
    ///
    /// 1. Run sendtargets discovery against each portal
    /// 2. Login to the target via each portal
    /// 3. Wait for the LUN's by-path device of every logged in portal
    /// 4. Return the multipath map if dm-multipath claimed the paths
    fn login(
        &self,
        target_iqn: &str,
        portals: &[String],
        lun: u16,
    ) -> Result<Attachment, ToolError> {
        info!(
            target_iqn = %target_iqn,
            portals = ?portals,
            lun = lun,
            "Connecting to iSCSI target"
        );

        let mut logged_in = Vec::new();
        let mut last_error = None;

        for portal in portals {
            self.discover(portal)?;
            match self.login_portal(target_iqn, portal) {
                Ok(()) => logged_in.push(portal.as_str()),
                Err(e) => {
                    warn!(error = %e, portal = %portal, "iscsiadm login failed for portal");
                    last_error = Some(e);
                }
            }
        }

        if logged_in.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                ToolError::Failed {
                    tool: "iscsiadm".to_string(),
                    output: "no portal to log in to".to_string(),
                }
            }));
        }

        let (links, devices): (Vec<String>, Vec<String>) = logged_in
            .iter()
            .filter_map(|portal| self.wait_for_path(target_iqn, portal, lun))
            .unzip();

        if devices.is_empty() {
            return Err(ToolError::NotFound(format!(
                "no device appeared for {} lun {}",
                target_iqn, lun
            )));
        }

        let settle = if logged_in.len() > 1 {
            MULTIPATH_SETTLE
        } else {
            SINGLE_PATH_SETTLE
        };

        let wwid = devices.iter().find_map(|d| self.wwid(d));
        if wwid.is_none() {
            warn!(target_iqn = %target_iqn, lun = lun, "No WWID exposed for the LUN");
        }

        let attachment = match self.wait_for_multipath(&devices, settle) {
            Some((device_path, map)) => Attachment {
                device_path,
                devices,
                links,
                wwid,
                multipath: true,
                multipath_map: Some(map),
            },
            None => Attachment {
                device_path: devices[0].clone(),
                devices,
                links,
                wwid,
                multipath: false,
                multipath_map: None,
            },
        };

        info!(
            device = %attachment.device_path,
            wwid = ?attachment.wwid,
            multipath = attachment.multipath,
            paths = attachment.devices.len(),
            "iSCSI target connected"
        );
        Ok(attachment)
    }

    fn resolve(&self, record: &ConnectorRecord) -> Option<Attachment> {
        resolve_attachment(self, record)
    }

    fn rescan_device(&self, device: &str) -> Result<(), ToolError> {
        let rescan = self.sys_block(device).join("device/rescan");
        debug!(device = %device, "Rescanning SCSI device");
        fs::write(&rescan, "1").map_err(|e| {
            ToolError::Failed {
                tool: "rescan".to_string(),
                output: format!("{}: {}", rescan.display(), e),
            }
        })
    }

    fn resize_multipath(&self, map: &str) -> Result<(), ToolError> {
        info!(map = %map, "Resizing multipath map");
        let output = run_checked("multipathd", &["resize", "map", map])?;
        self.trace_output("resize", map, &output);

        // multipathd reports failures on stdout with a zero exit status
        let text = combined_output(&output);
        if text.contains("fail") {
            return Err(ToolError::Failed {
                tool: "multipathd".to_string(),
                output: text,
            });
        }
        Ok(())
    }

    fn logout(&self, record: &ConnectorRecord) -> Result<(), ToolError> {
        info!(target_iqn = %record.target_iqn, "Disconnecting from iSCSI target");

        match self.resolve(record) {
            Some(attachment) => {
                if let Some(map) = &attachment.multipath_map {
                    self.flush_multipath(map)?;
                }
                for device in &attachment.devices {
                    self.delete_device(device);
                }
            }
            None => debug!(
                target_iqn = %record.target_iqn,
                "Recorded devices are not present, skipping device removal"
            ),
        }

        let mut any_session = false;
        for portal in &record.portals {
            any_session |= self.logout_portal(&record.target_iqn, portal)?;
        }

        if !any_session {
            return Err(ToolError::NoSession(record.target_iqn.clone()));
        }
        Ok(())
    }
}

impl DeviceNaming for LinuxSessions {
    fn by_path_dir(&self) -> &Path {
        &self.by_path_dir
    }

    fn follow_link(&self, link: &Path) -> Option<String> {
        fs::canonicalize(link)
            .ok()
            .map(|device| device.to_string_lossy().into_owned())
    }

    fn wwid(&self, device: &str) -> Option<String> {
        let wwid = fs::read_to_string(self.sys_block(device).join("device/wwid")).ok()?;
        let wwid = wwid.trim();
        (!wwid.is_empty()).then(|| wwid.to_string())
    }

    /// Looks at <sys>/<device>/holders/ for a dm-* entry and reads the map's
    /// name from <sys>/dm-N/dm/name.
    fn multipath_holder(&self, device: &str) -> Option<(String, String)> {
        let entries = fs::read_dir(self.sys_block(device).join("holders")).ok()?;

        for entry in entries.flatten() {
            let holder = entry.file_name().to_string_lossy().to_string();
            if !holder.starts_with("dm-") {
                continue;
            }

            let name_path = self.sys_block_dir.join(&holder).join("dm/name");
            return match fs::read_to_string(&name_path) {
                Ok(name) if !name.trim().is_empty() => {
                    let name = name.trim().to_string();
                    Some((format!("/dev/mapper/{}", name), name))
                }
                // Fall back to the dm node if the map has no friendly name
                _ => Some((format!("/dev/{}", holder), holder)),
            };
        }

        None
    }
}

// ============================================================================
// Filesystems
// ============================================================================

/// Filesystem creation, checking and growing through e2fsprogs/xfsprogs.
#[derive(Debug, Clone, Default)]
pub struct LinuxFilesystems;

impl LinuxFilesystems {
    pub fn new() -> Self {
        Self
    }
}

impl FilesystemTools for LinuxFilesystems {
    fn read_signatures(&self, device: &str) -> Result<Option<String>, ToolError> {
        let output = run(
            "blkid",
            &[
                "-p",
                "--match-tag",
                "TYPE",
                "--match-tag",
                "PTTYPE",
                "--output",
                "export",
                device,
            ],
        )?;

        if output.status.code() == Some(BLKID_NO_MATCH) {
            debug!(device = %device, "blkid found no signature");
            return Ok(None);
        }

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: "blkid".to_string(),
                output: combined_output(&output),
            });
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn make_filesystem(&self, fs_type: FsType, device: &str) -> Result<(), ToolError> {
        info!(device = %device, fs_type = %fs_type, "Formatting device");
        let tool = format!("mkfs.{}", fs_type);
        run_checked(&tool, &[device])?;
        Ok(())
    }

    fn check_filesystem(&self, fs_type: FsType, device: &str) -> Result<(), ToolError> {
        info!(device = %device, fs_type = %fs_type, "Checking filesystem");
        match fs_type {
            FsType::Ext3 | FsType::Ext4 => run_checked("e2fsck", &["-n", device])?,
            FsType::Xfs => run_checked("xfs_repair", &["-n", device])?,
        };
        Ok(())
    }

    fn grow_filesystem(
        &self,
        fs_type: FsType,
        device: &str,
        mount_path: &Path,
    ) -> Result<(), ToolError> {
        info!(device = %device, fs_type = %fs_type, "Expanding filesystem");
        match fs_type {
            FsType::Ext3 | FsType::Ext4 => {
                run_checked("resize2fs", &[device])?;
            }
            FsType::Xfs => {
                let mount_path = mount_path.to_string_lossy();
                if mount_path.is_empty() {
                    return Err(ToolError::Failed {
                        tool: "xfs_growfs".to_string(),
                        output: "xfs can only be grown through its mount point".to_string(),
                    });
                }
                run_checked("xfs_growfs", &[&*mount_path])?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Mounts
// ============================================================================

/// Mount table access through util-linux and /proc/mounts.
#[derive(Debug, Clone)]
pub struct LinuxMounts {
    proc_mounts: PathBuf,
}

impl Default for LinuxMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxMounts {
    pub fn new() -> Self {
        Self {
            proc_mounts: PathBuf::from(PROC_MOUNTS),
        }
    }
}

/// Undo the octal escaping /proc/mounts applies to whitespace and backslashes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(code) = u8::from_str_radix(&field[i + 1..i + 4], 8)
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `target` appears as a mount point in /proc/mounts content.
fn mounts_contain(mounts: &str, target: &Path) -> bool {
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|point| Path::new(&unescape_mount_field(point)) == target)
    })
}

impl MountTools for LinuxMounts {
    fn mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: FsType,
        options: &[String],
    ) -> Result<(), ToolError> {
        let target = target.to_string_lossy();
        info!(device = %device, target = %target, fs_type = %fs_type, "Mounting device");

        let joined = options.join(",");
        let mut args = vec!["-t", fs_type.as_str()];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([device, &*target]);

        run_checked("mount", &args)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        let target = target.to_string_lossy();
        info!(target = %target, "Unmounting");

        let output = run("umount", &[&*target])?;
        if !output.status.success() {
            let text = combined_output(&output);
            if text.contains("not mounted") || text.contains("no mount point") {
                return Err(ToolError::NotMounted(target.to_string()));
            }
            error!(output = %text, "umount failed");
            return Err(ToolError::Failed {
                tool: "umount".to_string(),
                output: text,
            });
        }
        Ok(())
    }

    fn is_mount_point(&self, target: &Path) -> Result<bool, ToolError> {
        if let Ok(mounts) = fs::read_to_string(&self.proc_mounts) {
            return Ok(mounts_contain(&mounts, target));
        }

        // Fallback to mountpoint(1)
        let target = target.to_string_lossy();
        let output = run("mountpoint", &["-q", &*target])?;
        Ok(output.status.success())
    }

    fn is_device_in_use(&self, device: &str) -> Result<bool, ToolError> {
        let output = run("findmnt", &["--source", device])?;
        match output.status.code() {
            Some(0) => Ok(true),
            // findmnt exits 1 when nothing matched
            Some(1) => Ok(false),
            _ => Err(ToolError::Failed {
                tool: "findmnt".to_string(),
                output: combined_output(&output),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::RECORD_VERSION;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const IQN: &str = "iqn.test:tgt";
    const WWID: &str = "naa.6001405f3a1c9b2e7d4a8c6b5e0f1234";

    /// A by-path directory and a sysfs tree under one tempdir.
    struct Host {
        dir: TempDir,
        sessions: LinuxSessions,
    }

    impl Host {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            for sub in ["by-path", "dev", "sys"] {
                fs::create_dir(dir.path().join(sub)).unwrap();
            }
            let sessions = LinuxSessions::with_dirs(
                IscsiLogging::default(),
                dir.path().join("by-path"),
                dir.path().join("sys"),
            );
            Self { dir, sessions }
        }

        /// Create `name` with a WWID and a by-path link for portal and LUN.
        fn add_path(&self, name: &str, portal: &str, lun: u16, wwid: &str) -> String {
            let device = self.dir.path().join("dev").join(name);
            fs::write(&device, "").unwrap();
            self.set_wwid(name, wwid);
            let link = self.link(portal, lun);
            symlink(&device, &link).unwrap();
            fs::canonicalize(&device).unwrap().to_string_lossy().into_owned()
        }

        fn set_wwid(&self, name: &str, wwid: &str) {
            let sys = self.dir.path().join("sys").join(name).join("device");
            fs::create_dir_all(&sys).unwrap();
            fs::write(sys.join("wwid"), format!("{}\n", wwid)).unwrap();
        }

        fn hold(&self, name: &str, dm: &str, map: &str) {
            let holders = self.dir.path().join("sys").join(name).join("holders");
            fs::create_dir_all(holders.join(dm)).unwrap();
            let dm_dir = self.dir.path().join("sys").join(dm).join("dm");
            fs::create_dir_all(&dm_dir).unwrap();
            fs::write(dm_dir.join("name"), format!("{}\n", map)).unwrap();
        }

        fn link(&self, portal: &str, lun: u16) -> PathBuf {
            self.dir.path().join("by-path").join(by_path_name(portal, IQN, lun))
        }
    }

    fn record(portals: &[&str], links: Vec<String>, wwid: Option<&str>) -> ConnectorRecord {
        ConnectorRecord {
            version: RECORD_VERSION,
            volume_id: "pvc-1".to_string(),
            target_iqn: IQN.to_string(),
            portals: portals.iter().map(|p| p.to_string()).collect(),
            lun: 3,
            device_path: "/dev/sda".to_string(),
            devices: vec!["/dev/sda".to_string()],
            links,
            wwid: wwid.map(str::to_string),
            multipath: portals.len() > 1,
            multipath_map: None,
            fs_type: FsType::Ext4,
            target_path: PathBuf::from("/mnt/t"),
        }
    }

    #[test]
    fn test_resolve_follows_link_not_recorded_name() {
        let host = Host::new();
        let device = host.add_path("sdc", "10.0.0.1:3260", 3, WWID);
        let link = host.link("10.0.0.1:3260", 3).to_string_lossy().into_owned();

        let attachment = host
            .sessions
            .resolve(&record(&["10.0.0.1:3260"], vec![link.clone()], Some(WWID)))
            .unwrap();
        assert_eq!(attachment.device_path, device);
        assert_eq!(attachment.devices, vec![device]);
        assert_eq!(attachment.links, vec![link]);
        assert_eq!(attachment.wwid.as_deref(), Some(WWID));
        assert!(!attachment.multipath);
    }

    #[test]
    fn test_resolve_rejects_other_wwid() {
        let host = Host::new();
        host.add_path("sdc", "10.0.0.1:3260", 3, WWID);
        host.set_wwid("sdc", "naa.6001405000000000000000000000beef");
        let link = host.link("10.0.0.1:3260", 3).to_string_lossy().into_owned();

        let rec = record(&["10.0.0.1:3260"], vec![link], Some(WWID));
        assert_eq!(host.sessions.resolve(&rec), None);
    }

    #[test]
    fn test_resolve_existing_node_without_session() {
        let host = Host::new();
        // No link exists for the target, whatever the recorded name points at
        let mut rec = record(&["10.0.0.9:3260"], Vec::new(), None);
        rec.device_path = "/dev/null".to_string();
        rec.devices = vec!["/dev/null".to_string()];
        assert_eq!(host.sessions.resolve(&rec), None);
    }

    #[test]
    fn test_resolve_record_without_links_uses_portals() {
        let host = Host::new();
        let device = host.add_path("sdb", "10.0.0.1:3260", 3, WWID);

        let attachment = host
            .sessions
            .resolve(&record(&["10.0.0.1:3260"], Vec::new(), None))
            .unwrap();
        assert_eq!(attachment.device_path, device);
    }

    #[test]
    fn test_resolve_multipath_map() {
        let host = Host::new();
        host.add_path("sdb", "10.0.0.1:3260", 3, WWID);
        host.add_path("sdc", "10.0.0.2:3260", 3, WWID);
        let rec = record(&["10.0.0.1:3260", "10.0.0.2:3260"], Vec::new(), Some(WWID));

        // Paths without their map do not count as attached
        assert_eq!(host.sessions.resolve(&rec), None);

        host.hold("sdb", "dm-0", "mpathb");
        host.hold("sdc", "dm-0", "mpathb");
        let attachment = host.sessions.resolve(&rec).unwrap();
        assert_eq!(attachment.device_path, "/dev/mapper/mpathb");
        assert_eq!(attachment.multipath_map.as_deref(), Some("mpathb"));
        assert_eq!(attachment.devices.len(), 2);
    }

    #[test]
    fn test_resolve_skips_foreign_path() {
        let host = Host::new();
        let device = host.add_path("sdb", "10.0.0.1:3260", 3, WWID);
        host.add_path("sdc", "10.0.0.2:3260", 3, "naa.6001405000000000000000000000beef");
        let rec = record(&["10.0.0.1:3260", "10.0.0.2:3260"], Vec::new(), Some(WWID));

        host.hold("sdb", "dm-1", "mpatha");
        let attachment = host.sessions.resolve(&rec).unwrap();
        assert_eq!(attachment.devices, vec![device]);
    }

    #[test]
    fn test_kernel_name() {
        assert_eq!(kernel_name("/dev/sda"), "sda");
        assert_eq!(kernel_name("/dev/mapper/mpatha"), "mpatha");
        assert_eq!(kernel_name("sdb"), "sdb");
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount_field("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_mount_field("/mnt/tab\\011x"), "/mnt/tab\tx");
        assert_eq!(unescape_mount_field("/mnt/trailing\\"), "/mnt/trailing\\");
    }

    #[test]
    fn test_mounts_contain() {
        let mounts = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/mapper/mpatha /var/lib/kubelet/pods/x/volumes/pvc-1/mount ext4 rw 0 0
/dev/sdc /mnt/my\\040volume xfs rw 0 0
";
        assert!(mounts_contain(mounts, Path::new("/")));
        assert!(mounts_contain(
            mounts,
            Path::new("/var/lib/kubelet/pods/x/volumes/pvc-1/mount")
        ));
        assert!(mounts_contain(mounts, Path::new("/mnt/my volume")));
        assert!(!mounts_contain(mounts, Path::new("/var/lib/kubelet")));
        assert!(!mounts_contain(mounts, Path::new("/mnt/my")));
    }
}
