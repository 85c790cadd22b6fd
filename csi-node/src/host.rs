//! Host inspection: initiator name and kernel modules.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// open-iscsi initiator configuration.
pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// Loaded kernel modules.
pub const PROC_MODULES: &str = "/proc/modules";

/// Kernel modules the node cannot attach volumes without.
pub const REQUIRED_KERNEL_MODULES: [&str; 2] = ["iscsi_tcp", "dm_multipath"];

const INITIATOR_NAME_KEY: &str = "InitiatorName";

#[derive(Error, Debug)]
pub enum HostError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("InitiatorName key is missing from {0}")]
    MissingInitiatorName(String),

    #[error("kernel module {0} is not loaded")]
    ModuleNotLoaded(String),
}

fn read(path: &Path) -> Result<String, HostError> {
    fs::read_to_string(path).map_err(|source| HostError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Extract the initiator name from `Key = Value` lines.
///
/// Lines starting with `#` are comments.
pub fn parse_initiator_name(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == INITIATOR_NAME_KEY)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Read the node's iSCSI initiator name, used as the CSI node ID.
pub fn read_initiator_name(path: &Path) -> Result<String, HostError> {
    let content = read(path)?;
    let name = parse_initiator_name(&content)
        .ok_or_else(|| HostError::MissingInitiatorName(path.display().to_string()))?;
    debug!(initiator_name = %name, "Read initiator name");
    Ok(name)
}

/// Module names from /proc/modules content (first column).
pub fn parse_modules(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub fn loaded_kernel_modules(proc_modules: &Path) -> Result<HashSet<String>, HostError> {
    Ok(parse_modules(&read(proc_modules)?))
}

/// Fail unless every module in [`REQUIRED_KERNEL_MODULES`] is loaded.
pub fn ensure_kernel_modules(proc_modules: &Path) -> Result<(), HostError> {
    let loaded = loaded_kernel_modules(proc_modules)?;
    for module in REQUIRED_KERNEL_MODULES {
        if !loaded.contains(module) {
            return Err(HostError::ModuleNotLoaded(module.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODULES: &str = "\
dm_multipath 45056 1 dm_round_robin, Live 0x0000000000000000
iscsi_tcp 24576 4 - Live 0x0000000000000000
libiscsi_tcp 32768 1 iscsi_tcp, Live 0x0000000000000000
";

    #[test]
    fn test_parse_initiator_name() {
        let content = "## DO NOT EDIT\n# InitiatorName=iqn.commented\nInitiatorName=iqn.1993-08.org.debian:01:abc\n";
        assert_eq!(
            parse_initiator_name(content).as_deref(),
            Some("iqn.1993-08.org.debian:01:abc")
        );
        assert_eq!(
            parse_initiator_name("InitiatorName = iqn.spaced:1 \n").as_deref(),
            Some("iqn.spaced:1")
        );
        assert_eq!(parse_initiator_name("InitiatorAlias=node1\n"), None);
        assert_eq!(parse_initiator_name("InitiatorName=\n"), None);
    }

    #[test]
    fn test_read_initiator_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("initiatorname.iscsi");

        assert!(matches!(
            read_initiator_name(&path),
            Err(HostError::Read { .. })
        ));

        fs::write(&path, "InitiatorAlias=node1\n").unwrap();
        assert!(matches!(
            read_initiator_name(&path),
            Err(HostError::MissingInitiatorName(_))
        ));

        fs::write(&path, "InitiatorName=iqn.node:1\n").unwrap();
        assert_eq!(read_initiator_name(&path).unwrap(), "iqn.node:1");
    }

    #[test]
    fn test_parse_modules() {
        let modules = parse_modules(MODULES);
        assert!(modules.contains("iscsi_tcp"));
        assert!(modules.contains("dm_multipath"));
        assert!(!modules.contains("dm_round_robin,"));
    }

    #[test]
    fn test_ensure_kernel_modules() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("modules");

        fs::write(&path, MODULES).unwrap();
        ensure_kernel_modules(&path).unwrap();

        fs::write(&path, "iscsi_tcp 24576 4 - Live 0x0\n").unwrap();
        match ensure_kernel_modules(&path) {
            Err(HostError::ModuleNotLoaded(module)) => assert_eq!(module, "dm_multipath"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
