//! Type-safe wrappers for CSI request parameters.
//!
//! Values arriving in `volume_context`, `publish_context` and the volume
//! capability are parsed once at the API boundary into these types, so the
//! lifecycle code never handles raw strings from the caller.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::csi;
use crate::error::NodeError;

/// Default iSCSI portal port.
pub const ISCSI_DEFAULT_PORT: u16 = 3260;

/// Highest LUN accepted from the publish context.
pub const MAX_LUN: u16 = 16383;

/// Volume context keys (camelCase first, snake_case accepted as well).
pub mod keys {
    pub const PORTALS: &str = "portals";
    pub const TARGET_IQN: &str = "targetIQN";
    pub const TARGET_IQN_ALT: &str = "target_iqn";
    pub const FS_TYPE: &str = "fsType";
    pub const FS_TYPE_ALT: &str = "fs_type";
    /// Publish context key carrying the logical unit number.
    pub const LUN: &str = "lun";
}

// ============================================================================
// VolumeId
// ============================================================================

/// Caller supplied volume identifier.
///
/// Never generated locally. It also names the volume's connector record on
/// disk, see [`VolumeId::file_stem`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Result<Self, NodeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(NodeError::InvalidArgument("Volume ID is required".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic, injective file name component for this ID.
    ///
    /// Bytes outside `[A-Za-z0-9._-]` are written as `%XX` so an ID can never
    /// introduce a path separator. A lone `.` or `..` is encoded as well.
    pub fn file_stem(&self) -> String {
        if self.0 == "." || self.0 == ".." {
            return self.0.bytes().map(|b| format!("%{:02X}", b)).collect();
        }

        let mut out = String::with_capacity(self.0.len());
        for b in self.0.bytes() {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{:02X}", b));
            }
        }
        out
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// FsType
// ============================================================================

/// Filesystem types this node agent can create, check and grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Ext3,
    /// Used when neither the volume context nor the capability names one
    #[default]
    Ext4,
    Xfs,
}

impl FsType {
    pub const fn as_str(self) -> &'static str {
        match self {
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        }
    }
}

impl Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = FsTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "ext4" => Ok(FsType::Ext4),
            "ext3" => Ok(FsType::Ext3),
            "xfs" => Ok(FsType::Xfs),
            _ => Err(FsTypeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unsupported filesystem type.
#[derive(Debug, Clone)]
pub struct FsTypeParseError(String);

impl Display for FsTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported filesystem type '{}': expected 'ext3', 'ext4' or 'xfs'",
            self.0
        )
    }
}

impl std::error::Error for FsTypeParseError {}

// ============================================================================
// Endpoint
// ============================================================================

/// An iSCSI portal (host:port).
///
/// The host can be an IP address (v4 or v6) or a hostname - no resolution is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host address (IP or hostname, not resolved)
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint with explicit host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Format as the portal string understood by iscsiadm and used in
    /// `/dev/disk/by-path` names. IPv6 hosts are bracketed.
    pub fn to_portal_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_portal_string())
    }
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid portal '{}': expected 'host:port' or 'host'", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

/// A list of portals for one target.
///
/// More than one portal means the target is reached over several paths and
/// the resulting device is expected to be a multipath aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    endpoints: Vec<Endpoint>,
}

impl Endpoints {
    /// Parse endpoints from a comma-separated string with a default port.
    ///
    /// # Examples
    /// - "10.0.0.1:3260,10.0.0.2:3260" → two endpoints with explicit ports
    /// - "10.0.0.1,10.0.0.2" → two endpoints with default port
    /// - "[::1]:3260" → IPv6 with port
    pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let mut endpoints = Vec::new();

        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let endpoint = Self::parse_single(part, default_port)?;
            endpoints.push(endpoint);
        }

        if endpoints.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }

        Ok(Self { endpoints })
    }

    fn parse_single(s: &str, default_port: u16) -> Result<Endpoint, EndpointParseError> {
        // [::1]:port
        if s.starts_with('[') {
            if let Some(bracket_end) = s.find(']') {
                let host = &s[1..bracket_end];
                let rest = &s[bracket_end + 1..];

                if rest.is_empty() {
                    return Ok(Endpoint::new(host, default_port));
                } else if let Some(port_str) = rest.strip_prefix(':') {
                    let port = port_str
                        .parse::<u16>()
                        .map_err(|_| EndpointParseError(s.to_string()))?;
                    return Ok(Endpoint::new(host, port));
                }
            }
            return Err(EndpointParseError(s.to_string()));
        }

        // A bare IPv6 address has several colons and no usable port
        if s.matches(':').count() == 1
            && let Some((host, port)) = s.split_once(':')
        {
            if host.is_empty() {
                return Err(EndpointParseError(s.to_string()));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointParseError(s.to_string()))?;
            return Ok(Endpoint::new(host, port));
        }

        Ok(Endpoint::new(s, default_port))
    }

    /// Portal strings in the order they were given.
    pub fn portal_strings(&self) -> Vec<String> {
        self.endpoints.iter().map(Endpoint::to_portal_string).collect()
    }
}

// ============================================================================
// IscsiTarget
// ============================================================================

/// The iSCSI target a volume is exposed on: IQN, portals and LUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiTarget {
    pub iqn: String,
    pub portals: Endpoints,
    pub lun: u16,
}

impl IscsiTarget {
    /// Build the target from the volume and publish contexts.
    pub fn from_contexts(
        volume_context: &HashMap<String, String>,
        publish_context: &HashMap<String, String>,
    ) -> Result<Self, NodeError> {
        let iqn = volume_context
            .get(keys::TARGET_IQN)
            .or_else(|| volume_context.get(keys::TARGET_IQN_ALT))
            .ok_or_else(|| {
                NodeError::InvalidArgument(format!(
                    "{} is required in volume context",
                    keys::TARGET_IQN
                ))
            })?;
        validate_target_name(iqn)?;

        let portals = volume_context.get(keys::PORTALS).ok_or_else(|| {
            NodeError::InvalidArgument(format!(
                "{} is required in volume context",
                keys::PORTALS
            ))
        })?;
        let portals = Endpoints::parse(portals, ISCSI_DEFAULT_PORT)
            .map_err(|e| NodeError::InvalidArgument(e.to_string()))?;

        let lun = publish_context.get(keys::LUN).ok_or_else(|| {
            NodeError::InvalidArgument(format!("{} is required in publish context", keys::LUN))
        })?;
        let lun = parse_lun(lun)?;

        Ok(Self {
            iqn: iqn.clone(),
            portals,
            lun,
        })
    }
}

fn parse_lun(value: &str) -> Result<u16, NodeError> {
    match value.trim().parse::<u16>() {
        Ok(lun) if lun <= MAX_LUN => Ok(lun),
        _ => Err(NodeError::InvalidArgument(format!(
            "invalid LUN '{}': expected an integer between 0 and {}",
            value, MAX_LUN
        ))),
    }
}

// ============================================================================
// MountSpec
// ============================================================================

/// How the volume should be mounted, derived from the volume capability,
/// the volume context and the readonly flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub fs_type: FsType,
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn from_request(
        capability: &csi::VolumeCapability,
        volume_context: &HashMap<String, String>,
        readonly: bool,
    ) -> Result<Self, NodeError> {
        let mount = match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => Some(mount),
            Some(csi::volume_capability::AccessType::Block(_)) => {
                return Err(NodeError::InvalidArgument(
                    "raw block volumes are not supported, use a mount access type".into(),
                ));
            }
            None => None,
        };

        let requested = volume_context
            .get(keys::FS_TYPE)
            .or_else(|| volume_context.get(keys::FS_TYPE_ALT))
            .map(String::as_str)
            .or_else(|| mount.map(|m| m.fs_type.as_str()))
            .unwrap_or("");
        let fs_type = requested
            .parse::<FsType>()
            .map_err(|e| NodeError::InvalidArgument(e.to_string()))?;

        let mut options: Vec<String> = mount.map(|m| m.mount_flags.clone()).unwrap_or_default();
        if readonly && !options.iter().any(|o| o == "ro") {
            options.push("ro".to_string());
        }

        Ok(Self { fs_type, options })
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validate that a path is safe to hand to external tools.
pub fn validate_path(path: &str) -> Result<PathBuf, NodeError> {
    if path.is_empty() {
        return Err(NodeError::InvalidArgument("Path cannot be empty".into()));
    }

    if !path.starts_with('/') {
        return Err(NodeError::InvalidArgument("Path must be absolute".into()));
    }

    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
    ];
    for c in dangerous_chars {
        if path.contains(c) {
            return Err(NodeError::InvalidArgument(format!(
                "Path contains dangerous character: '{}'",
                c
            )));
        }
    }

    if Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(NodeError::InvalidArgument(
            "Path cannot contain '..' (path traversal)".into(),
        ));
    }

    Ok(PathBuf::from(path))
}

/// Validate that an IQN is safe to use.
pub fn validate_target_name(target: &str) -> Result<(), NodeError> {
    if target.is_empty() {
        return Err(NodeError::InvalidArgument(
            "Target name cannot be empty".into(),
        ));
    }

    let valid = target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '-' || c == '_');

    if !valid {
        return Err(NodeError::InvalidArgument(
            "Target name contains invalid characters".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn mount_capability(fs_type: &str, flags: &[&str]) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: fs_type.to_string(),
                    mount_flags: flags.iter().map(|f| f.to_string()).collect(),
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: None,
        }
    }

    #[test]
    fn test_volume_id_rejects_empty() {
        assert!(VolumeId::new("").is_err());
        assert_eq!(VolumeId::new("pvc-1").unwrap().as_str(), "pvc-1");
    }

    #[test]
    fn test_volume_id_file_stem() {
        assert_eq!(VolumeId::new("pvc-1.a_b").unwrap().file_stem(), "pvc-1.a_b");
        assert_eq!(VolumeId::new("a/b").unwrap().file_stem(), "a%2Fb");
        assert_eq!(VolumeId::new("..").unwrap().file_stem(), "%2E%2E");
        assert_eq!(VolumeId::new("a%b").unwrap().file_stem(), "a%25b");
        // Distinct IDs never collide
        assert_ne!(
            VolumeId::new("a/b").unwrap().file_stem(),
            VolumeId::new("a%2Fb").unwrap().file_stem()
        );
    }

    #[test]
    fn test_fs_type_from_str() {
        assert_eq!("ext4".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("EXT4".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("ext3".parse::<FsType>().unwrap(), FsType::Ext3);
        assert_eq!("xfs".parse::<FsType>().unwrap(), FsType::Xfs);
        assert!("ntfs".parse::<FsType>().is_err());
        assert!("zfs".parse::<FsType>().is_err());
    }

    #[test]
    fn test_fs_type_display_and_serde() {
        assert_eq!(FsType::Xfs.to_string(), "xfs");
        assert_eq!(serde_json::to_string(&FsType::Ext4).unwrap(), "\"ext4\"");
        let parsed: FsType = serde_json::from_str("\"xfs\"").unwrap();
        assert_eq!(parsed, FsType::Xfs);
    }

    #[test]
    fn test_endpoints_parse_default_port() {
        let eps = Endpoints::parse("10.0.0.1,10.0.0.2", ISCSI_DEFAULT_PORT).unwrap();
        assert_eq!(
            eps.portal_strings(),
            vec!["10.0.0.1:3260".to_string(), "10.0.0.2:3260".to_string()]
        );
    }

    #[test]
    fn test_endpoints_parse_mixed_ports_and_whitespace() {
        let eps = Endpoints::parse("  10.0.0.1:3261 , 10.0.0.2  ", 3260).unwrap();
        assert_eq!(eps.portal_strings(), vec!["10.0.0.1:3261", "10.0.0.2:3260"]);
    }

    #[test]
    fn test_endpoints_parse_hostname() {
        let eps = Endpoints::parse("storage.example.com", 3260).unwrap();
        assert_eq!(eps.portal_strings(), vec!["storage.example.com:3260"]);
    }

    #[test]
    fn test_endpoints_parse_ipv6() {
        let eps = Endpoints::parse("[2001:db8::1]:3260", 9999).unwrap();
        assert_eq!(eps.portal_strings(), vec!["[2001:db8::1]:3260"]);

        let eps = Endpoints::parse("2001:db8::1", 3260).unwrap();
        assert_eq!(eps.portal_strings(), vec!["[2001:db8::1]:3260"]);
    }

    #[test]
    fn test_endpoints_parse_invalid() {
        assert!(Endpoints::parse("", 3260).is_err());
        assert!(Endpoints::parse(" , ", 3260).is_err());
        assert!(Endpoints::parse("10.0.0.1:notaport", 3260).is_err());
        assert!(Endpoints::parse("[::1", 3260).is_err());
    }

    #[test]
    fn test_target_from_contexts() {
        let target = IscsiTarget::from_contexts(
            &context(&[("portals", "10.0.0.1,10.0.0.2"), ("targetIQN", "iqn.test:tgt")]),
            &context(&[("lun", "3")]),
        )
        .unwrap();
        assert_eq!(target.iqn, "iqn.test:tgt");
        assert_eq!(target.lun, 3);
        assert_eq!(
            target.portals.portal_strings(),
            vec!["10.0.0.1:3260", "10.0.0.2:3260"]
        );
    }

    #[test]
    fn test_target_from_contexts_snake_case_iqn() {
        let target = IscsiTarget::from_contexts(
            &context(&[("portals", "10.0.0.1"), ("target_iqn", "iqn.test:tgt")]),
            &context(&[("lun", "0")]),
        )
        .unwrap();
        assert_eq!(target.iqn, "iqn.test:tgt");
    }

    #[test]
    fn test_target_from_contexts_missing_fields() {
        let publish = context(&[("lun", "1")]);
        let err = IscsiTarget::from_contexts(&context(&[("portals", "10.0.0.1")]), &publish)
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));

        let err = IscsiTarget::from_contexts(&context(&[("targetIQN", "iqn.a:b")]), &publish)
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));

        let err = IscsiTarget::from_contexts(
            &context(&[("portals", "10.0.0.1"), ("targetIQN", "iqn.a:b")]),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));
    }

    #[test]
    fn test_target_from_contexts_bad_lun() {
        let volume = context(&[("portals", "10.0.0.1"), ("targetIQN", "iqn.a:b")]);
        for lun in ["abc", "-1", "16384", ""] {
            let err = IscsiTarget::from_contexts(&volume, &context(&[("lun", lun)])).unwrap_err();
            assert!(matches!(err, NodeError::InvalidArgument(_)), "lun {lun:?}");
        }
    }

    #[test]
    fn test_mount_spec_fs_type_precedence() {
        let cap = mount_capability("xfs", &[]);
        let spec = MountSpec::from_request(&cap, &context(&[("fsType", "ext4")]), false).unwrap();
        assert_eq!(spec.fs_type, FsType::Ext4);

        let spec = MountSpec::from_request(&cap, &HashMap::new(), false).unwrap();
        assert_eq!(spec.fs_type, FsType::Xfs);

        let spec =
            MountSpec::from_request(&mount_capability("", &[]), &HashMap::new(), false).unwrap();
        assert_eq!(spec.fs_type, FsType::Ext4);
    }

    #[test]
    fn test_mount_spec_readonly_and_flags() {
        let cap = mount_capability("ext4", &["noatime"]);
        let spec = MountSpec::from_request(&cap, &HashMap::new(), true).unwrap();
        assert_eq!(spec.options, vec!["noatime".to_string(), "ro".to_string()]);
    }

    #[test]
    fn test_mount_spec_rejects_block_and_unknown_fs() {
        let block = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        assert!(MountSpec::from_request(&block, &HashMap::new(), false).is_err());

        let cap = mount_capability("btrfs", &[]);
        assert!(MountSpec::from_request(&cap, &HashMap::new(), false).is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/var/lib/kubelet/pods/x/volumes/mount").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("var/lib").is_err());
        assert!(validate_path("/var/../etc").is_err());
        assert!(validate_path("/var;ls").is_err());
        assert!(validate_path("/var$HOME").is_err());
        // Dots inside a component are fine
        assert!(validate_path("/mnt/pvc..1").is_ok());
    }

    #[test]
    fn test_validate_target_name() {
        assert!(validate_target_name("iqn.2015-11.com.example:01.ab-cd").is_ok());
        assert!(validate_target_name("").is_err());
        assert!(validate_target_name("iqn;rm -rf").is_err());
        assert!(validate_target_name("iqn$(id)").is_err());
    }
}
