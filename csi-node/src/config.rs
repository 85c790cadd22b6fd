//! Runtime configuration of the node agent.

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::host;
use crate::lifecycle::PersistMode;
use crate::platform::IscsiLogging;

/// Default CSI endpoint, inside the kubelet plugin directory.
pub const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/san-iscsi.csi.io/csi.sock";

/// Default directory for connector records.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/kubelet/plugins/san-iscsi.csi.io";

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct ListenAddressParseError(String);

impl Display for ListenAddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid endpoint '{}': expected 'unix:///path/to/socket' or 'tcp://host:port'",
            self.0
        )
    }
}

impl std::error::Error for ListenAddressParseError {}

impl FromStr for ListenAddress {
    type Err = ListenAddressParseError;

    /// Accepts `unix:///path`, `unix:/path`, `tcp://addr:port` and a bare
    /// `addr:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ListenAddressParseError(s.to_string());

        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if !path.starts_with('/') {
                return Err(err());
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }

        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse::<SocketAddr>()
            .map(ListenAddress::Tcp)
            .map_err(|_| err())
    }
}

impl Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Everything the services are built from.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub endpoint: ListenAddress,
    /// Directory holding one connector record per attached volume
    pub state_dir: PathBuf,
    /// Source of the node ID
    pub initiator_name_file: PathBuf,
    /// Checked by the readiness RPC for the required kernel modules
    pub proc_modules: PathBuf,
    pub persist_mode: PersistMode,
    pub iscsi_logging: IscsiLogging,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: ListenAddress::Unix(PathBuf::from(
                DEFAULT_ENDPOINT.trim_start_matches("unix://"),
            )),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            initiator_name_file: PathBuf::from(host::INITIATOR_NAME_FILE),
            proc_modules: PathBuf::from(host::PROC_MODULES),
            persist_mode: PersistMode::default(),
            iscsi_logging: IscsiLogging::default(),
            metrics_addr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_endpoint() {
        assert_eq!(
            "unix:///csi/csi.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert_eq!(
            "unix:/csi/csi.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert!("unix://relative.sock".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn test_parse_tcp_endpoint() {
        let expected = ListenAddress::Tcp("127.0.0.1:10000".parse().unwrap());
        assert_eq!("tcp://127.0.0.1:10000".parse::<ListenAddress>().unwrap(), expected);
        assert_eq!("127.0.0.1:10000".parse::<ListenAddress>().unwrap(), expected);
        assert!("[::1]:10000".parse::<ListenAddress>().is_ok());
        assert!("localhost".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn test_default_endpoint_round_trips() {
        let config = NodeConfig::default();
        assert_eq!(config.endpoint.to_string(), DEFAULT_ENDPOINT);
        assert_eq!(
            DEFAULT_ENDPOINT.parse::<ListenAddress>().unwrap(),
            config.endpoint
        );
        assert_eq!(config.persist_mode, PersistMode::AfterConnect);
    }
}
